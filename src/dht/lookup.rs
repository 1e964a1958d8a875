/// Iterative Lookup
///
/// The Kademlia lookup procedure shared by `find_node` and `find_value`:
/// maintain a shortlist sorted by XOR distance to the target, query up to α
/// unqueried peers per round in parallel, merge every returned node list back
/// into the shortlist, and stop when a round no longer improves the closest
/// peer seen or the K closest have all been queried.
///
/// Lookups tolerate arbitrary reordering and duplication of responses (the
/// endpoint matches by transaction id) and treat per-peer timeouts as negative
/// observations that count toward eviction. A lookup that cannot progress
/// returns the best result reachable from the current partition.
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tracing::trace;

use super::node_id::{NodeId, PeerHandle};
use super::rpc::{DhtMessage, RpcReply};
use super::Dht;
use crate::error::MeshResult;

/// Result of an iterative lookup
#[derive(Debug)]
pub enum LookupOutcome {
    /// The closest responsive peers found (for `find_node` and for
    /// `find_value` misses)
    Nodes(Vec<PeerHandle>),
    /// The value, plus the closest responding peer that did not have it
    /// (republication target)
    Value {
        value: Value,
        nearest_lacking: Option<PeerHandle>,
    },
}

#[derive(Debug, Clone)]
struct Candidate {
    handle: PeerHandle,
    queried: bool,
    failed: bool,
}

impl Dht {
    /// Iterative lookup toward `target`. With `value_key` set the rounds issue
    /// FIND_VALUE and return early on the first VALUE response; otherwise
    /// FIND_NODE.
    pub(crate) async fn iterative_find(
        &self,
        target: NodeId,
        value_key: Option<&str>,
    ) -> MeshResult<LookupOutcome> {
        let deadline = Instant::now() + self.lookup_timeout();
        let self_id = self.local_handle().node_id;

        let mut shortlist: Vec<Candidate> = self
            .routing()
            .closest(&target, self.replication_factor())
            .into_iter()
            .map(|handle| Candidate {
                handle,
                queried: false,
                failed: false,
            })
            .collect();

        let mut best = shortlist
            .first()
            .map(|c| c.handle.node_id.distance(&target));
        // Responders that answered FIND_VALUE with nodes instead of the value,
        // closest first; the nearest becomes the republication target.
        let mut lacking: Vec<PeerHandle> = Vec::new();

        loop {
            if Instant::now() >= deadline {
                trace!("Lookup for {} hit its deadline", target);
                break;
            }

            let batch: Vec<PeerHandle> = shortlist
                .iter()
                .filter(|c| !c.queried && !c.failed)
                .take(self.alpha())
                .map(|c| c.handle.clone())
                .collect();
            if batch.is_empty() {
                break;
            }
            for candidate in shortlist.iter_mut() {
                if batch.iter().any(|p| p.node_id == candidate.handle.node_id) {
                    candidate.queried = true;
                }
            }

            let peer_endpoints: Vec<String> = batch.iter().map(|peer| peer.endpoint()).collect();
            let requests = peer_endpoints.iter().map(|endpoint| {
                let message = match value_key {
                    Some(key) => DhtMessage::FindValue {
                        sender: self.local_handle(),
                        key: key.to_string(),
                    },
                    None => DhtMessage::FindNode {
                        sender: self.local_handle(),
                        target,
                    },
                };
                self.endpoint()
                    .request(endpoint, message, self.rpc_timeout())
            });
            let replies = join_all(requests).await;

            for (peer, reply) in batch.iter().zip(replies) {
                match reply {
                    Ok(RpcReply::Value { value, .. }) if value_key.is_some() => {
                        self.observe_peer(peer.clone());
                        lacking.sort_by_key(|p| p.node_id.distance(&target));
                        return Ok(LookupOutcome::Value {
                            value,
                            nearest_lacking: lacking.into_iter().next(),
                        });
                    }
                    Ok(RpcReply::Nodes(nodes)) => {
                        self.observe_peer(peer.clone());
                        if value_key.is_some() {
                            lacking.push(peer.clone());
                        }
                        for node in nodes {
                            if node.node_id == self_id {
                                continue;
                            }
                            if !shortlist
                                .iter()
                                .any(|c| c.handle.node_id == node.node_id)
                            {
                                shortlist.push(Candidate {
                                    handle: node,
                                    queried: false,
                                    failed: false,
                                });
                            }
                        }
                    }
                    Ok(_) => {
                        // A PONG or ACK here is a confused peer; count it as
                        // responsive but learn nothing.
                        self.observe_peer(peer.clone());
                    }
                    Err(_) => {
                        self.routing().note_failure(&peer.node_id);
                        if let Some(candidate) = shortlist
                            .iter_mut()
                            .find(|c| c.handle.node_id == peer.node_id)
                        {
                            candidate.failed = true;
                        }
                    }
                }
            }

            shortlist.sort_by_key(|c| c.handle.node_id.distance(&target));

            let round_best = shortlist
                .iter()
                .filter(|c| !c.failed)
                .map(|c| c.handle.node_id.distance(&target))
                .min();
            let improved = match (&best, &round_best) {
                (Some(previous), Some(current)) => current < previous,
                (None, Some(_)) => true,
                _ => false,
            };
            if improved {
                best = round_best;
                continue;
            }

            // No progress this round; stop once the K closest live candidates
            // have all been queried, otherwise give the tail one more round.
            let k_closest_done = shortlist
                .iter()
                .filter(|c| !c.failed)
                .take(self.replication_factor())
                .all(|c| c.queried);
            if k_closest_done {
                break;
            }
        }

        let closest: Vec<PeerHandle> = shortlist
            .iter()
            .filter(|c| c.queried && !c.failed)
            .take(self.replication_factor())
            .map(|c| c.handle.clone())
            .collect();
        Ok(LookupOutcome::Nodes(closest))
    }
}
