/// DHT Tests
///
/// Identifier arithmetic, k-bucket behaviour, the TTL'd local store, and
/// small live overlays exercising bootstrap, publication and lookup.
use std::time::Duration;

use chunkmesh::config::Config;
use chunkmesh::dht::node_id::{NodeId, PeerHandle};
use chunkmesh::dht::routing_table::{ObserveOutcome, RoutingTable};
use chunkmesh::dht::store::DhtStore;
use chunkmesh::dht::Dht;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn handle(id_byte: u8, port: u16) -> PeerHandle {
    let mut bytes = [0u8; 20];
    bytes[19] = id_byte;
    PeerHandle::new(NodeId::from_bytes(bytes), "127.0.0.1".to_string(), port)
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.dht.rpc_timeout_secs = 1;
    config.dht.lookup_timeout_secs = 5;
    config.dht.ttl_secs = 60;
    config
}

async fn start_node(config: &Config) -> std::sync::Arc<Dht> {
    Dht::start(
        NodeId::random(),
        "127.0.0.1:0".parse().unwrap(),
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

// ---------------------------------------------------------------------------------------------------
// Identifier arithmetic
// ---------------------------------------------------------------------------------------------------

#[test]
fn distance_is_symmetric_and_zero_to_self() {
    let a = NodeId::random();
    let b = NodeId::random();
    assert_eq!(a.distance(&b), b.distance(&a));
    assert!(a.distance(&a) <= a.distance(&b));
}

#[test]
fn bucket_index_matches_highest_differing_bit() {
    let zero = NodeId::from_bytes([0u8; 20]);

    let mut one = [0u8; 20];
    one[19] = 0b0000_0001;
    assert_eq!(zero.bucket_index(&NodeId::from_bytes(one)), Some(0));

    let mut high = [0u8; 20];
    high[0] = 0b1000_0000;
    assert_eq!(zero.bucket_index(&NodeId::from_bytes(high)), Some(159));

    assert_eq!(zero.bucket_index(&zero), None);
}

#[test]
fn key_derivation_is_deterministic_and_distinct() {
    let a = NodeId::from_key("chunk:aabbcc");
    let b = NodeId::from_key("chunk:aabbcc");
    let c = NodeId::from_key("file:aabbcc");
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn random_in_bucket_lands_in_that_bucket() {
    let local = NodeId::random();
    for bucket in [0usize, 7, 63, 128, 159] {
        let target = local.random_in_bucket(bucket);
        assert_eq!(local.bucket_index(&target), Some(bucket));
    }
}

#[test]
fn hex_round_trip() {
    let id = NodeId::random();
    assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
    assert_eq!(id.to_hex().len(), 40);
}

// ---------------------------------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------------------------------

#[test]
fn observe_inserts_new_peers_and_refreshes_known_ones() {
    let local = NodeId::from_bytes([0u8; 20]);
    let table = RoutingTable::new(local, 4);

    for i in 1..=4u8 {
        let outcome = table.observe(handle(i, 9000 + i as u16));
        assert!(matches!(outcome, ObserveOutcome::Inserted));
    }

    // Seeing a known peer again (possibly at a new address) refreshes it.
    let outcome = table.observe(handle(1, 9100));
    assert!(matches!(outcome, ObserveOutcome::Refreshed));
    assert_eq!(table.len(), 4);
}

#[test]
fn full_bucket_reports_least_recently_seen() {
    let local = NodeId::from_bytes([0u8; 20]);
    let table = RoutingTable::new(local, 2);

    // Ids 4..8 all have their highest set bit at position 2: one bucket.
    assert!(matches!(table.observe(handle(4, 1)), ObserveOutcome::Inserted));
    assert!(matches!(table.observe(handle(5, 2)), ObserveOutcome::Inserted));

    match table.observe(handle(6, 3)) {
        ObserveOutcome::BucketFull {
            least_recently_seen,
            newcomer,
        } => {
            assert_eq!(least_recently_seen.node_id, handle(4, 1).node_id);
            assert_eq!(newcomer.node_id, handle(6, 3).node_id);
        }
        other => panic!("expected BucketFull, got {:?}", other),
    }

    // Replacing the stale entry admits the newcomer.
    table.replace(&handle(4, 1).node_id, handle(6, 3));
    let closest = table.closest(&handle(6, 3).node_id, 4);
    assert!(closest.iter().any(|p| p.node_id == handle(6, 3).node_id));
    assert!(!closest.iter().any(|p| p.node_id == handle(4, 1).node_id));
}

#[test]
fn three_failures_evict_a_peer() {
    let local = NodeId::from_bytes([0u8; 20]);
    let table = RoutingTable::new(local, 4);
    let peer = handle(9, 1);
    table.observe(peer.clone());

    table.note_failure(&peer.node_id);
    table.note_failure(&peer.node_id);
    assert_eq!(table.len(), 1);
    table.note_failure(&peer.node_id);
    assert_eq!(table.len(), 0);
}

#[test]
fn a_success_resets_the_failure_count() {
    let local = NodeId::from_bytes([0u8; 20]);
    let table = RoutingTable::new(local, 4);
    let peer = handle(9, 1);
    table.observe(peer.clone());

    table.note_failure(&peer.node_id);
    table.note_failure(&peer.node_id);
    table.observe(peer.clone());
    table.note_failure(&peer.node_id);
    table.note_failure(&peer.node_id);
    assert_eq!(table.len(), 1, "two failures after a success must not evict");
}

#[test]
fn closest_sorts_by_xor_distance() {
    let local = NodeId::from_bytes([0u8; 20]);
    let table = RoutingTable::new(local, 20);
    for i in [1u8, 2, 4, 8, 16, 32] {
        table.observe(handle(i, i as u16));
    }

    let target = handle(3, 0).node_id;
    let closest = table.closest(&target, 3);
    assert_eq!(closest.len(), 3);
    // 2 xor 3 = 1, 1 xor 3 = 2, 4 xor 3 = 7: expected order 2, 1, 4.
    assert_eq!(closest[0].node_id, handle(2, 0).node_id);
    assert_eq!(closest[1].node_id, handle(1, 0).node_id);
    assert_eq!(closest[2].node_id, handle(4, 0).node_id);
}

// ---------------------------------------------------------------------------------------------------
// Local key/value store
// ---------------------------------------------------------------------------------------------------

#[test]
fn store_inserts_and_expires() {
    let store = DhtStore::new(1024);
    store.insert("file:abc", json!({"size": 1}), Duration::from_millis(20));
    assert!(store.get("file:abc").is_some());

    std::thread::sleep(Duration::from_millis(40));
    assert!(store.get("file:abc").is_none());
    assert_eq!(store.sweep(), 1);
    assert!(store.is_empty());
}

#[test]
fn provider_lists_merge_instead_of_overwriting() {
    let store = DhtStore::new(1024);
    let a = handle(1, 9001);
    let b = handle(2, 9002);

    store.insert("chunk:abc", json!([a]), Duration::from_secs(60));
    store.insert("chunk:abc", json!([b]), Duration::from_secs(60));

    let merged: Vec<PeerHandle> =
        serde_json::from_value(store.get("chunk:abc").unwrap()).unwrap();
    assert_eq!(merged.len(), 2);
    assert!(merged.iter().any(|h| h.node_id == a.node_id));
    assert!(merged.iter().any(|h| h.node_id == b.node_id));
}

#[test]
fn non_list_values_are_last_writer_wins() {
    let store = DhtStore::new(1024);
    store.insert("file:abc", json!({"v": 1}), Duration::from_secs(60));
    store.insert("file:abc", json!({"v": 2}), Duration::from_secs(60));
    assert_eq!(store.get("file:abc").unwrap()["v"], 2);
}

// ---------------------------------------------------------------------------------------------------
// Live overlays
// ---------------------------------------------------------------------------------------------------

#[tokio::test]
async fn single_node_set_and_get_do_not_hang() {
    let config = fast_config();
    let node = start_node(&config).await;

    node.set("file:solo", json!({"size": 9})).await.unwrap();
    let value = node.get("file:solo").await.unwrap();
    assert_eq!(value.unwrap()["size"], 9);

    // A lookup for an unknown key in a single-node network returns quickly.
    let missing = tokio::time::timeout(Duration::from_secs(10), node.get("file:missing"))
        .await
        .expect("single-node lookup must not hang")
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn two_nodes_replicate_and_look_up() {
    let config = fast_config();
    let n1 = start_node(&config).await;

    let mut config2 = fast_config();
    config2.dht.bootstrap_peers = vec![n1.local_addr().to_string()];
    let n2 = start_node(&config2).await;
    n2.bootstrap().await.unwrap();

    // Publication from n2 reaches n1 (K = 20 covers both nodes).
    let acked = n2.set("chunk:shared", json!([n2.local_handle()])).await.unwrap();
    assert!(acked >= 1, "expected at least one remote ACK, got {}", acked);

    let seen = n1.get("chunk:shared").await.unwrap();
    assert!(seen.is_some());

    // And n2 can find what n1 publishes, through the overlay.
    n1.set("file:from-n1", json!({"origin": "n1"})).await.unwrap();
    let fetched = n2.get("file:from-n1").await.unwrap();
    assert_eq!(fetched.unwrap()["origin"], "n1");
}

#[tokio::test]
async fn third_node_discovers_through_the_overlay() {
    let config = fast_config();
    let n1 = start_node(&config).await;

    let mut config2 = fast_config();
    config2.dht.bootstrap_peers = vec![n1.local_addr().to_string()];
    let n2 = start_node(&config2).await;
    n2.bootstrap().await.unwrap();

    n2.set("file:deep", json!({"hop": 2})).await.unwrap();

    // n3 bootstraps only against n1 but must still find n2's key.
    let mut config3 = fast_config();
    config3.dht.bootstrap_peers = vec![n1.local_addr().to_string()];
    let n3 = start_node(&config3).await;
    n3.bootstrap().await.unwrap();

    let value = n3.get("file:deep").await.unwrap();
    assert_eq!(value.unwrap()["hop"], 2);
}

#[tokio::test]
async fn ping_learns_the_peer_handle() {
    let config = fast_config();
    let n1 = start_node(&config).await;
    let n2 = start_node(&config).await;

    let learned = n2.ping(&n1.local_addr().to_string()).await.unwrap();
    assert_eq!(learned.node_id, n1.local_handle().node_id);
}

#[tokio::test]
async fn ping_times_out_against_nobody() {
    let mut config = fast_config();
    config.dht.rpc_timeout_secs = 1;
    let node = start_node(&config).await;

    // An address nothing listens on: bind a socket, note the port, drop it.
    let dead = {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    };

    let started = std::time::Instant::now();
    assert!(node.ping(&dead.to_string()).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
}
