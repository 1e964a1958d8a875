use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the logging system for the chunkmesh node
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log level based on debug/release build
        if cfg!(debug_assertions) {
            EnvFilter::new("chunkmesh=debug")
        } else {
            EnvFilter::new("chunkmesh=info")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

/// Initialize logging with fallback behavior if setup fails
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!(
            "Warning: failed to set up structured logging: {}. Continuing without it.",
            e
        );
    }
}

/// Log file store operations
pub fn log_file_operation(operation: &str, digest: &str, details: &str) {
    info!(target: "chunkmesh::store", "{} {}: {}", operation, digest, details);
}

/// Log network events
pub fn log_network_event(event: &str, details: &str) {
    info!(target: "chunkmesh::net", "{}: {}", event, details);
}

/// Log error with context
pub fn log_error_with_context(context: &str, error: &dyn std::error::Error) {
    error!(target: "chunkmesh::error", "{}: {}", context, error);
}
