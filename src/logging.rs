//! Tracing subscriber bootstrap

use tracing::Level;

/// Install a fmt subscriber at `level`. Later calls are no-ops, so tests
/// and embedding processes can call this freely.
pub fn init_tracing(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_level(true)
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(Level::DEBUG);
        init_tracing(Level::INFO);
        tracing::info!("subscriber installed");
    }
}
