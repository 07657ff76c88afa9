//! # Tracing Setup
//!
//! Every component logs through `tracing` with structured fields (`actor`, `peer`, `member`,
//! `key`). Filtering is controlled by `RUST_LOG`:
//!
//! - `RUST_LOG=info` shows lifecycle, membership and dead letters
//! - `RUST_LOG=actor_cluster::cluster=debug` adds handshakes and association churn
//! - `RUST_LOG=trace` shows every message and every SWIM frame (very verbose)

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`. Panics if a global subscriber
/// is already installed; use [`try_setup_tracing`] where that can happen.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}

/// Like [`setup_tracing`], but a no-op when a subscriber is already installed. Tests call this
/// at the top of every case.
pub fn try_setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_test_writer()
        .try_init();
}
