#![allow(dead_code)]

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Routes `tracing` output through the test harness; set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bytes(b: &[u8]) -> Arc<[u8]> {
    Arc::from(b)
}
