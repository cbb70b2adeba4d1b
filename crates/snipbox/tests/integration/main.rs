//! Integration tests for snipbox
//!
//! These tests require the isolate binary to be installed and accessible.
//! Run with: cargo test -p snipbox --features integration-tests
//!
//! Tests that require root are marked `#[ignore]`. To include them:
//!    cargo test -p snipbox --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::sync::Arc;
use std::time::Duration;

use snipbox::config::Config;
use snipbox::{ExecutionEvent, ExecutionGateway, ExecutionResult, IsolateBackend, SessionId};

mod compile_and_run;
mod config_loading;
mod execution;
mod sandbox_lifecycle;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Create a test config with cgroup support if available, falling back to non-cgroup mode.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.pool.target_ready = 0;
    config.quota.burst = 100;
    config.quota.max_concurrent_per_session = 16;
    if config.cgroup {
        match snipbox::prepare_cgroup(&config.cg_root) {
            Ok(true) => {}              // cgroups ready
            _ => config.cgroup = false, // not available, fall back
        }
    }
    config
}

/// Gateway backed by real isolate boxes, starting at `first_box_id` so
/// concurrently running test modules do not share boxes
pub(crate) fn gateway(first_box_id: u32) -> ExecutionGateway {
    let mut config = test_config();
    config.pool.first_box_id = first_box_id;
    let gateway = ExecutionGateway::new(&config, Arc::new(IsolateBackend::from_config(&config)))
        .expect("Failed to build gateway");
    gateway.start();
    gateway
}

/// Submit a snippet and collect its result, along with the stdout chunks
/// streamed before it
pub(crate) async fn run(
    gateway: &ExecutionGateway,
    language: &str,
    source: &str,
    stdin: Option<&str>,
) -> (ExecutionResult, Vec<String>) {
    let submission = gateway
        .submit(
            SessionId::new("integration"),
            language,
            source.to_owned(),
            stdin.map(str::to_owned),
        )
        .expect("Submission rejected");
    let mut events = gateway
        .subscribe(&submission.request_id, 0)
        .expect("Request not tracked");

    let mut chunks = Vec::new();
    let mut result = None;
    while let Some(event) = events.next().await {
        match event.event {
            ExecutionEvent::Stdout { data } => chunks.push(data),
            ExecutionEvent::Finished(r) => result = Some(r),
            _ => {}
        }
    }
    (result.expect("No terminal event"), chunks)
}

pub(crate) async fn shutdown(gateway: ExecutionGateway) {
    gateway.shutdown(Duration::from_secs(5)).await;
}
