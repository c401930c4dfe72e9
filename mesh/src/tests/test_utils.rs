//! Shared helpers for crate-internal tests.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Once},
    time::Duration,
};

use parking_lot::Mutex;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    allocator::{RefAllocation, RefAllocationsListener},
    cluster::ClusterCoordinator,
    config::{ClusterConfig, RetryConfig, TransportConfig},
    context::MeshContext,
    coordination::MemoryCoordinator,
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// Retry settings in the low milliseconds so failure paths finish quickly.
pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_retries: 5,
        cas_interval_ms: 5,
        cas_max_attempts: 20,
        counter_poll_ms: 5,
    }
}

pub(crate) fn fast_cluster_config(node_id: i16) -> ClusterConfig {
    ClusterConfig::new(node_id, "memory")
        .with_host_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_retry(fast_retry())
}

/// Loopback transport on an OS-assigned port.
pub(crate) fn loopback_transport() -> TransportConfig {
    TransportConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        server_port: 0,
        handshake_timeout_ms: 1_000,
        reconnect_interval_ms: 20,
        ..TransportConfig::default()
    }
}

/// Poll `condition` until it holds. Panics after five seconds.
pub(crate) async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A joined coordinator on `ensemble`.
pub(crate) async fn joined_member(
    ctx: &Arc<MeshContext>,
    ensemble: &MemoryCoordinator,
    config: ClusterConfig,
) -> Arc<ClusterCoordinator> {
    let member = ClusterCoordinator::new(ctx.clone(), config, ensemble.session())
        .expect("valid cluster config");
    member.join().await.expect("join");
    member
}

/// Records every allocation event it receives.
#[derive(Default)]
pub(crate) struct CollectingListener {
    pub ready: Mutex<u32>,
    pub ranges: Mutex<Vec<RefAllocation>>,
}

impl CollectingListener {
    pub fn ranges(&self) -> Vec<RefAllocation> {
        self.ranges.lock().clone()
    }
}

impl RefAllocationsListener for CollectingListener {
    fn counter_ready(&self) {
        *self.ready.lock() += 1;
    }

    fn refs_allocated(&self, base: i64, count: u32) {
        self.ranges.lock().push(RefAllocation { base, count });
    }
}
