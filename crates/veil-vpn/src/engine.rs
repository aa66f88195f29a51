//! Tunnel Engine Contract
//!
//! The DoH resolution/forwarding engine is external to this crate. The
//! supervisor only decides when an engine exists and on which execution
//! context its blocking `run` call lives.

use crate::config::ServerConfiguration;
use crate::platform::TunnelHandle;
use std::sync::Arc;

/// Engine connect timeout handed to every engine build.
pub const CONNECT_TIMEOUT_MS: u64 = 500;

/// Callback invoked from the engine's own context with the current
/// forwarded-query count. Must not block the packet path.
pub type QueryCountFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Point-in-time traffic counters for one engine run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// DNS queries read from the device (the notification query count)
    pub queries_from_device: u64,
    /// Responses written back to the device
    pub responses_to_device: u64,
    /// Bytes read from the device
    pub bytes_from_device: u64,
    /// Bytes written back to the device
    pub bytes_to_device: u64,
}

/// A running (or runnable) tunnel engine.
///
/// `run` blocks until the engine is stopped or fails fatally, so the
/// supervisor executes it on a dedicated blocking context.
pub trait TunnelEngine: Send + Sync {
    /// Forward traffic from the interface until stopped. Blocking.
    fn run(&self, handle: &dyn TunnelHandle) -> anyhow::Result<()>;

    /// Request cooperative shutdown; `run` returns afterwards.
    fn stop(&self);

    /// Current traffic counters, absent before the first run.
    fn traffic_stats(&self) -> Option<TrafficSnapshot>;
}

/// Builds engines for the supervisor; one engine per establish.
pub trait EngineFactory: Send + Sync {
    /// `servers` is the ordered 1–2 entry upstream list.
    fn build(
        &self,
        servers: Vec<ServerConfiguration>,
        connect_timeout_ms: u64,
        on_query_count: QueryCountFn,
    ) -> Arc<dyn TunnelEngine>;
}
