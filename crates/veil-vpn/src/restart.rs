//! Restart Guard
//!
//! When the host tears the process down without an explicit Stop, the
//! guard may ask the host scheduler to relaunch the supervisor. The
//! relaunch intent carries only the remembered override URLs; the
//! relaunched instance re-resolves everything else. The request is
//! best-effort and the scheduler owes no acknowledgement.

use crate::config::ResolvedServers;
use std::sync::Arc;
use tracing::{debug, info};

/// Relaunch intent handed to the host scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaunchRequest {
    pub primary_url_override: Option<String>,
    pub secondary_url_override: Option<String>,
}

/// Host scheduler capable of relaunching the supervisor process.
pub trait HostScheduler: Send + Sync {
    /// Best-effort; may be silently dropped by the host.
    fn request_relaunch(&self, request: RelaunchRequest);
}

/// Decides whether an involuntary teardown becomes a relaunch request.
pub struct RestartGuard {
    scheduler: Arc<dyn HostScheduler>,
}

impl RestartGuard {
    pub fn new(scheduler: Arc<dyn HostScheduler>) -> Self {
        Self { scheduler }
    }

    /// Invoked on involuntary teardown. `keep_service_alive` is the
    /// host capability flag; without it no request is made.
    pub fn on_involuntary_teardown(
        &self,
        keep_service_alive: bool,
        servers: Option<&ResolvedServers>,
    ) {
        if !keep_service_alive {
            debug!("involuntary teardown, relaunch not permitted by host");
            return;
        }
        let request = RelaunchRequest {
            primary_url_override: servers.and_then(|s| s.primary_override.clone()),
            secondary_url_override: servers.and_then(|s| s.secondary_override.clone()),
        };
        info!(
            overridden = request.primary_url_override.is_some()
                || request.secondary_url_override.is_some(),
            "requesting relaunch after involuntary teardown"
        );
        self.scheduler.request_relaunch(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfigResolver, ServerOverrides};
    use crate::testutil::{MockScheduler, MockSettings};

    #[test]
    fn test_no_relaunch_without_capability() {
        let scheduler = Arc::new(MockScheduler::default());
        let guard = RestartGuard::new(scheduler.clone());

        guard.on_involuntary_teardown(false, None);

        assert!(scheduler.requests().is_empty());
    }

    #[test]
    fn test_relaunch_carries_overrides_only() {
        let scheduler = Arc::new(MockScheduler::default());
        let guard = RestartGuard::new(scheduler.clone());

        let resolver = ServerConfigResolver::new(Arc::new(MockSettings::default()));
        let payload = ServerOverrides {
            fetch_from_settings: false,
            primary_url: Some("https://override.example.com/q".into()),
            secondary_url: None,
        };
        let servers = resolver.resolve(Some(&payload), None).unwrap();

        guard.on_involuntary_teardown(true, Some(&servers));

        let requests = scheduler.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].primary_url_override.as_deref(),
            Some("https://override.example.com/q")
        );
        assert!(requests[0].secondary_url_override.is_none());
    }

    #[test]
    fn test_relaunch_without_overrides_is_empty() {
        let scheduler = Arc::new(MockScheduler::default());
        let guard = RestartGuard::new(scheduler.clone());

        let resolver = ServerConfigResolver::new(Arc::new(MockSettings::default()));
        let servers = resolver.resolve(None, None).unwrap();

        guard.on_involuntary_teardown(true, Some(&servers));

        assert_eq!(scheduler.requests()[0], RelaunchRequest::default());
    }
}
