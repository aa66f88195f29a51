//! Session Supervisor
//!
//! Owns the lifecycle of exactly one tunnel: Idle until the first
//! establish, Active while the engine runs, Destroyed after teardown,
//! and back to Active only through a recreate. All session mutations are
//! serialized behind one async mutex because Stop/Restart commands can
//! race an in-flight establish, while the engine's blocking `run` lives
//! on its own blocking context so command dispatch stays responsive.
//!
//! # Ordering
//!
//! `destroy` stops and joins the engine and releases the platform handle
//! before any subsequent `establish` is allowed to proceed; an old and a
//! new tunnel never overlap. A restart arriving mid-teardown simply runs
//! once the in-progress destroy completes; nothing is queued.
//!
//! # Plain start vs. parallel restart
//!
//! The host may deliver a plain start and an explicit restart in
//! parallel; upstream ordering between the two is undefined. Both
//! serialize on the state mutex and run in lock-acquisition order.

use crate::command::{Command, Dispatch};
use crate::config::{
    ConfigError, ResolvedServers, ServerConfigResolver, ServerOverrides, SettingsStore,
};
use crate::engine::{
    CONNECT_TIMEOUT_MS, EngineFactory, QueryCountFn, TrafficSnapshot, TunnelEngine,
};
use crate::interface::{BuildError, InterfaceBuilder};
use crate::notification::{NotificationSink, StatusInput, render_status};
use crate::platform::{HostVpnPlatform, PackageRegistry, PlatformError, TunnelHandle};
use crate::restart::{HostScheduler, RestartGuard};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Session label the host shows for the interface.
const SESSION_NAME: &str = "veil-vpn";
/// Delay before a revocation asks for a fresh configuration flow.
const CONFIGURE_FLOW_DELAY: Duration = Duration::from_millis(250);
/// Bound of the engine-to-presenter query report channel. Reports past
/// a full buffer are dropped, never blocked on.
const QUERY_REPORT_CAPACITY: usize = 32;

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("interface build failed: {0}")]
    Build(#[from] BuildError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("no server configuration resolved")]
    NotConfigured,
}

/// Lifecycle broadcasts to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnLifecycleEvent {
    /// Establish completed and the engine is running
    Active,
    /// Destroy completed
    Inactive,
}

/// State shared with the presenter task and stats readers.
///
/// Single writer (the supervisor), multiple readers. Readers must
/// tolerate `traffic` being absent between a destroy and the next
/// successful establish.
#[derive(Default)]
struct SessionShared {
    query_count_offset: AtomicU64,
    servers: RwLock<Option<ResolvedServers>>,
    traffic: RwLock<Option<TrafficSnapshot>>,
}

/// One established tunnel: the engine, its blocking runner, and the
/// platform handle keeping the interface alive.
struct ActiveSession {
    engine: Arc<dyn TunnelEngine>,
    handle: Arc<dyn TunnelHandle>,
    runner: JoinHandle<()>,
}

/// Mutable session record, owned exclusively by the supervisor and
/// guarded by its state mutex.
struct SessionState {
    session: Option<ActiveSession>,
    destroyed: bool,
    /// Set once Stop or a revocation asked the host to end the process;
    /// later starts and commands are ignored.
    stop_requested: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            session: None,
            destroyed: false,
            stop_requested: false,
        }
    }
}

/// The tunnel lifecycle state machine.
pub struct SessionSupervisor {
    platform: Arc<dyn HostVpnPlatform>,
    settings: Arc<dyn SettingsStore>,
    packages: Arc<dyn PackageRegistry>,
    engines: Arc<dyn EngineFactory>,
    resolver: ServerConfigResolver,
    restart_guard: RestartGuard,
    shared: Arc<SessionShared>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<VpnLifecycleEvent>,
    query_reports: mpsc::Sender<u64>,
}

impl SessionSupervisor {
    /// Create a supervisor and spawn its presenter task. Must be called
    /// from within a tokio runtime.
    pub fn new(
        platform: Arc<dyn HostVpnPlatform>,
        settings: Arc<dyn SettingsStore>,
        packages: Arc<dyn PackageRegistry>,
        engines: Arc<dyn EngineFactory>,
        scheduler: Arc<dyn HostScheduler>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (query_reports, reports_rx) = mpsc::channel(QUERY_REPORT_CAPACITY);
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(SessionShared::default());

        Self::spawn_presenter(
            reports_rx,
            Arc::clone(&shared),
            Arc::clone(&settings),
            sink,
        );

        Self {
            platform,
            settings: Arc::clone(&settings),
            packages,
            engines,
            resolver: ServerConfigResolver::new(settings),
            restart_guard: RestartGuard::new(scheduler),
            shared,
            state: Mutex::new(SessionState::new()),
            events,
            query_reports,
        }
    }

    /// Subscribe to lifecycle broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<VpnLifecycleEvent> {
        self.events.subscribe()
    }

    /// Current traffic counters; absent between destroy and the next
    /// establish.
    pub fn traffic_stats(&self) -> Option<TrafficSnapshot> {
        *self.shared.traffic.read().unwrap()
    }

    /// Cumulative forwarded-query count carried across restarts.
    pub fn query_count_offset(&self) -> u64 {
        self.shared.query_count_offset.load(Ordering::Relaxed)
    }

    /// The currently resolved servers, if any.
    pub fn current_servers(&self) -> Option<ResolvedServers> {
        self.shared.servers.read().unwrap().clone()
    }

    /// Whether a live tunnel exists right now.
    pub async fn has_active_tunnel(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// Whether the session has been torn down.
    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.destroyed
    }

    /// Single dispatch entry point for host envelopes. Malformed
    /// payloads are ignored without a state transition.
    pub async fn dispatch(&self, payload: &str) -> Result<(), SupervisorError> {
        match Dispatch::decode(payload) {
            Some(Dispatch::Start {
                primary_url_override,
                secondary_url_override,
            }) => self.start(primary_url_override, secondary_url_override).await,
            Some(Dispatch::Command(command)) => self.handle_command(command).await,
            None => Ok(()),
        }
    }

    /// Start the tunnel. Resolves server configuration when none exists
    /// yet (or after a teardown), then establishes. No-op while a
    /// tunnel is already active.
    pub async fn start(
        &self,
        primary_url_override: Option<String>,
        secondary_url_override: Option<String>,
    ) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if state.stop_requested {
            debug!("start ignored, stop already requested");
            return Ok(());
        }
        if state.session.is_some() {
            debug!("start ignored, tunnel already active");
            return Ok(());
        }

        let unconfigured = self.shared.servers.read().unwrap().is_none();
        if state.destroyed || unconfigured {
            let payload = (primary_url_override.is_some() || secondary_url_override.is_some())
                .then(|| ServerOverrides {
                    fetch_from_settings: false,
                    primary_url: primary_url_override,
                    secondary_url: secondary_url_override,
                });
            self.resolve_servers(payload.as_ref())?;
        }

        self.establish_locked(&mut state).await
    }

    /// Handle an explicit command.
    pub async fn handle_command(&self, command: Command) -> Result<(), SupervisorError> {
        match command {
            Command::Stop => {
                info!("stop command received");
                let mut state = self.state.lock().await;
                self.destroy_locked(&mut state).await;
                state.stop_requested = true;
                self.platform.stop_service();
                Ok(())
            }
            Command::Restart {
                fetch_from_settings,
                primary_url_override,
                secondary_url_override,
            } => {
                let mut state = self.state.lock().await;
                if state.stop_requested {
                    debug!("restart ignored, stop already requested");
                    return Ok(());
                }
                let payload = ServerOverrides {
                    fetch_from_settings,
                    primary_url: primary_url_override,
                    secondary_url: secondary_url_override,
                };
                if !payload.is_empty() {
                    self.resolve_servers(Some(&payload))?;
                }
                self.recreate_locked(&mut state).await
            }
        }
    }

    /// Tear the tunnel down. Idempotent; always safe to call
    /// redundantly, and the designated recovery path before a fresh
    /// establish.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        self.destroy_locked(&mut state).await;
    }

    /// Host revoked the tunnel permission. Tears down and asks the host
    /// to stop the process. When other VPNs are disallowed, also
    /// requests a fresh configuration flow seeded with the active
    /// overrides after a short delay.
    pub async fn on_revoke(&self) {
        warn!("tunnel permission revoked by host");
        let (primary_override, secondary_override) = {
            let servers = self.shared.servers.read().unwrap();
            servers
                .as_ref()
                .map(|s| (s.primary_override.clone(), s.secondary_override.clone()))
                .unwrap_or((None, None))
        };

        {
            let mut state = self.state.lock().await;
            self.destroy_locked(&mut state).await;
            state.stop_requested = true;
        }
        self.platform.stop_service();

        if self.settings.disallow_other_vpns() {
            let platform = Arc::clone(&self.platform);
            tokio::spawn(async move {
                tokio::time::sleep(CONFIGURE_FLOW_DELAY).await;
                platform.request_configure_flow(primary_override, secondary_override);
            });
        }
    }

    /// Ordinary host-driven process teardown. When the tunnel is still
    /// up, the restart guard may request a relaunch carrying the
    /// remembered overrides; the teardown itself proceeds regardless.
    pub async fn on_host_teardown(&self) {
        let mut state = self.state.lock().await;
        if !state.destroyed {
            let servers = self.shared.servers.read().unwrap().clone();
            self.restart_guard
                .on_involuntary_teardown(self.platform.keep_service_alive(), servers.as_ref());
        }
        self.destroy_locked(&mut state).await;
    }

    fn resolve_servers(&self, payload: Option<&ServerOverrides>) -> Result<(), ConfigError> {
        let prior = self.shared.servers.read().unwrap().clone();
        let resolved = self.resolver.resolve(payload, prior.as_ref())?;
        info!(primary = %resolved.primary.base_url(), "using resolved server configuration");
        *self.shared.servers.write().unwrap() = Some(resolved);
        Ok(())
    }

    /// Establish the tunnel. Guarded by "no live tunnel": a no-op while
    /// a session exists.
    async fn establish_locked(&self, state: &mut SessionState) -> Result<(), SupervisorError> {
        if state.session.is_some() {
            return Ok(());
        }
        let servers = self
            .shared
            .servers
            .read()
            .unwrap()
            .clone()
            .ok_or(SupervisorError::NotConfigured)?;

        let spec = InterfaceBuilder::new(
            self.settings.as_ref(),
            self.platform.as_ref(),
            self.packages.as_ref(),
            SESSION_NAME,
        )
        .build()?;
        let handle = self.platform.establish(&spec)?;

        let reports = self.query_reports.clone();
        let on_query_count: QueryCountFn = Arc::new(move |count| {
            // Engine context; must never block the packet path.
            let _ = reports.try_send(count);
        });
        let engine = self
            .engines
            .build(servers.server_list(), CONNECT_TIMEOUT_MS, on_query_count);

        let run_engine = Arc::clone(&engine);
        let run_handle = Arc::clone(&handle);
        let runner = tokio::task::spawn_blocking(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                run_engine.run(run_handle.as_ref())
            }));
            match outcome {
                Ok(Ok(())) => debug!("tunnel engine stopped"),
                Ok(Err(err)) => error!(error = %err, "tunnel engine exited with failure"),
                Err(panic) => {
                    // Log, then keep the fault visible to the process-wide
                    // handler chain instead of swallowing it here.
                    error!("tunnel engine panicked");
                    std::panic::resume_unwind(panic);
                }
            }
        });

        *self.shared.traffic.write().unwrap() =
            Some(engine.traffic_stats().unwrap_or_default());
        state.session = Some(ActiveSession {
            engine,
            handle,
            runner,
        });
        state.destroyed = false;

        let _ = self.events.send(VpnLifecycleEvent::Active);
        let _ = self.query_reports.try_send(0);
        info!("tunnel established");
        Ok(())
    }

    /// Destroy then establish, resetting the destroyed flag in between.
    /// The only transition out of Destroyed.
    async fn recreate_locked(&self, state: &mut SessionState) -> Result<(), SupervisorError> {
        self.destroy_locked(state).await;
        state.destroyed = false;
        self.establish_locked(state).await
    }

    /// First call folds the engine's query count into the offset, stops
    /// and joins the engine, and releases the platform handle. Later
    /// calls are no-ops until a recreate clears the flag.
    async fn destroy_locked(&self, state: &mut SessionState) {
        if !state.destroyed {
            if let Some(session) = state.session.take() {
                let last = session
                    .engine
                    .traffic_stats()
                    .map(|s| s.queries_from_device)
                    .unwrap_or(0);
                self.shared
                    .query_count_offset
                    .fetch_add(last, Ordering::Relaxed);

                session.engine.stop();
                match session.runner.await {
                    Ok(()) => {}
                    Err(err) if err.is_cancelled() => {}
                    // Panics were already logged and re-raised on the
                    // engine context.
                    Err(_) => trace!("engine runner ended abnormally"),
                }
                drop(session.handle);
            }
            state.destroyed = true;
            let _ = self.events.send(VpnLifecycleEvent::Inactive);
            info!(
                query_count_offset = self.query_count_offset(),
                "tunnel destroyed"
            );
        }
        *self.shared.traffic.write().unwrap() = None;
    }

    /// Presenter task: drains query reports and republishes the status
    /// text, decoupled from engine packet timing.
    fn spawn_presenter(
        mut reports: mpsc::Receiver<u64>,
        shared: Arc<SessionShared>,
        settings: Arc<dyn SettingsStore>,
        sink: Arc<dyn NotificationSink>,
    ) {
        tokio::spawn(async move {
            while let Some(count) = reports.recv().await {
                if let Some(snapshot) = shared.traffic.write().unwrap().as_mut() {
                    snapshot.queries_from_device = count;
                }
                let servers = shared.servers.read().unwrap().clone();
                let Some(servers) = servers else {
                    trace!("query report before configuration, skipping");
                    continue;
                };
                let content = render_status(&StatusInput {
                    primary: &servers.primary,
                    secondary: servers.secondary.as_ref(),
                    bypass_package_count: settings.bypass_packages().len(),
                    cached_entry_count: settings.cached_entry_count(),
                    query_count: count,
                    query_count_offset: shared.query_count_offset.load(Ordering::Relaxed),
                });
                sink.publish(content);
            }
        });
    }
}
