//! Test doubles for the consumed host contracts.

use crate::config::{KnownResolver, ServerConfiguration, SettingsStore};
use crate::engine::{EngineFactory, QueryCountFn, TrafficSnapshot, TunnelEngine};
use crate::interface::InterfaceSpec;
use crate::notification::{NotificationContent, NotificationSink};
use crate::platform::{HostVpnPlatform, PackageRegistry, PlatformError, TunnelHandle};
use crate::restart::{HostScheduler, RelaunchRequest};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Route tracing output through the test harness capture. Idempotent;
/// later calls after the first subscriber wins are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct MockSettings {
    pub primary_url: String,
    pub secondary_url: Option<String>,
    pub dummy_v4: Ipv4Addr,
    pub dummy_v6: Ipv6Addr,
    pub bypass_packages: Vec<String>,
    pub catch_known_resolvers: bool,
    pub disallow_other_vpns: bool,
    pub cached_entries: u64,
    pub known_resolvers: Vec<KnownResolver>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            primary_url: "https://primary.example.com/dns-query".into(),
            secondary_url: Some("https://secondary.example.com/dns-query".into()),
            dummy_v4: Ipv4Addr::new(198, 51, 100, 53),
            dummy_v6: "fd00::53".parse().unwrap(),
            bypass_packages: vec!["com.example.bypass".into()],
            catch_known_resolvers: false,
            disallow_other_vpns: false,
            cached_entries: 12,
            known_resolvers: Vec::new(),
        }
    }
}

impl SettingsStore for MockSettings {
    fn primary_server(&self) -> ServerConfiguration {
        ServerConfiguration::simple(&self.primary_url).unwrap()
    }

    fn secondary_server(&self) -> Option<ServerConfiguration> {
        self.secondary_url
            .as_deref()
            .map(|url| ServerConfiguration::simple(url).unwrap())
    }

    fn dummy_dns_ipv4(&self) -> Ipv4Addr {
        self.dummy_v4
    }

    fn dummy_dns_ipv6(&self) -> Ipv6Addr {
        self.dummy_v6
    }

    fn bypass_packages(&self) -> Vec<String> {
        self.bypass_packages.clone()
    }

    fn catch_known_resolvers(&self) -> bool {
        self.catch_known_resolvers
    }

    fn disallow_other_vpns(&self) -> bool {
        self.disallow_other_vpns
    }

    fn cached_entry_count(&self) -> u64 {
        self.cached_entries
    }

    fn known_resolvers(&self) -> Vec<KnownResolver> {
        self.known_resolvers.clone()
    }
}

pub struct MockHandle;

impl TunnelHandle for MockHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Default)]
pub struct MockPlatform {
    reject_v4: AtomicBool,
    reject_v6: AtomicBool,
    fail_establish: AtomicBool,
    keep_alive: AtomicBool,
    v6_probes: AtomicUsize,
    establishes: AtomicUsize,
    stop_services: AtomicUsize,
    configure_flows: Mutex<Vec<(Option<String>, Option<String>)>>,
    pub established_specs: Mutex<Vec<InterfaceSpec>>,
}

impl MockPlatform {
    pub fn reject_ipv4(&self) {
        self.reject_v4.store(true, Ordering::Relaxed);
    }

    pub fn reject_ipv6(&self) {
        self.reject_v6.store(true, Ordering::Relaxed);
    }

    pub fn deny_permission(&self) {
        self.fail_establish.store(true, Ordering::Relaxed);
    }

    pub fn set_keep_service_alive(&self, value: bool) {
        self.keep_alive.store(value, Ordering::Relaxed);
    }

    pub fn ipv6_probe_count(&self) -> usize {
        self.v6_probes.load(Ordering::Relaxed)
    }

    pub fn establish_count(&self) -> usize {
        self.establishes.load(Ordering::Relaxed)
    }

    pub fn stop_service_count(&self) -> usize {
        self.stop_services.load(Ordering::Relaxed)
    }

    pub fn configure_flows(&self) -> Vec<(Option<String>, Option<String>)> {
        self.configure_flows.lock().unwrap().clone()
    }
}

impl HostVpnPlatform for MockPlatform {
    fn accepts_address(&self, addr: IpAddr, _prefix_len: u8) -> bool {
        match addr {
            IpAddr::V4(_) => !self.reject_v4.load(Ordering::Relaxed),
            IpAddr::V6(_) => {
                self.v6_probes.fetch_add(1, Ordering::Relaxed);
                !self.reject_v6.load(Ordering::Relaxed)
            }
        }
    }

    fn establish(&self, spec: &InterfaceSpec) -> Result<Arc<dyn TunnelHandle>, PlatformError> {
        if self.fail_establish.load(Ordering::Relaxed) {
            return Err(PlatformError::PermissionMissing);
        }
        self.establishes.fetch_add(1, Ordering::Relaxed);
        self.established_specs.lock().unwrap().push(spec.clone());
        Ok(Arc::new(MockHandle))
    }

    fn keep_service_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Relaxed)
    }

    fn stop_service(&self) {
        self.stop_services.fetch_add(1, Ordering::Relaxed);
    }

    fn request_configure_flow(
        &self,
        primary_url_override: Option<String>,
        secondary_url_override: Option<String>,
    ) {
        self.configure_flows
            .lock()
            .unwrap()
            .push((primary_url_override, secondary_url_override));
    }
}

/// Registry where everything is installed unless a list was given.
#[derive(Default)]
pub struct MockRegistry {
    installed: Option<Vec<String>>,
}

impl MockRegistry {
    pub fn with_installed(packages: &[&str]) -> Self {
        Self {
            installed: Some(packages.iter().map(|p| p.to_string()).collect()),
        }
    }
}

impl PackageRegistry for MockRegistry {
    fn is_installed(&self, package: &str) -> bool {
        self.installed
            .as_ref()
            .is_none_or(|list| list.iter().any(|p| p == package))
    }
}

/// Engine that idles until stopped and reports a preset query count.
pub struct MockEngine {
    queries_at_teardown: u64,
    panic_in_run: bool,
    stopped: AtomicBool,
    callback: QueryCountFn,
}

impl MockEngine {
    /// Push a query-count report through the supervisor's callback, as
    /// the real engine would from its own context.
    pub fn report(&self, count: u64) {
        (self.callback)(count);
    }
}

impl TunnelEngine for MockEngine {
    fn run(&self, handle: &dyn TunnelHandle) -> anyhow::Result<()> {
        // A real engine downcasts to the concrete host handle before
        // touching the device.
        if handle.as_any().downcast_ref::<MockHandle>().is_none() {
            anyhow::bail!("unexpected tunnel handle type");
        }
        if self.panic_in_run {
            panic!("injected engine fault");
        }
        while !self.stopped.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn traffic_stats(&self) -> Option<TrafficSnapshot> {
        Some(TrafficSnapshot {
            queries_from_device: self.queries_at_teardown,
            ..Default::default()
        })
    }
}

/// Factory handing out [`MockEngine`]s with preset teardown counts, in
/// order; engines past the preset list report zero.
#[derive(Default)]
pub struct MockEngineFactory {
    counts: Mutex<VecDeque<u64>>,
    engines: Mutex<Vec<Arc<MockEngine>>>,
    panic_next: AtomicBool,
}

impl MockEngineFactory {
    pub fn with_counts(counts: &[u64]) -> Self {
        Self {
            counts: Mutex::new(counts.iter().copied().collect()),
            engines: Mutex::new(Vec::new()),
            panic_next: AtomicBool::new(false),
        }
    }

    /// The next built engine panics inside `run`.
    pub fn panic_next_run(&self) {
        self.panic_next.store(true, Ordering::Relaxed);
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().unwrap().clone()
    }

    pub fn build_count(&self) -> usize {
        self.engines.lock().unwrap().len()
    }
}

impl EngineFactory for MockEngineFactory {
    fn build(
        &self,
        _servers: Vec<ServerConfiguration>,
        _connect_timeout_ms: u64,
        on_query_count: QueryCountFn,
    ) -> Arc<dyn TunnelEngine> {
        let queries = self.counts.lock().unwrap().pop_front().unwrap_or(0);
        let engine = Arc::new(MockEngine {
            queries_at_teardown: queries,
            panic_in_run: self.panic_next.swap(false, Ordering::Relaxed),
            stopped: AtomicBool::new(false),
            callback: on_query_count,
        });
        self.engines.lock().unwrap().push(Arc::clone(&engine));
        engine
    }
}

#[derive(Default)]
pub struct MockSink {
    published: Mutex<Vec<NotificationContent>>,
}

impl MockSink {
    pub fn published(&self) -> Vec<NotificationContent> {
        self.published.lock().unwrap().clone()
    }
}

impl NotificationSink for MockSink {
    fn publish(&self, content: NotificationContent) {
        self.published.lock().unwrap().push(content);
    }
}

#[derive(Default)]
pub struct MockScheduler {
    requests: Mutex<Vec<RelaunchRequest>>,
}

impl MockScheduler {
    pub fn requests(&self) -> Vec<RelaunchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HostScheduler for MockScheduler {
    fn request_relaunch(&self, request: RelaunchRequest) {
        self.requests.lock().unwrap().push(request);
    }
}
