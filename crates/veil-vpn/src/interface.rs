//! Virtual Interface Construction
//!
//! Builds the [`InterfaceSpec`] handed to the host's tunnel API. The
//! build is deterministic given the settings and the platform's address
//! acceptance answers:
//!
//! 1. IPv4: first accepted candidate prefix wins, fixed fallback if all
//!    are rejected (rejections are non-fatal).
//! 2. IPv6: random local /48 address, up to 5 attempts, fatal after 5.
//! 3. Optional host routes capturing every known public resolver.
//! 4. Dummy DNS sentinels with matching host routes, both address
//!    families, blocking I/O.
//! 5. Bypass packages filtered down to those actually installed.

use crate::config::SettingsStore;
use crate::platform::{HostVpnPlatform, PackageRegistry};
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Host suffix appended to each candidate IPv4 prefix.
const IPV4_HOST_SUFFIX: &str = "134";
/// Fallback when every candidate prefix is rejected.
const IPV4_FALLBACK: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 10);
const IPV4_PREFIX_LEN: u8 = 24;
const IPV6_PREFIX_LEN: u8 = 48;
/// Binding attempts before an IPv6 rejection becomes fatal.
const IPV6_MAX_ATTEMPTS: usize = 5;

/// Interface build errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no usable IPv6 interface address after {attempts} attempts")]
    Ipv6AddressRejected { attempts: usize },
}

/// Address families the interface may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Fully-resolved interface description.
///
/// Built fresh on every establish and handed to the platform as-is;
/// never mutated in place afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// Session label shown by the host
    pub session_name: String,
    /// Local addresses with prefix lengths
    pub addresses: Vec<(IpAddr, u8)>,
    /// Captured routes with prefix lengths
    pub routes: Vec<(IpAddr, u8)>,
    /// DNS servers advertised to the device
    pub dns_servers: Vec<IpAddr>,
    /// Allowed address families
    pub allowed_families: Vec<AddressFamily>,
    /// Synchronous interface I/O
    pub blocking: bool,
    /// Packages excluded from the tunnel
    pub disallowed_applications: Vec<String>,
}

impl InterfaceSpec {
    fn empty(session_name: &str) -> Self {
        Self {
            session_name: session_name.to_string(),
            addresses: Vec::new(),
            routes: Vec::new(),
            dns_servers: Vec::new(),
            allowed_families: Vec::new(),
            blocking: false,
            disallowed_applications: Vec::new(),
        }
    }

    /// Whether a host route for `addr` is present.
    pub fn has_route(&self, addr: IpAddr) -> bool {
        self.routes.iter().any(|(route, _)| *route == addr)
    }
}

/// Generate a random unique-local IPv6 address (fd00::/8) suitable for
/// a /48 assignment.
pub fn random_local_ipv6() -> Ipv6Addr {
    let mut rng = rand::thread_rng();
    let global_id: u64 = rng.r#gen::<u64>() & 0xff_ffff_ffff; // 40 bits
    let interface_id: u64 = rng.r#gen();

    Ipv6Addr::new(
        0xfd00 | ((global_id >> 32) as u16 & 0x00ff),
        (global_id >> 16) as u16,
        global_id as u16,
        0,
        (interface_id >> 48) as u16,
        (interface_id >> 32) as u16,
        (interface_id >> 16) as u16,
        interface_id as u16,
    )
}

/// Builds interface specs from settings plus the platform's address
/// acceptance probe.
pub struct InterfaceBuilder<'a> {
    settings: &'a dyn SettingsStore,
    platform: &'a dyn HostVpnPlatform,
    packages: &'a dyn PackageRegistry,
    session_name: &'a str,
}

impl<'a> InterfaceBuilder<'a> {
    pub fn new(
        settings: &'a dyn SettingsStore,
        platform: &'a dyn HostVpnPlatform,
        packages: &'a dyn PackageRegistry,
        session_name: &'a str,
    ) -> Self {
        Self {
            settings,
            platform,
            packages,
            session_name,
        }
    }

    /// Build a complete spec. Fails only on IPv6 exhaustion.
    pub fn build(&self) -> Result<InterfaceSpec, BuildError> {
        let mut spec = InterfaceSpec::empty(self.session_name);

        self.assign_ipv4(&mut spec);
        self.assign_ipv6(&mut spec)?;
        self.capture_known_resolvers(&mut spec);
        self.add_sentinels(&mut spec);
        self.apply_bypass(&mut spec);

        spec.allowed_families = vec![AddressFamily::Ipv4, AddressFamily::Ipv6];
        spec.blocking = true;

        Ok(spec)
    }

    fn assign_ipv4(&self, spec: &mut InterfaceSpec) {
        for prefix in self.settings.interface_address_prefixes() {
            let candidate = format!("{prefix}.{IPV4_HOST_SUFFIX}");
            let addr: Ipv4Addr = match candidate.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    debug!(candidate = %candidate, "skipping unparseable address candidate");
                    continue;
                }
            };
            if self.platform.accepts_address(IpAddr::V4(addr), IPV4_PREFIX_LEN) {
                spec.addresses.push((IpAddr::V4(addr), IPV4_PREFIX_LEN));
                return;
            }
            debug!(candidate = %candidate, "address candidate rejected by host");
        }
        spec.addresses.push((IpAddr::V4(IPV4_FALLBACK), IPV4_PREFIX_LEN));
    }

    fn assign_ipv6(&self, spec: &mut InterfaceSpec) -> Result<(), BuildError> {
        for attempt in 1..=IPV6_MAX_ATTEMPTS {
            let addr = random_local_ipv6();
            if self.platform.accepts_address(IpAddr::V6(addr), IPV6_PREFIX_LEN) {
                spec.addresses.push((IpAddr::V6(addr), IPV6_PREFIX_LEN));
                return Ok(());
            }
            debug!(attempt, %addr, "IPv6 address rejected by host");
        }
        Err(BuildError::Ipv6AddressRejected {
            attempts: IPV6_MAX_ATTEMPTS,
        })
    }

    fn capture_known_resolvers(&self, spec: &mut InterfaceSpec) {
        if !self.settings.catch_known_resolvers() {
            return;
        }
        let mut seen: HashSet<IpAddr> = HashSet::new();
        for resolver in self.settings.known_resolvers() {
            for addr in resolver.ipv4_addresses {
                if seen.insert(IpAddr::V4(addr)) {
                    spec.routes.push((IpAddr::V4(addr), 32));
                }
            }
            for addr in resolver.ipv6_addresses {
                if seen.insert(IpAddr::V6(addr)) {
                    spec.routes.push((IpAddr::V6(addr), 128));
                }
            }
        }
    }

    fn add_sentinels(&self, spec: &mut InterfaceSpec) {
        let sentinel_v4 = IpAddr::V4(self.settings.dummy_dns_ipv4());
        let sentinel_v6 = IpAddr::V6(self.settings.dummy_dns_ipv6());

        spec.dns_servers.push(sentinel_v4);
        spec.dns_servers.push(sentinel_v6);
        spec.routes.push((sentinel_v4, 32));
        spec.routes.push((sentinel_v6, 128));
    }

    fn apply_bypass(&self, spec: &mut InterfaceSpec) {
        for package in self.settings.bypass_packages() {
            if self.packages.is_installed(&package) {
                spec.disallowed_applications.push(package);
            } else {
                debug!(package = %package, "bypass package not installed, skipping");
            }
        }
    }
}
