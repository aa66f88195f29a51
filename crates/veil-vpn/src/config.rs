//! Server Configuration
//!
//! Resolves the upstream DoH resolvers for a session. Each of the two
//! slots (primary required, secondary optional) is filled either from a
//! session-scoped override URL or from the settings store. Override URLs
//! are remembered verbatim next to the resolved configuration so any
//! later restart can replay exactly the same session.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Media type for DoH request/response bodies (RFC 8484).
const DNS_MESSAGE_MEDIA_TYPE: &str = "application/dns-message";

/// Default candidate /24 prefixes for the tunnel's IPv4 address, in
/// probe order. The host suffix is appended by the interface builder.
pub const DEFAULT_ADDRESS_PREFIXES: &[&str] = &["192.168.234", "172.31.255", "10.110.210"];

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid server URL '{url}': {source}")]
    InvalidServerUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("server URL '{0}' is not https")]
    InsecureServerUrl(String),
}

/// An upstream encrypted resolver endpoint.
///
/// Immutable once built; restarts that change servers build a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfiguration {
    base_url: Url,
    request_content_type: String,
    response_content_type: String,
}

impl ServerConfiguration {
    /// Create a configuration with the standard DoH protocol parameters.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            request_content_type: DNS_MESSAGE_MEDIA_TYPE.to_string(),
            response_content_type: DNS_MESSAGE_MEDIA_TYPE.to_string(),
        }
    }

    /// Minimal configuration built directly from a raw URL.
    ///
    /// This is how session override URLs become servers; everything not
    /// derivable from the URL takes protocol defaults.
    pub fn simple(url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(url).map_err(|source| ConfigError::InvalidServerUrl {
            url: url.to_string(),
            source,
        })?;
        if base_url.scheme() != "https" {
            return Err(ConfigError::InsecureServerUrl(url.to_string()));
        }
        Ok(Self::new(base_url))
    }

    /// The resolver's base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Media type sent with DoH queries.
    pub fn request_content_type(&self) -> &str {
        &self.request_content_type
    }

    /// Media type expected in DoH responses.
    pub fn response_content_type(&self) -> &str {
        &self.response_content_type
    }
}

impl std::fmt::Display for ServerConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

/// A public resolver whose plain-DNS addresses should be captured by the
/// tunnel when "catch known resolvers" is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownResolver {
    /// Provider name, for logs only
    pub name: String,
    /// Plain-DNS IPv4 addresses
    pub ipv4_addresses: Vec<Ipv4Addr>,
    /// Plain-DNS IPv6 addresses
    pub ipv6_addresses: Vec<Ipv6Addr>,
}

/// Read-only settings consumed by the supervisor.
///
/// The storage format behind this is out of scope; the supervisor only
/// ever reads through these accessors.
pub trait SettingsStore: Send + Sync {
    /// Primary upstream resolver stored in settings.
    fn primary_server(&self) -> ServerConfiguration;

    /// Optional secondary upstream resolver stored in settings.
    fn secondary_server(&self) -> Option<ServerConfiguration>;

    /// IPv4 sentinel address advertised to the device as its DNS server.
    fn dummy_dns_ipv4(&self) -> Ipv4Addr;

    /// IPv6 sentinel address advertised to the device as its DNS server.
    fn dummy_dns_ipv6(&self) -> Ipv6Addr;

    /// Ordered list of packages whose traffic bypasses the tunnel.
    fn bypass_packages(&self) -> Vec<String>;

    /// Whether host routes for known public resolvers are added.
    fn catch_known_resolvers(&self) -> bool;

    /// Whether a revocation should prompt a fresh configuration flow.
    fn disallow_other_vpns(&self) -> bool;

    /// Live entries currently held by the DNS cache.
    fn cached_entry_count(&self) -> u64;

    /// Known public resolvers, for route capture.
    fn known_resolvers(&self) -> Vec<KnownResolver> {
        Vec::new()
    }

    /// Candidate /24 prefixes for the tunnel's IPv4 address, in order.
    fn interface_address_prefixes(&self) -> Vec<String> {
        DEFAULT_ADDRESS_PREFIXES
            .iter()
            .map(|p| p.to_string())
            .collect()
    }
}

/// Override URLs carried by a start or restart request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOverrides {
    /// Re-read both slots from settings where no override is given
    pub fetch_from_settings: bool,
    /// Session-scoped primary resolver URL
    pub primary_url: Option<String>,
    /// Session-scoped secondary resolver URL
    pub secondary_url: Option<String>,
}

impl ServerOverrides {
    /// True when the payload carries neither a refetch nor any URL.
    pub fn is_empty(&self) -> bool {
        !self.fetch_from_settings && self.primary_url.is_none() && self.secondary_url.is_none()
    }
}

/// The fully resolved server slots plus the override URLs they came from.
///
/// `primary_override`/`secondary_override` are `None` when the slot was
/// filled from settings. An involuntary relaunch carries these forward,
/// never the resolved configurations themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServers {
    pub primary: ServerConfiguration,
    pub secondary: Option<ServerConfiguration>,
    pub primary_override: Option<String>,
    pub secondary_override: Option<String>,
}

impl ResolvedServers {
    /// Ordered server list handed to the tunnel engine (1 or 2 entries).
    pub fn server_list(&self) -> Vec<ServerConfiguration> {
        let mut list = vec![self.primary.clone()];
        if let Some(secondary) = &self.secondary {
            list.push(secondary.clone());
        }
        list
    }
}

/// Decides, per slot, between a caller-supplied override URL and the
/// settings-stored configuration.
pub struct ServerConfigResolver {
    settings: Arc<dyn SettingsStore>,
}

impl ServerConfigResolver {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    /// Resolve both server slots.
    ///
    /// Precedence per slot:
    /// 1. an override URL in the payload,
    /// 2. unless a settings refetch was requested, the override
    ///    remembered from the prior resolution (replayed verbatim),
    /// 3. the settings-stored configuration.
    ///
    /// A missing payload means a plain first start: both slots come from
    /// settings and any remembered overrides are cleared.
    pub fn resolve(
        &self,
        payload: Option<&ServerOverrides>,
        prior: Option<&ResolvedServers>,
    ) -> Result<ResolvedServers, ConfigError> {
        let carry_prior = payload.is_some_and(|p| !p.fetch_from_settings);

        let primary_override = payload
            .and_then(|p| p.primary_url.clone())
            .or_else(|| {
                carry_prior
                    .then(|| prior.and_then(|r| r.primary_override.clone()))
                    .flatten()
            });
        let secondary_override = payload
            .and_then(|p| p.secondary_url.clone())
            .or_else(|| {
                carry_prior
                    .then(|| prior.and_then(|r| r.secondary_override.clone()))
                    .flatten()
            });

        let primary = match &primary_override {
            Some(url) => ServerConfiguration::simple(url)?,
            None => self.settings.primary_server(),
        };
        let secondary = match &secondary_override {
            Some(url) => Some(ServerConfiguration::simple(url)?),
            None => self.settings.secondary_server(),
        };

        debug!(
            primary = %primary.base_url(),
            secondary = secondary.as_ref().map(|s| s.base_url().as_str()),
            overridden = primary_override.is_some() || secondary_override.is_some(),
            "server configuration resolved"
        );

        Ok(ResolvedServers {
            primary,
            secondary,
            primary_override,
            secondary_override,
        })
    }
}
