//! Host Platform Contracts
//!
//! The supervisor never talks to the kernel or the host UI directly; it
//! goes through these traits. The host wires in real implementations,
//! tests wire in mocks.

use crate::interface::InterfaceSpec;
use std::net::IpAddr;
use std::sync::Arc;

/// Platform errors surfaced while materializing an interface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    #[error("interface rejected by host: {0}")]
    EstablishRejected(String),

    #[error("tunnel permission missing")]
    PermissionMissing,
}

/// A live virtual-interface handle.
///
/// Opaque to the supervisor; dropping the last reference releases the
/// underlying device. Engines that need the concrete type downcast
/// through [`TunnelHandle::as_any`].
pub trait TunnelHandle: Send + Sync {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The host's tunnel API plus the few host-control signals the
/// supervisor emits.
pub trait HostVpnPlatform: Send + Sync {
    /// Probe whether the host accepts `addr/prefix_len` as a local
    /// interface address. Used while building the interface spec.
    fn accepts_address(&self, addr: IpAddr, prefix_len: u8) -> bool;

    /// Materialize an interface spec into a live handle.
    fn establish(&self, spec: &InterfaceSpec) -> Result<Arc<dyn TunnelHandle>, PlatformError>;

    /// Whether the host relaunches the supervisor after involuntary
    /// teardown.
    fn keep_service_alive(&self) -> bool;

    /// Ask the host to stop the supervisor process.
    fn stop_service(&self);

    /// Ask the host to open a fresh user-facing configuration flow,
    /// seeded with the previously active override URLs.
    fn request_configure_flow(
        &self,
        primary_url_override: Option<String>,
        secondary_url_override: Option<String>,
    );
}

/// Host package registry, used to filter the bypass list down to
/// packages that actually exist on the device.
pub trait PackageRegistry: Send + Sync {
    fn is_installed(&self, package: &str) -> bool;
}
