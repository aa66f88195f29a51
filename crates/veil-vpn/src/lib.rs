//! Veil VPN - DoH Tunnel Session Supervisor
//!
//! Supervises a single user-space tunnel that redirects device DNS
//! traffic through an encrypted remote resolver. The crate owns *when*
//! a tunnel exists, *what* virtual interface it is given, and *how*
//! lifecycle transitions are sequenced; the DoH forwarding engine,
//! settings storage, notification rendering, and the host's tunnel
//! device all sit behind traits.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Host Platform                         │
//! │   commands / revocation          tunnel device / UI       │
//! └──────────┬────────────────────────────────▲───────────────┘
//!            │                                │
//!            ▼                                │
//! ┌──────────────────┐   InterfaceSpec   ┌────┴─────────────┐
//! │ SessionSupervisor│──────────────────▶│ HostVpnPlatform  │
//! │  (state machine) │                   └──────────────────┘
//! │                  │   servers          ┌─────────────────┐
//! │                  │──────────────────▶│  TunnelEngine    │
//! └───────┬──────────┘                   │  (blocking run)  │
//!         │ query counts (bounded)       └─────────────────┘
//!         ▼
//! ┌──────────────────┐
//! │ Notification     │
//! │ presenter task   │
//! └──────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! Idle → Active (establish) → Destroyed (destroy) → Active again only
//! through a recreate. `destroy` is idempotent and always joins the
//! engine before the handle is released; the cumulative query count is
//! folded into an offset that survives restarts within one process.

pub mod command;
pub mod config;
pub mod engine;
pub mod interface;
pub mod notification;
pub mod platform;
pub mod restart;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testutil;

pub use command::{Command, Dispatch};
pub use config::{
    ConfigError, KnownResolver, ResolvedServers, ServerConfigResolver, ServerConfiguration,
    ServerOverrides, SettingsStore,
};
pub use engine::{CONNECT_TIMEOUT_MS, EngineFactory, QueryCountFn, TrafficSnapshot, TunnelEngine};
pub use interface::{AddressFamily, BuildError, InterfaceBuilder, InterfaceSpec};
pub use notification::{NotificationContent, NotificationSink, StatusInput, render_status};
pub use platform::{HostVpnPlatform, PackageRegistry, PlatformError, TunnelHandle};
pub use restart::{HostScheduler, RelaunchRequest, RestartGuard};
pub use supervisor::{SessionSupervisor, SupervisorError, VpnLifecycleEvent};
