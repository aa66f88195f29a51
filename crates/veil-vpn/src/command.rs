//! Supervisor Commands
//!
//! The host delivers lifecycle requests as a small JSON envelope. This
//! module decodes it into a typed [`Dispatch`] consumed by the
//! supervisor's single dispatch entry point. Malformed or unrecognized
//! payloads decode to `None` and cause no state transition.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// An explicit lifecycle command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Tear the tunnel down and stop the supervisor process. Terminal.
    Stop,
    /// Destroy and re-establish the tunnel, optionally with new servers.
    Restart {
        /// Re-read server slots from settings where no override is given
        fetch_from_settings: bool,
        /// Session-scoped primary resolver URL
        primary_url_override: Option<String>,
        /// Session-scoped secondary resolver URL
        secondary_url_override: Option<String>,
    },
}

impl Command {
    /// Restart replaying the current servers, refetched from settings.
    pub fn restart_from_settings() -> Self {
        Command::Restart {
            fetch_from_settings: true,
            primary_url_override: None,
            secondary_url_override: None,
        }
    }

    /// Restart with session-scoped override URLs.
    pub fn restart_with_urls(primary: Option<String>, secondary: Option<String>) -> Self {
        Command::Restart {
            fetch_from_settings: false,
            primary_url_override: primary,
            secondary_url_override: secondary,
        }
    }
}

/// A decoded host request: either a plain start or an explicit command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// No command field present: resolve configuration if needed, then
    /// establish.
    Start {
        primary_url_override: Option<String>,
        secondary_url_override: Option<String>,
    },
    /// An explicit Stop or Restart.
    Command(Command),
}

/// Wire shape of the host envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    command: Option<String>,
    #[serde(default)]
    fetch_from_settings: bool,
    #[serde(default)]
    primary_url_override: Option<String>,
    #[serde(default)]
    secondary_url_override: Option<String>,
}

impl Dispatch {
    /// Decode a host envelope.
    ///
    /// Returns `None` for payloads that are not valid JSON or carry an
    /// unrecognized command name; callers ignore those.
    pub fn decode(payload: &str) -> Option<Self> {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "ignoring malformed command payload");
                return None;
            }
        };

        match envelope.command.as_deref() {
            None => Some(Dispatch::Start {
                primary_url_override: envelope.primary_url_override,
                secondary_url_override: envelope.secondary_url_override,
            }),
            Some("stop") => Some(Dispatch::Command(Command::Stop)),
            Some("restart") => Some(Dispatch::Command(Command::Restart {
                fetch_from_settings: envelope.fetch_from_settings,
                primary_url_override: envelope.primary_url_override,
                secondary_url_override: envelope.secondary_url_override,
            })),
            Some(other) => {
                warn!(command = other, "ignoring unrecognized command");
                None
            }
        }
    }
}
