//! Status Notification
//!
//! Derives the persistent status text from the current servers, bypass
//! count, cache size, and query counters. Pure with respect to the
//! supervisor's lifecycle: the presenter task in `supervisor.rs` feeds
//! it counts from a bounded channel and hands the rendered content to
//! the host's [`NotificationSink`].

use crate::config::ServerConfiguration;

/// Inputs for one status rendering.
#[derive(Debug, Clone, Copy)]
pub struct StatusInput<'a> {
    pub primary: &'a ServerConfiguration,
    pub secondary: Option<&'a ServerConfiguration>,
    /// Packages bypassing the tunnel
    pub bypass_package_count: usize,
    /// Live DNS cache entries
    pub cached_entry_count: u64,
    /// Query count reported by the current engine run
    pub query_count: u64,
    /// Cumulative count carried across restarts
    pub query_count_offset: u64,
}

/// Rendered status handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    pub text: String,
    /// `query_count + query_count_offset`
    pub total_query_count: u64,
}

/// Where rendered status goes. The host renders it however it likes;
/// the supervisor only publishes.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, content: NotificationContent);
}

/// Render the status text. Two templates: with and without a secondary
/// server.
pub fn render_status(input: &StatusInput<'_>) -> NotificationContent {
    let total_query_count = input.query_count + input.query_count_offset;
    let text = match input.secondary {
        Some(secondary) => format!(
            "Forwarding DNS via {} and {} ({} bypass apps, {} cached entries, {} queries)",
            input.primary.base_url(),
            secondary.base_url(),
            input.bypass_package_count,
            input.cached_entry_count,
            total_query_count,
        ),
        None => format!(
            "Forwarding DNS via {} ({} bypass apps, {} cached entries, {} queries)",
            input.primary.base_url(),
            input.bypass_package_count,
            input.cached_entry_count,
            total_query_count,
        ),
    };
    NotificationContent {
        text,
        total_query_count,
    }
}
