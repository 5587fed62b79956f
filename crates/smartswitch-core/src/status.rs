//! Host-visible "active" indicator.
//!
//! A long-lived background process should tell its host that it is busy on
//! purpose. The host shows an [`OngoingNotice`] through a [`StatusIndicator`]
//! for as long as a loop is running.

use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

/// Default notice title.
pub const DEFAULT_NOTICE_TITLE: &str = "Smart Dorm Active";

/// Default notice body.
pub const DEFAULT_NOTICE_BODY: &str = "Keeping connection alive in background...";

/// Importance hint attached to a notice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NoticePriority {
    /// May be hidden or batched.
    Low,
    /// Normal importance.
    Default,
    /// Should be surfaced promptly.
    High,
    /// Must never be silently demoted.
    #[default]
    Max,
}

/// Title, body and priority of the ongoing notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "title": "Smart Dorm Active",
    "body": "Keeping connection alive in background...",
    "priority": "max"
}))]
pub struct OngoingNotice {
    /// Short title.
    pub title: String,
    /// One-line description.
    pub body: String,
    /// Importance hint.
    pub priority: NoticePriority,
}

impl Default for OngoingNotice {
    fn default() -> Self {
        Self {
            title: DEFAULT_NOTICE_TITLE.to_string(),
            body: DEFAULT_NOTICE_BODY.to_string(),
            priority: NoticePriority::Max,
        }
    }
}

/// Surface that displays the ongoing notice.
pub trait StatusIndicator: Send + Sync {
    /// Show (or replace) the notice.
    fn show(&self, notice: &OngoingNotice);

    /// Remove the notice.
    fn clear(&self);
}

/// Indicator that writes the notice to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingIndicator;

impl StatusIndicator for TracingIndicator {
    fn show(&self, notice: &OngoingNotice) {
        info!(
            title = %notice.title,
            body = %notice.body,
            priority = ?notice.priority,
            "Ongoing notice shown"
        );
    }

    fn clear(&self) {
        info!("Ongoing notice cleared");
    }
}
