/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::blueprint
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1
  ------------------------------------------------------------
  Purpose:
    Notification blueprint contract: a template object carrying
    one notification's content and routing, independent of
    persistence, consumed by an external delivery pipeline.

  Security / Safety Notes:
    Blueprints carry package names and counts only; no user
    credentials or deployment secrets enter payloads.

  Dependencies:
    serde_json for payload data.

  Operational Scope:
    Emitted by the orchestrator when a completed check finds
    update candidates; delivery itself is out of scope.

  Revision History:
    2026-03-02 COD  Carved out blueprint contract and dispatch seam.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Polymorphic contracts behind object-safe traits
    - Stable type identifiers for routing
============================================================*/

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::logger::Logger;
use std::sync::Arc;

/// A notification blueprint, when instantiated, represents one
/// notification about something: its serialized type and subject-model
/// identifiers for routing, plus per-instance content accessors.
pub trait NotificationBlueprint: Send + Sync {
    /// Serialized type of this notification.
    fn notification_type(&self) -> &'static str;

    /// Identifier of the model class acting as the subject.
    fn subject_model(&self) -> &'static str;

    /// User the notification originates from, when one exists.
    fn from_user(&self) -> Option<&str>;

    /// Identifier of the subject entity, when one exists.
    fn subject_id(&self) -> Option<&str>;

    /// Data to be stored alongside the notification.
    fn payload(&self) -> Option<serde_json::Value>;
}

/// Delivery seam toward the external notification pipeline.
pub trait NotificationDispatch: Send + Sync {
    fn deliver(&self, blueprint: &dyn NotificationBlueprint);
}

/// Blueprint describing a completed check that found updates.
/// System-originated; there is no sending user.
pub struct UpdatesAvailableBlueprint {
    update_count: usize,
    core_latest: Option<String>,
    checked_at: DateTime<Utc>,
}

impl UpdatesAvailableBlueprint {
    pub fn new(update_count: usize, core_latest: Option<String>, checked_at: DateTime<Utc>) -> Self {
        Self {
            update_count,
            core_latest,
            checked_at,
        }
    }
}

impl NotificationBlueprint for UpdatesAvailableBlueprint {
    fn notification_type(&self) -> &'static str {
        "updatesAvailable"
    }

    fn subject_model(&self) -> &'static str {
        "update-check"
    }

    fn from_user(&self) -> Option<&str> {
        None
    }

    fn subject_id(&self) -> Option<&str> {
        self.core_latest.as_deref()
    }

    fn payload(&self) -> Option<serde_json::Value> {
        Some(json!({
            "updateCount": self.update_count,
            "coreLatest": self.core_latest,
            "checkedAt": self.checked_at.to_rfc3339(),
        }))
    }
}

/// Dispatcher that records blueprints in the session log. Stands in
/// for the forum's delivery pipeline when none is attached.
pub struct LogNotifier {
    logger: Arc<Logger>,
}

impl LogNotifier {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

impl NotificationDispatch for LogNotifier {
    fn deliver(&self, blueprint: &dyn NotificationBlueprint) {
        self.logger.info(
            "NOTIFY",
            format!(
                "{} subject_model={} payload={}",
                blueprint.notification_type(),
                blueprint.subject_model(),
                blueprint
                    .payload()
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "null".to_string())
            ),
        );
    }
}
