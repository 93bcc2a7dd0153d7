use std::sync::Arc;

use serde_json::Value;

use crate::types::{PostgresChangePayload, PostgresChangesEvent, PresenceMeta, PresenceState};

// ── Callback type aliases ─────────────────────────────────────────────────────

pub type PostgresChangesCallback = Arc<dyn Fn(PostgresChangePayload) + Send + Sync + 'static>;

pub type BroadcastCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

pub type PresenceSyncCallback = Arc<dyn Fn(&PresenceState) + Send + Sync + 'static>;

/// Called with the presence key and the metas that joined or left under it.
pub type PresenceChangeCallback = Arc<dyn Fn(&str, &[PresenceMeta]) + Send + Sync + 'static>;

pub type SystemCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

// ── Binding ───────────────────────────────────────────────────────────────────

/// An event binding registered on a channel builder. Fixed once the
/// channel is built.
#[derive(Clone)]
pub(crate) enum Binding {
    PostgresChanges {
        /// Position of the filter in the join payload's `postgres_changes`.
        filter_index: usize,
        event: PostgresChangesEvent,
        callback: PostgresChangesCallback,
    },
    Broadcast {
        /// `"*"` matches every broadcast event.
        event: String,
        callback: BroadcastCallback,
    },
    PresenceSync(PresenceSyncCallback),
    PresenceJoin(PresenceChangeCallback),
    PresenceLeave(PresenceChangeCallback),
    System(SystemCallback),
}

impl Binding {
    pub(crate) fn uses_presence(&self) -> bool {
        matches!(
            self,
            Binding::PresenceSync(_) | Binding::PresenceJoin(_) | Binding::PresenceLeave(_)
        )
    }
}

/// Whether a postgres_changes binding should see a change.
///
/// `matched` holds the filter indices the server reported for the change; an
/// empty list (older servers send no ids) matches every binding.
pub(crate) fn postgres_binding_matches(
    filter_index: usize,
    event: PostgresChangesEvent,
    matched: &[usize],
    change_type: &str,
) -> bool {
    (matched.is_empty() || matched.contains(&filter_index)) && event.matches(change_type)
}
