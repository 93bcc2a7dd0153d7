use serde_json::Value;

use crate::types::{PresenceDiff, PresenceEntry, PresenceMeta, PresenceState};

/// Keys (with their metas) that joined or left in one server update.
#[derive(Debug, Default)]
pub(crate) struct PresenceChanges {
    pub joins: Vec<(String, Vec<PresenceMeta>)>,
    pub leaves: Vec<(String, Vec<PresenceMeta>)>,
}

/// Replace `current` with a full `presence_state` payload
/// (`{ key: { metas: [...] } }`).
///
/// Keys that are new or gained metas count as joins; keys that disappeared
/// or lost metas count as leaves.
pub(crate) fn sync_state(current: &mut PresenceState, raw: Value) -> PresenceChanges {
    let mut incoming = PresenceState::new();
    if let Value::Object(map) = raw {
        for (key, entry) in map {
            match serde_json::from_value::<PresenceEntry>(entry) {
                Ok(entry) => {
                    incoming.insert(key, entry.metas);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping malformed presence entry"),
            }
        }
    }

    let mut changes = PresenceChanges::default();
    for (key, metas) in current.iter() {
        let remaining = incoming.get(key);
        let left: Vec<_> = metas
            .iter()
            .filter(|m| !remaining.is_some_and(|r| contains_ref(r, m)))
            .cloned()
            .collect();
        if !left.is_empty() {
            changes.leaves.push((key.clone(), left));
        }
    }
    for (key, metas) in incoming.iter() {
        let existing = current.get(key);
        let joined: Vec<_> = metas
            .iter()
            .filter(|m| !existing.is_some_and(|e| contains_ref(e, m)))
            .cloned()
            .collect();
        if !joined.is_empty() {
            changes.joins.push((key.clone(), joined));
        }
    }

    *current = incoming;
    changes
}

/// Apply a `presence_diff` payload to `current`.
pub(crate) fn apply_diff(current: &mut PresenceState, diff: PresenceDiff) -> PresenceChanges {
    let mut changes = PresenceChanges::default();

    for (key, entry) in diff.joins {
        let metas = current.entry(key.clone()).or_default();
        // A rejoin carries the ref it replaces.
        for meta in &entry.metas {
            if let Some(prev) = &meta.phx_ref_prev {
                metas.retain(|m| m.phx_ref.as_ref() != Some(prev));
            }
        }
        metas.extend(entry.metas.iter().cloned());
        changes.joins.push((key, entry.metas));
    }

    for (key, entry) in diff.leaves {
        if let Some(metas) = current.get_mut(&key) {
            metas.retain(|m| !contains_ref(&entry.metas, m));
            if metas.is_empty() {
                current.remove(&key);
            }
        }
        changes.leaves.push((key, entry.metas));
    }

    changes
}

fn contains_ref(metas: &[PresenceMeta], meta: &PresenceMeta) -> bool {
    match &meta.phx_ref {
        Some(r) => metas.iter().any(|m| m.phx_ref.as_ref() == Some(r)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(phx_ref: &str, device: &str) -> PresenceMeta {
        serde_json::from_value(json!({"phx_ref": phx_ref, "device": device})).unwrap()
    }

    fn diff(raw: Value) -> PresenceDiff {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn sync_from_empty_reports_joins() {
        let mut state = PresenceState::new();
        let changes = sync_state(
            &mut state,
            json!({
                "alice": {"metas": [{"phx_ref": "a1", "device": "phone"}]},
                "bob": {"metas": [{"phx_ref": "b1"}]}
            }),
        );
        assert_eq!(state.len(), 2);
        assert_eq!(changes.joins.len(), 2);
        assert!(changes.leaves.is_empty());
        assert_eq!(state["alice"][0].data["device"], "phone");
    }

    #[test]
    fn sync_reports_departed_keys_as_leaves() {
        let mut state = PresenceState::new();
        state.insert("alice".into(), vec![meta("a1", "phone")]);
        state.insert("bob".into(), vec![meta("b1", "laptop")]);

        let changes = sync_state(&mut state, json!({"alice": {"metas": [{"phx_ref": "a1"}]}}));
        assert!(changes.joins.is_empty());
        assert_eq!(changes.leaves.len(), 1);
        assert_eq!(changes.leaves[0].0, "bob");
        assert!(!state.contains_key("bob"));
    }

    #[test]
    fn diff_join_then_full_leave_removes_key() {
        let mut state = PresenceState::new();
        let changes = apply_diff(
            &mut state,
            diff(json!({"joins": {"alice": {"metas": [{"phx_ref": "a1"}]}}, "leaves": {}})),
        );
        assert_eq!(changes.joins[0].0, "alice");
        assert_eq!(state["alice"].len(), 1);

        let changes = apply_diff(
            &mut state,
            diff(json!({"joins": {}, "leaves": {"alice": {"metas": [{"phx_ref": "a1"}]}}})),
        );
        assert_eq!(changes.leaves[0].0, "alice");
        assert!(state.is_empty());
    }

    #[test]
    fn diff_partial_leave_keeps_other_devices() {
        let mut state = PresenceState::new();
        state.insert("alice".into(), vec![meta("a1", "phone"), meta("a2", "laptop")]);

        apply_diff(
            &mut state,
            diff(json!({"leaves": {"alice": {"metas": [{"phx_ref": "a1"}]}}})),
        );
        assert_eq!(state["alice"].len(), 1);
        assert_eq!(state["alice"][0].phx_ref.as_deref(), Some("a2"));
    }

    #[test]
    fn diff_join_replaces_previous_ref() {
        let mut state = PresenceState::new();
        state.insert("alice".into(), vec![meta("a1", "phone")]);

        apply_diff(
            &mut state,
            diff(json!({"joins": {"alice": {"metas": [
                {"phx_ref": "a2", "phx_ref_prev": "a1", "device": "phone"}
            ]}}})),
        );
        assert_eq!(state["alice"].len(), 1);
        assert_eq!(state["alice"][0].phx_ref.as_deref(), Some("a2"));
    }
}
