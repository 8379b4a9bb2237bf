//! Bridge accessors backed by a shared [`FormSession`].

use crate::bridge::{Bridge, FieldAccessor};
use kiln_core::state::{FieldChange, Scope};
use kiln_core::validation::validate_field_with;
use kiln_core::{FormSession, Item, ItemKind, RenderOutput, RenderTarget};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub type SharedSession = Arc<Mutex<FormSession>>;

pub fn share(session: FormSession) -> SharedSession {
    Arc::new(Mutex::new(session))
}

pub(crate) fn lock(session: &SharedSession) -> MutexGuard<'_, FormSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionAccessor {
    session: SharedSession,
    field_id: String,
    kind: ItemKind,
    group: Option<(String, usize)>,
}

impl SessionAccessor {
    pub fn new(session: SharedSession, item: &Item, group: Option<(String, usize)>) -> Self {
        Self {
            session,
            field_id: item.id.clone(),
            kind: item.kind.clone(),
            group,
        }
    }

    fn scope(&self) -> Option<Scope<'_>> {
        self.group.as_ref().map(|(g, i)| Scope::new(g, *i))
    }
}

impl FieldAccessor for SessionAccessor {
    fn get_value(&self) -> Value {
        lock(&self.session)
            .value(&self.field_id)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Goes through input handling, so the value is validated and the change
    /// is queued like a user edit. Refused once the field or its group
    /// instance is gone from the session.
    fn set_value(&self, value: Value) -> bool {
        let mut session = lock(&self.session);
        if session.field(&self.field_id).is_none() {
            debug!(field = %self.field_id, "write to a removed field dropped");
            return false;
        }
        if let Some((group_id, index)) = &self.group {
            let instances = session.state().group_states.get(group_id).map_or(0, Vec::len);
            if *index >= instances {
                debug!(field = %self.field_id, %group_id, index, "write to a removed instance dropped");
                return false;
            }
        }
        session.handle_input_change(&self.field_id, value, self.scope());
        true
    }

    fn validate(&self) -> Option<String> {
        let session = lock(&self.session);
        let item = session.field(&self.field_id)?;
        let value = session.value(&self.field_id).cloned().unwrap_or(Value::Null);
        validate_field_with(
            session.evaluator(),
            item,
            &value,
            Some((session.state(), self.scope())),
        )
    }

    fn get_error(&self) -> Option<String> {
        lock(&self.session).error(&self.field_id).map(str::to_string)
    }

    fn set_error(&self, error: Option<String>) {
        lock(&self.session).set_error(&self.field_id, error);
    }

    fn field_type(&self) -> ItemKind {
        self.kind.clone()
    }

    fn is_group_field(&self) -> bool {
        self.group.is_some()
    }

    fn group_id(&self) -> Option<String> {
        self.group.as_ref().map(|(g, _)| g.clone())
    }

    fn group_index(&self) -> Option<usize> {
        self.group.as_ref().map(|(_, i)| *i)
    }
}

/// Starts a fresh registration epoch for `session`: clears the bridge,
/// registers every value field and mirrors the non-empty values.
pub fn attach_session(bridge: &Bridge, session: &SharedSession) -> usize {
    bridge.clear_registrations();
    let count = register_fields(bridge, session);
    debug!(fields = count, "session attached to bridge");
    count
}

/// Registers every value field of the current template and mirrors the
/// non-empty values. Registrations for fields the template no longer has are
/// dropped; call this again after a structural change.
pub fn register_fields(bridge: &Bridge, session: &SharedSession) -> usize {
    let (accessors, snapshot) = {
        let guard = lock(session);
        let mut accessors = Vec::new();
        collect(session, guard.template().items(), None, &mut accessors);
        (accessors, guard.snapshot())
    };
    let count = accessors.len();
    let current: BTreeSet<String> = accessors.iter().map(|a| a.field_id.clone()).collect();
    let dropped = bridge.retain_fields(|field_id| current.contains(field_id));
    if !dropped.is_empty() {
        debug!(fields = ?dropped, "stale field registrations dropped");
    }
    for accessor in accessors {
        let field_id = accessor.field_id.clone();
        bridge.register_field(&field_id, Arc::new(accessor));
    }
    mirror_changes(bridge, &snapshot);
    count
}

fn collect(
    session: &SharedSession,
    items: &[Item],
    group: Option<(String, usize)>,
    out: &mut Vec<SessionAccessor>,
) {
    for item in items {
        if item.is_container() {
            collect(session, &item.container_items, group.clone(), out);
        } else if item.is_group() {
            for (index, instance) in item.group_items.iter().enumerate() {
                collect(session, &instance.fields, Some((item.id.clone(), index)), out);
            }
        } else if item.holds_value() {
            out.push(SessionAccessor::new(session.clone(), item, group.clone()));
        }
    }
}

/// Publishes session changes to the bridge. Unchanged values are skipped by
/// the bridge itself.
pub fn mirror_changes(bridge: &Bridge, changes: &[FieldChange]) {
    for change in changes {
        bridge.set_state(&change.field_id, change.value.clone());
    }
}

/// Renders `session` and publishes the changes queued since the last drain,
/// calculated values included.
pub fn render_and_mirror(bridge: &Bridge, session: &SharedSession, target: RenderTarget) -> RenderOutput {
    let (output, changes) = {
        let mut guard = lock(session);
        let output = guard.render(target);
        (output, guard.take_changes())
    };
    mirror_changes(bridge, &changes);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use kiln_core::{FormData, FormDefinition};
    use serde_json::json;

    fn shared() -> SharedSession {
        let definition = FormDefinition::from_value(json!({"data": {"items": [
            {"id": "name", "type": "text-input", "validation": [{"type": "required", "errorMessage": "required"}]},
            {"id": "intro", "type": "text-info", "value": "Hello"},
            {"id": "g", "type": "group", "groupItems": [{"fields": [{"id": "x", "type": "text-input"}]}]}
        ]}}))
        .expect("template");
        let mut data = serde_json::Map::new();
        data.insert("name".into(), json!("Ada"));
        share(FormSession::load(FormData {
            form_definition: definition,
            data,
            ..FormData::default()
        }))
    }

    #[test]
    fn attach_registers_value_fields_and_mirrors_values() {
        let bridge = Bridge::new(BridgeConfig::default());
        let session = shared();
        assert_eq!(attach_session(&bridge, &session), 2);
        let status = bridge.registration_status();
        assert_eq!(status.registered_fields, vec!["g-0-x".to_string(), "name".to_string()]);
        assert_eq!(bridge.get_state("name"), Some(json!("Ada")));

        let x = bridge.get_field_ref("g-0-x").expect("ref");
        assert!(x.is_group_field());
        assert_eq!(x.group_id().as_deref(), Some("g"));
        assert_eq!(x.group_index(), Some(0));
    }

    #[test]
    fn field_refs_validate_and_write_into_the_session() {
        let bridge = Bridge::new(BridgeConfig::default());
        let session = shared();
        attach_session(&bridge, &session);

        let name = bridge.get_field_ref("name").expect("ref");
        name.set_value(json!(""));
        assert_eq!(name.validate(), Some("required".to_string()));
        assert_eq!(name.get_error(), Some("required".to_string()));

        let x = bridge.get_field_ref("g-0-x").expect("ref");
        x.set_value(json!("inside"));
        let guard = session.lock().expect("lock");
        assert_eq!(guard.state().group_states["g"][0]["g-0-x"], json!("inside"));
    }
}
