//! One form session: the working template, its state and pending changes.

use crate::conditions::Evaluator;
use crate::document::FormData;
use crate::error::StructureError;
use crate::groups;
use crate::projection::{self, SavedDocument};
use crate::render::{RenderOptions, RenderOutput, render_pass};
use crate::state::{FieldChange, FormState, Scope, empty_value, is_empty_value};
use crate::template::{FormDefinition, Item, RenderTarget};
use crate::validation::{ValidationReport, validate_all_fields, validate_field_with};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub struct FormSession {
    evaluator: Evaluator,
    /// The definition as served; persisted with every save.
    definition: FormDefinition,
    /// Normalized working copy with one template instance per state instance.
    template: FormDefinition,
    state: FormState,
    logs: Value,
    metadata: Map<String, Value>,
    view_only: bool,
    changes: Vec<FieldChange>,
}

impl FormSession {
    pub fn load(data: FormData) -> Self {
        Self::load_with(Evaluator::default(), data)
    }

    /// Builds template and state from scratch, then applies prior values.
    /// Group values beyond the template's instance count add instances.
    pub fn load_with(evaluator: Evaluator, data: FormData) -> Self {
        let mut template = data.form_definition.clone();
        template.normalize();
        for issue in template.check() {
            warn!(%issue, "template issue");
        }
        let mut state = FormState::initialize(&template);

        for (key, value) in &data.data {
            match value {
                Value::Array(instances) if template.find_group(key).is_some() => {
                    if let Err(err) = groups::seed_group(&mut template, &mut state, key, instances) {
                        warn!(group_id = %key, error = %err, "prior group values not applied");
                    }
                }
                _ if state.form_states.contains_key(key) => {
                    state.set(key, None, value.clone());
                }
                _ => debug!(field = %key, "prior value has no matching field, ignored"),
            }
        }

        info!(
            fields = state.form_states.len(),
            groups = state.group_states.len(),
            "form session loaded"
        );
        Self {
            evaluator,
            definition: data.form_definition,
            template,
            state,
            logs: data.logs,
            metadata: data.metadata,
            view_only: false,
            changes: Vec::new(),
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn definition(&self) -> &FormDefinition {
        &self.definition
    }

    pub fn template(&self) -> &FormDefinition {
        &self.template
    }

    pub fn state(&self) -> &FormState {
        &self.state
    }

    pub fn logs(&self) -> &Value {
        &self.logs
    }

    pub fn set_logs(&mut self, logs: Value) {
        self.logs = logs;
    }

    pub fn set_view_only(&mut self, view_only: bool) {
        self.view_only = view_only;
    }

    pub fn is_read_only(&self) -> bool {
        self.view_only || self.template.is_read_only()
    }

    pub fn field(&self, field_id: &str) -> Option<&Item> {
        self.template.find_field(field_id)
    }

    /// Group and instance a stored field lives in.
    pub fn scope_of(&self, field_id: &str) -> Option<(String, usize)> {
        let (scope, _) = self.state.locate(field_id)?;
        scope.map(|s| (s.group_id.to_string(), s.index))
    }

    pub fn value(&self, field_id: &str) -> Option<&Value> {
        self.state.locate(field_id).map(|(_, value)| value)
    }

    pub fn error(&self, field_id: &str) -> Option<&str> {
        self.state.error(field_id)
    }

    pub fn set_error(&mut self, field_id: &str, error: Option<String>) {
        self.state.set_error(field_id, error);
    }

    /// Validates and stores a user edit. The value is stored even when it
    /// fails validation; the error is returned and recorded.
    pub fn handle_input_change(
        &mut self,
        field_id: &str,
        value: Value,
        scope: Option<Scope<'_>>,
    ) -> Option<String> {
        let error = match self.template.find_field(field_id) {
            Some(item) => {
                validate_field_with(&self.evaluator, item, &value, Some((&self.state, scope)))
            }
            None => {
                warn!(field = field_id, "input for a field the template does not have");
                None
            }
        };
        if self.state.set(field_id, scope, value.clone()) {
            self.changes.push(FieldChange::new(field_id, scope, value));
        }
        self.state.set_error(field_id, error.clone());
        error
    }

    /// Stores a value written from outside the render tree, without
    /// validation. Returns whether the stored value changed.
    pub fn set_value(&mut self, field_id: &str, value: Value) -> bool {
        let scope = self.scope_of(field_id);
        let scope = scope.as_ref().map(|(g, i)| Scope::new(g, *i));
        self.state.set(field_id, scope, value)
    }

    pub fn add_group_item(&mut self, group_id: &str, initial: Option<&Map<String, Value>>) -> Option<usize> {
        self.structural("add group item", |template, state| {
            groups::add_group_item(template, state, group_id, initial)
        })
    }

    pub fn remove_group_item(&mut self, group_id: &str, index: usize) -> bool {
        self.structural("remove group item", |template, state| {
            groups::remove_group_item(template, state, group_id, index)
        })
        .is_some()
    }

    pub fn clear_group_item(&mut self, group_id: &str) -> bool {
        let cleared = self.structural("clear group", |template, state| {
            groups::clear_group_item(template, state, group_id)
        });
        self.record_cleared(cleared)
    }

    pub fn clear_container(&mut self, container_id: &str) -> bool {
        let cleared = self.structural("clear container", |template, state| {
            groups::clear_container(template, state, container_id)
        });
        self.record_cleared(cleared)
    }

    fn structural<T>(
        &mut self,
        operation: &str,
        run: impl FnOnce(&mut FormDefinition, &mut FormState) -> Result<T, StructureError>,
    ) -> Option<T> {
        match run(&mut self.template, &mut self.state) {
            Ok(out) => Some(out),
            Err(err) => {
                warn!(operation, error = %err, "structural operation ignored");
                None
            }
        }
    }

    fn record_cleared(&mut self, cleared: Option<Vec<String>>) -> bool {
        let Some(cleared) = cleared else {
            return false;
        };
        for field_id in cleared {
            let scope = self.scope_of(&field_id);
            let scope = scope.as_ref().map(|(g, i)| Scope::new(g, *i));
            self.changes.push(FieldChange::new(&field_id, scope, empty_value()));
        }
        true
    }

    /// Validates every visible field and replaces the error map with the
    /// result.
    pub fn validate_all(&mut self) -> ValidationReport {
        let report = validate_all_fields(&self.evaluator, &self.template, &self.state);
        self.state.form_errors = report
            .errors
            .iter()
            .map(|(id, message)| (id.clone(), Some(message.clone())))
            .collect();
        report
    }

    pub fn render(&mut self, target: RenderTarget) -> RenderOutput {
        let options = RenderOptions {
            target,
            view_only: self.view_only,
        };
        let output = render_pass(&self.evaluator, &self.template, &mut self.state, options);
        self.changes.extend(output.changes.iter().cloned());
        output
    }

    pub fn project(&self) -> Map<String, Value> {
        projection::project(&self.evaluator, &self.template, &self.state)
    }

    pub fn saved_document(&self, updated: NaiveDate) -> SavedDocument {
        let mut document =
            SavedDocument::new(self.project(), self.definition.clone(), self.metadata.clone());
        document.stamp_updated_date(updated);
        document
    }

    /// Replaces the template while keeping every stored value.
    ///
    /// Returns `false` when `definition` equals the one already held. The new
    /// template gets as many instances per group as the state holds; fields
    /// it introduces get empty entries.
    pub fn adopt_template(&mut self, definition: FormDefinition) -> bool {
        if definition == self.definition {
            debug!("fetched template unchanged");
            return false;
        }
        let mut template = definition.clone();
        template.normalize();
        self.expand_to_state(&mut template);
        self.state.fill_missing(&template);
        self.definition = definition;
        self.template = template;
        info!("template replaced");
        true
    }

    fn expand_to_state(&self, template: &mut FormDefinition) {
        // Growing a parent introduces nested group ids, so repeat until stable.
        loop {
            let mut grew = false;
            for group_id in template.group_ids() {
                let wanted = self.state.group_states.get(&group_id).map_or(0, Vec::len);
                let mut have = template
                    .find_group(&group_id)
                    .map_or(0, |g| g.group_items.len());
                while have < wanted {
                    if let Err(err) = groups::push_template_instance(template, &group_id) {
                        warn!(%group_id, error = %err, "cannot expand group for existing state");
                        break;
                    }
                    have += 1;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
    }

    /// Every non-empty stored value, for mirroring the whole state outward.
    pub fn snapshot(&self) -> Vec<FieldChange> {
        let top = self
            .state
            .form_states
            .iter()
            .map(|(id, value)| FieldChange::new(id, None, value.clone()));
        let grouped = self.state.group_states.iter().flat_map(|(group_id, states)| {
            states.iter().enumerate().flat_map(move |(index, values)| {
                values
                    .iter()
                    .map(move |(id, value)| FieldChange::new(id, Some(Scope::new(group_id, index)), value.clone()))
            })
        });
        top.chain(grouped)
            .filter(|change| !is_empty_value(&change.value))
            .collect()
    }

    /// Changes made since the last call.
    pub fn take_changes(&mut self) -> Vec<FieldChange> {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> FormDefinition {
        FormDefinition::from_value(json!({"id": 1, "data": {"items": [
            {"id": "name", "type": "text-input", "validation": [{"type": "required", "errorMessage": "name please"}]},
            {"id": "g1", "type": "group", "repeater": true, "groupItems": [
                {"fields": [{"id": "age", "type": "number-input"}]}
            ]}
        ]}}))
        .expect("template")
    }

    fn load(data: Value) -> FormSession {
        FormSession::load(FormData {
            form_definition: definition(),
            data: data.as_object().cloned().unwrap_or_default(),
            ..FormData::default()
        })
    }

    #[test]
    fn prior_group_values_create_instances() {
        let session = load(json!({
            "name": "Ada",
            "ghost": "x",
            "g1": [{"g1-0-age": 1}, {"g1-1-age": 2}, {"g1-2-age": 3}]
        }));
        assert_eq!(session.template().find_group("g1").expect("g1").group_items.len(), 3);
        assert_eq!(session.state().group_states["g1"][2]["g1-2-age"], json!(3));
        assert_eq!(session.value("name"), Some(&json!("Ada")));
        assert_eq!(session.value("ghost"), None);
    }

    #[test]
    fn input_changes_record_errors_and_changes() {
        let mut session = load(json!({}));
        assert_eq!(session.handle_input_change("name", json!(""), None), Some("name please".into()));
        assert_eq!(session.error("name"), Some("name please"));
        assert!(session.take_changes().is_empty());

        assert_eq!(session.handle_input_change("name", json!("Bo"), None), None);
        assert_eq!(session.error("name"), None);
        assert_eq!(session.take_changes(), vec![FieldChange::new("name", None, json!("Bo"))]);
    }

    #[test]
    fn structural_failures_are_ignored() {
        let mut session = load(json!({}));
        assert!(!session.remove_group_item("g1", 0));
        assert!(!session.clear_container("missing"));
        assert_eq!(session.add_group_item("nope", None), None);
        assert_eq!(session.add_group_item("g1", None), Some(1));
    }

    #[test]
    fn adopting_a_template_keeps_values() {
        let mut session = load(json!({"name": "Ada", "g1": [{"g1-0-age": 1}, {"g1-1-age": 2}]}));
        assert!(!session.adopt_template(definition()));

        let mut changed = definition();
        changed.data.items.push(Item::new("email", "text-input".into()));
        let before = session.state().clone();
        assert!(session.adopt_template(changed));

        assert_eq!(session.template().find_group("g1").expect("g1").group_items.len(), 2);
        assert_eq!(session.state().form_states["name"], before.form_states["name"]);
        assert_eq!(session.state().group_states, before.group_states);
        assert_eq!(session.state().form_states["email"], json!(""));
    }

    #[test]
    fn validate_all_replaces_the_error_map() {
        let mut session = load(json!({}));
        session.set_error("g1-0-age", Some("stale".into()));
        let report = session.validate_all();
        assert!(!report.valid);
        assert_eq!(session.error("name"), Some("name please"));
        assert_eq!(session.error("g1-0-age"), None);
    }
}
