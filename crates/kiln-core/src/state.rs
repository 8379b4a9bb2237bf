use crate::template::{FormDefinition, Item};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

pub type InstanceValues = Map<String, Value>;

/// Group context a field is evaluated or written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope<'a> {
    pub group_id: &'a str,
    pub index: usize,
}

impl<'a> Scope<'a> {
    pub fn new(group_id: &'a str, index: usize) -> Self {
        Self { group_id, index }
    }
}

/// A value written into the store, addressed the way the bridge sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_index: Option<usize>,
    pub value: Value,
}

impl FieldChange {
    pub fn new(field_id: &str, scope: Option<Scope<'_>>, value: Value) -> Self {
        Self {
            field_id: field_id.to_string(),
            group_id: scope.map(|s| s.group_id.to_string()),
            group_index: scope.map(|s| s.index),
            value,
        }
    }

    pub fn scope(&self) -> Option<Scope<'_>> {
        Some(Scope::new(self.group_id.as_deref()?, self.group_index?))
    }
}

pub fn empty_value() -> Value {
    Value::String(String::new())
}

pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Per-session field values and errors.
///
/// `group_states[g][i]` holds instance `i` of group `g`, keyed by namespaced
/// field id. Nested groups get their own entry under their namespaced id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormState {
    #[serde(default)]
    pub form_states: Map<String, Value>,
    #[serde(default)]
    pub group_states: BTreeMap<String, Vec<InstanceValues>>,
    #[serde(default)]
    pub form_errors: BTreeMap<String, Option<String>>,
}

/// Expected state keys derived from a template.
#[derive(Debug, Default)]
struct Layout {
    top: Vec<String>,
    groups: BTreeMap<String, Vec<Vec<String>>>,
}

impl Layout {
    fn of(template: &FormDefinition) -> Self {
        let mut layout = Layout::default();
        let mut top = Vec::new();
        layout.collect(template.items(), &mut top);
        layout.top = top;
        layout
    }

    fn collect(&mut self, items: &[Item], slot: &mut Vec<String>) {
        for item in items {
            if item.is_container() {
                self.collect(&item.container_items, slot);
            } else if item.is_group() {
                let mut instances = Vec::with_capacity(item.group_items.len());
                for instance in &item.group_items {
                    let mut keys = Vec::new();
                    self.collect(&instance.fields, &mut keys);
                    instances.push(keys);
                }
                self.groups.insert(item.id.clone(), instances);
            } else {
                slot.push(item.id.clone());
            }
        }
    }

    fn all_ids(&self) -> HashSet<&str> {
        let mut ids: HashSet<&str> = self.top.iter().map(String::as_str).collect();
        for instances in self.groups.values() {
            for keys in instances {
                ids.extend(keys.iter().map(String::as_str));
            }
        }
        ids
    }
}

impl FormState {
    /// Fresh state with one empty entry per field in the template.
    pub fn initialize(template: &FormDefinition) -> Self {
        let mut state = Self::default();
        state.fill_missing(template);
        state
    }

    /// Adds entries for fields and instances the template has but the state
    /// lacks. Existing entries, including orphans, are kept.
    pub fn fill_missing(&mut self, template: &FormDefinition) {
        let layout = Layout::of(template);
        for id in &layout.top {
            self.form_states.entry(id.clone()).or_insert_with(empty_value);
        }
        for (group_id, instances) in &layout.groups {
            let states = self.group_states.entry(group_id.clone()).or_default();
            if states.len() < instances.len() {
                states.resize_with(instances.len(), Map::new);
            }
            for (values, keys) in states.iter_mut().zip(instances) {
                for key in keys {
                    values.entry(key.clone()).or_insert_with(empty_value);
                }
            }
        }
    }

    /// Makes the state match the template exactly: one entry per field,
    /// instance arrays as long as the template's, orphans dropped.
    pub fn reconcile(&mut self, template: &FormDefinition) {
        let layout = Layout::of(template);
        self.fill_missing(template);

        let top: HashSet<&str> = layout.top.iter().map(String::as_str).collect();
        self.form_states.retain(|id, _| top.contains(id.as_str()));

        self.group_states
            .retain(|group_id, _| layout.groups.contains_key(group_id));
        for (group_id, states) in self.group_states.iter_mut() {
            let Some(instances) = layout.groups.get(group_id) else {
                continue;
            };
            states.truncate(instances.len());
            for (values, keys) in states.iter_mut().zip(instances) {
                let keys: HashSet<&str> = keys.iter().map(String::as_str).collect();
                values.retain(|id, _| keys.contains(id.as_str()));
            }
        }

        let ids = layout.all_ids();
        self.form_errors.retain(|id, _| ids.contains(id.as_str()));
    }

    pub fn get(&self, field_id: &str, scope: Option<Scope<'_>>) -> Option<&Value> {
        match scope {
            Some(scope) => self
                .group_states
                .get(scope.group_id)?
                .get(scope.index)?
                .get(field_id),
            None => self.form_states.get(field_id),
        }
    }

    /// Stores `value`, returning whether it differed from the stored one.
    ///
    /// Writes to a missing group or instance initialize that slot.
    pub fn set(&mut self, field_id: &str, scope: Option<Scope<'_>>, value: Value) -> bool {
        let slot = match scope {
            None => &mut self.form_states,
            Some(scope) => {
                if !self.group_states.contains_key(scope.group_id) {
                    warn!(group_id = scope.group_id, "group missing from state, initializing");
                }
                let states = self
                    .group_states
                    .entry(scope.group_id.to_string())
                    .or_default();
                if states.len() <= scope.index {
                    warn!(
                        group_id = scope.group_id,
                        index = scope.index,
                        "group instance missing from state, initializing"
                    );
                    states.resize_with(scope.index + 1, Map::new);
                }
                &mut states[scope.index]
            }
        };
        if slot.get(field_id) == Some(&value) {
            return false;
        }
        slot.insert(field_id.to_string(), value);
        true
    }

    /// Finds a field by id anywhere in the store.
    pub fn locate(&self, field_id: &str) -> Option<(Option<Scope<'_>>, &Value)> {
        if let Some(value) = self.form_states.get(field_id) {
            return Some((None, value));
        }
        for (group_id, states) in &self.group_states {
            for (index, values) in states.iter().enumerate() {
                if let Some(value) = values.get(field_id) {
                    return Some((Some(Scope::new(group_id, index)), value));
                }
            }
        }
        None
    }

    /// Every stored `(field id, value)` pair, top-level fields first.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        let top = self.form_states.iter().map(|(k, v)| (k.as_str(), v));
        let groups = self
            .group_states
            .values()
            .flat_map(|states| states.iter())
            .flat_map(|values| values.iter().map(|(k, v)| (k.as_str(), v)));
        top.chain(groups)
    }

    pub fn error(&self, field_id: &str) -> Option<&str> {
        self.form_errors.get(field_id)?.as_deref()
    }

    pub fn set_error(&mut self, field_id: &str, error: Option<String>) {
        self.form_errors.insert(field_id.to_string(), error);
    }

    pub fn has_errors(&self) -> bool {
        self.form_errors.values().any(Option::is_some)
    }

    /// Resets every value of every instance of `group_id` to empty and clears
    /// their errors. Returns the affected field ids.
    pub(crate) fn clear_group(&mut self, group_id: &str) -> Vec<String> {
        let mut cleared = Vec::new();
        if let Some(states) = self.group_states.get_mut(group_id) {
            for values in states.iter_mut() {
                for (id, value) in values.iter_mut() {
                    *value = empty_value();
                    cleared.push(id.clone());
                }
            }
        }
        for id in &cleared {
            self.form_errors.insert(id.clone(), None);
        }
        cleared
    }

    /// Moves values and errors to their relabeled ids and drops everything
    /// listed in `dropped` (field or group ids).
    pub(crate) fn migrate(
        &mut self,
        renames: &HashMap<String, String>,
        dropped: &HashSet<String>,
    ) {
        let rename = |id: &String| renames.get(id).cloned().unwrap_or_else(|| id.clone());

        let group_states = std::mem::take(&mut self.group_states);
        for (group_id, states) in group_states {
            if dropped.contains(&group_id) {
                continue;
            }
            let states = states
                .into_iter()
                .map(|values| {
                    values
                        .into_iter()
                        .filter(|(id, _)| !dropped.contains(id))
                        .map(|(id, value)| (rename(&id), value))
                        .collect::<Map<String, Value>>()
                })
                .collect();
            self.group_states.insert(rename(&group_id), states);
        }

        let errors = std::mem::take(&mut self.form_errors);
        self.form_errors = errors
            .into_iter()
            .filter(|(id, _)| !dropped.contains(id))
            .map(|(id, error)| (rename(&id), error))
            .collect();
    }
}
