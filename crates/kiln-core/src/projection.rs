//! Save projection: the persisted `{data, form_definition, metadata}` document.

use crate::conditions::Evaluator;
use crate::state::{FormState, Scope};
use crate::template::{FormDefinition, Item};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedDocument {
    pub data: Map<String, Value>,
    pub form_definition: FormDefinition,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SavedDocument {
    pub fn new(
        data: Map<String, Value>,
        form_definition: FormDefinition,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            data,
            form_definition,
            metadata,
        }
    }

    /// Records the save date as `M/D/YYYY`.
    pub fn stamp_updated_date(&mut self, date: NaiveDate) {
        let stamp = format!("{}/{}/{}", date.month(), date.day(), date.year());
        self.metadata.insert("updated_date".to_string(), Value::String(stamp));
    }
}

/// Collects the values that should be persisted.
///
/// Containers are inlined into their parent. A group becomes an array with
/// one map per instance; instances where no field qualifies are left out,
/// and a group with no qualifying instance is omitted entirely. Nested
/// groups appear as arrays inside their parent instance's map.
pub fn project(
    evaluator: &Evaluator,
    template: &FormDefinition,
    state: &FormState,
) -> Map<String, Value> {
    let mut data = Map::new();
    project_items(evaluator, template.items(), state, None, &mut data);
    data
}

fn project_items(
    evaluator: &Evaluator,
    items: &[Item],
    state: &FormState,
    scope: Option<Scope<'_>>,
    out: &mut Map<String, Value>,
) {
    for item in items {
        if !evaluator.should_save(item, state, scope) {
            continue;
        }
        if item.is_container() {
            project_items(evaluator, &item.container_items, state, scope, out);
        } else if item.is_group() {
            let count = state.group_states.get(&item.id).map_or(0, Vec::len);
            let instances: Vec<Value> = (0..count)
                .filter_map(|index| {
                    let fields = item.group_items.get(index)?;
                    let mut values = Map::new();
                    let inner = Some(Scope::new(&item.id, index));
                    project_items(evaluator, &fields.fields, state, inner, &mut values);
                    (!values.is_empty()).then_some(Value::Object(values))
                })
                .collect();
            if !instances.is_empty() {
                out.insert(item.id.clone(), Value::Array(instances));
            }
        } else if let Some(value) = state.get(&item.id, scope) {
            out.insert(item.id.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> FormDefinition {
        let mut def = FormDefinition::from_value(json!({"data": {"items": [
            {"id": "name", "type": "text-input"},
            {"id": "secret", "type": "text-input",
             "conditions": [{"type": "visibility", "value": false}]},
            {"id": "kept", "type": "text-input",
             "conditions": [{"type": "visibility", "value": false}, {"type": "saveOnSubmit", "value": true}]},
            {"id": "box", "type": "container", "containerItems": [
                {"id": "inside", "type": "text-area"}
            ]},
            {"id": "kids", "type": "group", "groupItems": [
                {"fields": [
                    {"id": "kid", "type": "text-input"},
                    {"id": "note", "type": "text-input",
                     "conditions": [{"type": "visibility", "value": "(== (field \"kid\") \"show\")"}]}
                ]}
            ]}
        ]}}))
        .expect("template");
        def.normalize();
        def
    }

    #[test]
    fn hidden_values_are_left_out_unless_saved_on_submit() {
        let def = template();
        let mut state = FormState::initialize(&def);
        state.set("secret", None, json!("s"));
        state.set("kept", None, json!("k"));
        state.set("inside", None, json!("i"));

        let data = project(&Evaluator::default(), &def, &state);
        assert!(!data.contains_key("secret"));
        assert_eq!(data["kept"], json!("k"));
        assert_eq!(data["inside"], json!("i"));
        assert!(!data.contains_key("box"));
    }

    #[test]
    fn group_instances_project_visible_fields_only() {
        let def = template();
        let mut state = FormState::initialize(&def);
        state.set("kids-0-kid", Some(Scope::new("kids", 0)), json!("show"));
        state.set("kids-0-note", Some(Scope::new("kids", 0)), json!("n"));

        let data = project(&Evaluator::default(), &def, &state);
        assert_eq!(data["kids"], json!([{"kids-0-kid": "show", "kids-0-note": "n"}]));
    }

    #[test]
    fn stamp_uses_month_day_year() {
        let mut doc = SavedDocument::new(Map::new(), FormDefinition::default(), Map::new());
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).expect("date");
        doc.stamp_updated_date(date);
        assert_eq!(doc.metadata["updated_date"], json!("3/7/2024"));
    }
}
