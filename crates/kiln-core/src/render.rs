//! Render pass: the ordered list of fields a target would show.

use crate::conditions::Evaluator;
use crate::dynamic_text::render_dynamic_text;
use crate::state::{FieldChange, FormState, Scope, empty_value};
use crate::template::{ConditionKind, FormDefinition, Item, ItemKind, ListItem, RenderTarget};
use crate::validation::is_field_required;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    pub target: RenderTarget,
    /// View mode: every field is shown read-only.
    pub view_only: bool,
}

/// One visible field with everything a widget needs to draw it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldView {
    pub id: String,
    pub kind: ItemKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub read_only: bool,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_index: Option<usize>,
    /// Containers and groups enclosing the field, outermost first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_items: Option<Vec<ListItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderOutput {
    pub fields: Vec<FieldView>,
    /// Values written back by calculated-value conditions during the pass.
    pub changes: Vec<FieldChange>,
}

struct Pass<'a> {
    evaluator: &'a Evaluator,
    options: RenderOptions,
    form_read_only: bool,
    out: RenderOutput,
}

/// Walks the template in order, applying calculated values and skipping
/// hidden subtrees.
pub fn render_pass(
    evaluator: &Evaluator,
    template: &FormDefinition,
    state: &mut FormState,
    options: RenderOptions,
) -> RenderOutput {
    let mut pass = Pass {
        evaluator,
        options,
        form_read_only: template.is_read_only() || options.view_only,
        out: RenderOutput::default(),
    };
    let mut path = Vec::new();
    pass.items(template.items(), state, None, &mut path);
    pass.out
}

impl Pass<'_> {
    fn items(
        &mut self,
        items: &[Item],
        state: &mut FormState,
        scope: Option<Scope<'_>>,
        path: &mut Vec<String>,
    ) {
        for item in items {
            if item.is_hidden(self.options.target) || !self.evaluator.is_visible(item, state, scope) {
                continue;
            }
            if item.is_container() {
                path.push(item.id.clone());
                self.items(&item.container_items, state, scope, path);
                path.pop();
            } else if item.is_group() {
                path.push(item.id.clone());
                for (index, instance) in item.group_items.iter().enumerate() {
                    self.items(&instance.fields, state, Some(Scope::new(&item.id, index)), path);
                }
                path.pop();
            } else {
                self.field(item, state, scope, path);
            }
        }
    }

    fn field(&mut self, item: &Item, state: &mut FormState, scope: Option<Scope<'_>>, path: &[String]) {
        if self.evaluator.apply_calculated_value(item, state, scope) == Some(true) {
            let value = state.get(&item.id, scope).cloned().unwrap_or_else(empty_value);
            self.out.changes.push(FieldChange::new(&item.id, scope, value));
        }

        let value = if item.kind == ItemKind::TextInfo {
            let text = item.value.as_ref().and_then(Value::as_str).unwrap_or_default();
            Value::String(render_dynamic_text(text, state, scope))
        } else {
            state.get(&item.id, scope).cloned().unwrap_or_else(empty_value)
        };

        let read_only = self.form_read_only
            || item.has_condition(&ConditionKind::CalculatedValue)
            || self.evaluator.is_read_only(item, state, scope);

        self.out.fields.push(FieldView {
            id: item.id.clone(),
            kind: item.kind.clone(),
            label: item.label.clone(),
            value,
            error: state.error(&item.id).map(str::to_string),
            read_only,
            required: is_field_required(&item.validation),
            group_id: scope.map(|s| s.group_id.to_string()),
            group_index: scope.map(|s| s.index),
            path: path.to_vec(),
            list_items: item.list_items.clone(),
        });
    }
}
