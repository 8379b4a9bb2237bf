use crate::error::TemplateError;
use crate::identity;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

/// Declares a closed string tag set that still round-trips unknown tags.
macro_rules! string_tag {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $tag,)+
                    Self::Other(s) => s.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($tag => Self::$variant,)+
                    _ => Self::Other(value),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Other(s) => s,
                    other => other.as_str().to_string(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_tag!(
    /// Item `type` tag.
    ItemKind {
        TextInput => "text-input",
        TextArea => "text-area",
        Dropdown => "dropdown",
        Select => "select",
        Radio => "radio",
        Checkbox => "checkbox",
        Toggle => "toggle",
        Date => "date",
        NumberInput => "number-input",
        TextInfo => "text-info",
        Link => "link",
        File => "file",
        Table => "table",
        Button => "button",
        Group => "group",
        Container => "container",
    }
);

string_tag!(
    ConditionKind {
        Visibility => "visibility",
        CalculatedValue => "calculatedValue",
        ReadOnly => "readOnly",
        SaveOnSubmit => "saveOnSubmit",
    }
);

string_tag!(
    RuleKind {
        Required => "required",
        MinLength => "minLength",
        MaxLength => "maxLength",
        Pattern => "pattern",
        Min => "min",
        Max => "max",
        Email => "email",
        Expression => "expression",
        Javascript => "javascript",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Either a JSON operator array or the same expression in textual form.
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub value: String,
    pub text: String,
}

/// One repetition of a group's field subtree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupInstance {
    #[serde(default)]
    pub fields: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_styles: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_styles: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_items: Option<Vec<ListItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeater: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_items: Vec<GroupInstance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_items: Vec<Item>,
    /// Type-specific attributes the engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    pub fn new(id: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: id.into(),
            kind,
            label: None,
            value: None,
            validation: Vec::new(),
            conditions: Vec::new(),
            web_styles: None,
            pdf_styles: None,
            list_items: None,
            mask: None,
            repeater: None,
            group_items: Vec::new(),
            container_items: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == ItemKind::Group
    }

    pub fn is_container(&self) -> bool {
        self.kind == ItemKind::Container
    }

    /// Whether users edit a value for this item.
    pub fn holds_value(&self) -> bool {
        !matches!(
            self.kind,
            ItemKind::Group | ItemKind::Container | ItemKind::TextInfo | ItemKind::Button | ItemKind::Link
        )
    }

    pub fn condition(&self, kind: &ConditionKind) -> Option<&Condition> {
        self.conditions.iter().find(|c| &c.kind == kind)
    }

    pub fn has_condition(&self, kind: &ConditionKind) -> bool {
        self.condition(kind).is_some()
    }

    /// Style-level hiding (`display: none`) for the given render target.
    pub fn is_hidden(&self, target: RenderTarget) -> bool {
        let styles = match target {
            RenderTarget::Web => self.web_styles.as_ref(),
            RenderTarget::Pdf => self.pdf_styles.as_ref(),
        };
        styles
            .and_then(|s| s.get("display"))
            .and_then(Value::as_str)
            .is_some_and(|d| d.trim().eq_ignore_ascii_case("none"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderTarget {
    #[default]
    Web,
    Pdf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FormItems {
    #[serde(default)]
    pub items: Vec<Item>,
}

/// The Template Model: form metadata plus the item tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FormDefinition {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    #[serde(rename = "readOnly", default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub data: FormItems,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FormDefinition {
    pub fn from_value(value: Value) -> Result<Self, TemplateError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json(source: &str) -> Result<Self, TemplateError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn items(&self) -> &[Item] {
        &self.data.items
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or(false)
    }

    /// Namespaces every group instance's fields and nested groups with their
    /// current positional index. Safe to run on already-normalized templates.
    pub fn normalize(&mut self) {
        normalize_items(&mut self.data.items);
    }

    pub fn find_group(&self, group_id: &str) -> Option<&Item> {
        find_item(&self.data.items, &|item| item.is_group() && item.id == group_id)
    }

    pub fn find_group_mut(&mut self, group_id: &str) -> Option<&mut Item> {
        find_item_mut(&mut self.data.items, &|item| {
            item.is_group() && item.id == group_id
        })
    }

    pub fn find_container(&self, container_id: &str) -> Option<&Item> {
        find_item(&self.data.items, &|item| {
            item.is_container() && item.id == container_id
        })
    }

    pub fn find_field(&self, field_id: &str) -> Option<&Item> {
        find_item(&self.data.items, &|item| item.id == field_id)
    }

    /// Every group id in the tree, nested ones included.
    pub fn group_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_group_ids(&self.data.items, &mut out);
        out
    }

    /// Structural problems that would break namespacing or state layout.
    pub fn check(&self) -> Vec<TemplateIssue> {
        let mut issues = Vec::new();
        check_scope(&self.data.items, None, &mut issues);
        issues
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateIssue {
    DuplicateId { id: String },
    GroupWithoutInstances { group_id: String },
    AmbiguousId { group_id: String, id: String },
}

impl fmt::Display for TemplateIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId { id } => write!(f, "duplicate id `{id}` in the same scope"),
            Self::GroupWithoutInstances { group_id } => {
                write!(f, "group `{group_id}` has no template instance")
            }
            Self::AmbiguousId { group_id, id } => write!(
                f,
                "id `{id}` in group `{group_id}` collides with the namespacing pattern"
            ),
        }
    }
}

fn normalize_items(items: &mut [Item]) {
    for item in items {
        if item.is_container() {
            normalize_items(&mut item.container_items);
        } else if item.is_group() {
            let group_id = item.id.clone();
            for (index, instance) in item.group_items.iter_mut().enumerate() {
                relabel_fields(&mut instance.fields, &group_id, &group_id, index, &mut |_, _| {});
            }
        }
    }
}

/// Rewrites the ids of an instance's subtree from `old_group` to `new_group`
/// at `index`, recursing into nested groups. `renamed` sees every
/// `(old, new)` pair, groups included.
pub(crate) fn relabel_fields(
    fields: &mut [Item],
    old_group: &str,
    new_group: &str,
    index: usize,
    renamed: &mut dyn FnMut(&str, &str),
) {
    for field in fields {
        let old_id = field.id.clone();
        let local = identity::strip_group_prefix(old_group, &old_id).to_string();
        let new_id = identity::namespace(new_group, index, &local);
        if new_id != old_id {
            renamed(&old_id, &new_id);
        }
        field.id = new_id.clone();

        if field.is_container() {
            relabel_fields(&mut field.container_items, old_group, new_group, index, renamed);
        } else if field.is_group() {
            for (nested_index, nested) in field.group_items.iter_mut().enumerate() {
                relabel_fields(&mut nested.fields, &old_id, &new_id, nested_index, renamed);
            }
        }
    }
}

fn find_item<'a>(items: &'a [Item], pred: &dyn Fn(&Item) -> bool) -> Option<&'a Item> {
    for item in items {
        if pred(item) {
            return Some(item);
        }
        let found = if item.is_container() {
            find_item(&item.container_items, pred)
        } else if item.is_group() {
            item.group_items
                .iter()
                .find_map(|instance| find_item(&instance.fields, pred))
        } else {
            None
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn find_item_mut<'a>(
    items: &'a mut [Item],
    pred: &dyn Fn(&Item) -> bool,
) -> Option<&'a mut Item> {
    for item in items {
        if pred(item) {
            return Some(item);
        }
        let found = if item.is_container() {
            find_item_mut(&mut item.container_items, pred)
        } else if item.is_group() {
            item.group_items
                .iter_mut()
                .find_map(|instance| find_item_mut(&mut instance.fields, pred))
        } else {
            None
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn collect_group_ids(items: &[Item], out: &mut Vec<String>) {
    for item in items {
        if item.is_container() {
            collect_group_ids(&item.container_items, out);
        } else if item.is_group() {
            out.push(item.id.clone());
            for instance in &item.group_items {
                collect_group_ids(&instance.fields, out);
            }
        }
    }
}

fn check_scope(items: &[Item], group_id: Option<&str>, issues: &mut Vec<TemplateIssue>) {
    let mut seen = HashSet::new();
    check_items(items, group_id, &mut seen, issues);
}

// Containers share their parent's id scope.
fn check_items(
    items: &[Item],
    group_id: Option<&str>,
    seen: &mut HashSet<String>,
    issues: &mut Vec<TemplateIssue>,
) {
    for item in items {
        if !seen.insert(item.id.clone()) {
            issues.push(TemplateIssue::DuplicateId { id: item.id.clone() });
        }
        if let Some(group_id) = group_id {
            let stacked = identity::split_prefix(group_id, &item.id)
                .is_some_and(|(_, rest)| identity::looks_namespaced(group_id, rest));
            if stacked {
                issues.push(TemplateIssue::AmbiguousId {
                    group_id: group_id.to_string(),
                    id: item.id.clone(),
                });
            }
        }
        if item.is_container() {
            check_items(&item.container_items, group_id, seen, issues);
        } else if item.is_group() {
            if item.group_items.is_empty() {
                issues.push(TemplateIssue::GroupWithoutInstances {
                    group_id: item.id.clone(),
                });
            }
            for instance in &item.group_items {
                check_scope(&instance.fields, Some(&item.id), issues);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> FormDefinition {
        FormDefinition::from_value(json!({
            "id": 7,
            "title": "Intake",
            "form_id": "CF0001",
            "lastModified": "2025-01-01",
            "data": {"items": [
                {"id": "name", "type": "text-input", "label": "Name", "customAttr": 1},
                {"id": "box", "type": "container", "containerItems": [
                    {"id": "people", "type": "group", "repeater": true, "groupItems": [
                        {"fields": [
                            {"id": "first", "type": "text-input"},
                            {"id": "phones", "type": "group", "groupItems": [
                                {"fields": [{"id": "number", "type": "text-input"}]}
                            ]}
                        ]}
                    ]}
                ]},
                {"id": "sig", "type": "signature-pad"}
            ]}
        }))
        .expect("sample template parses")
    }

    #[test]
    fn unknown_types_and_attributes_round_trip() {
        let def = sample();
        assert_eq!(def.items()[2].kind, ItemKind::Other("signature-pad".into()));
        let out = serde_json::to_value(&def).expect("serializes");
        assert_eq!(out["data"]["items"][2]["type"], "signature-pad");
        assert_eq!(out["data"]["items"][0]["customAttr"], 1);
        assert_eq!(out["lastModified"], "2025-01-01");
    }

    #[test]
    fn normalize_namespaces_nested_groups_transitively() {
        let mut def = sample();
        def.normalize();
        let people = def.find_group("people").expect("group");
        let fields = &people.group_items[0].fields;
        assert_eq!(fields[0].id, "people-0-first");
        assert_eq!(fields[1].id, "people-0-phones");
        assert_eq!(fields[1].group_items[0].fields[0].id, "people-0-phones-0-number");

        let before = def.clone();
        def.normalize();
        assert_eq!(def, before);
    }

    #[test]
    fn group_ids_include_nested_groups() {
        let mut def = sample();
        def.normalize();
        assert_eq!(def.group_ids(), vec!["people", "people-0-phones"]);
        assert!(def.find_container("box").is_some());
        assert!(def.find_group("box").is_none());
    }

    #[test]
    fn style_display_none_hides_per_target() {
        let item: Item = serde_json::from_value(json!({
            "id": "x", "type": "text-input",
            "pdfStyles": {"display": "none"}
        }))
        .expect("item parses");
        assert!(item.is_hidden(RenderTarget::Pdf));
        assert!(!item.is_hidden(RenderTarget::Web));
    }

    #[test]
    fn check_reports_structural_issues() {
        let def = FormDefinition::from_value(json!({
            "data": {"items": [
                {"id": "a", "type": "text-input"},
                {"id": "c", "type": "container", "containerItems": [
                    {"id": "a", "type": "text-input"}
                ]},
                {"id": "g", "type": "group", "groupItems": []},
                {"id": "h", "type": "group", "groupItems": [
                    {"fields": [{"id": "h-0-h-1-x", "type": "text-input"}]}
                ]}
            ]}
        }))
        .expect("parses");
        let issues = def.check();
        assert!(issues.contains(&TemplateIssue::DuplicateId { id: "a".into() }));
        assert!(issues.contains(&TemplateIssue::GroupWithoutInstances { group_id: "g".into() }));
        assert!(issues.iter().any(|i| matches!(i, TemplateIssue::AmbiguousId { .. })));
    }
}
