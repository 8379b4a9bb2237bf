use crate::conditions::Evaluator;
use crate::runtime::{as_f64, truthy};
use crate::state::{FormState, Scope, empty_value, is_empty_value};
use crate::template::{FormDefinition, Item, ItemKind, RuleKind, ValidationRule};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::warn;

/// Outcome of validating every visible field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: BTreeMap<String, String>,
}

/// Requiredness is static: any rule of kind `required` that is not disabled
/// with `value: false`.
pub fn is_field_required(rules: &[ValidationRule]) -> bool {
    rules
        .iter()
        .any(|rule| rule.kind == RuleKind::Required && rule.value != Value::Bool(false))
}

/// First failing rule's message, or `None` when the value passes.
pub fn validate_field(item: &Item, value: &Value) -> Option<String> {
    validate_field_with(Evaluator::shared(), item, value, None)
}

/// Like [`validate_field`], letting expression rules see the form state.
pub fn validate_field_with(
    evaluator: &Evaluator,
    item: &Item,
    value: &Value,
    state: Option<(&FormState, Option<Scope<'_>>)>,
) -> Option<String> {
    item.validation
        .iter()
        .find_map(|rule| check_rule(evaluator, item, rule, value, state))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn message(rule: &ValidationRule, fallback: impl FnOnce() -> String) -> String {
    if rule.error_message.trim().is_empty() {
        fallback()
    } else {
        rule.error_message.clone()
    }
}

fn is_blank(item: &Item, value: &Value) -> bool {
    if is_empty_value(value) {
        return true;
    }
    matches!(item.kind, ItemKind::Checkbox | ItemKind::Toggle) && value == &Value::Bool(false)
}

fn is_email(s: &str) -> bool {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok())
        .as_ref()
        .is_none_or(|re| re.is_match(s))
}

fn check_rule(
    evaluator: &Evaluator,
    item: &Item,
    rule: &ValidationRule,
    value: &Value,
    state: Option<(&FormState, Option<Scope<'_>>)>,
) -> Option<String> {
    let blank = is_blank(item, value);
    match &rule.kind {
        RuleKind::Required => {
            if rule.value == Value::Bool(false) || !blank {
                return None;
            }
            Some(message(rule, || "This field is required".to_string()))
        }
        // Remaining rules only judge values that are present.
        _ if blank => None,
        RuleKind::MinLength => {
            let limit = as_f64(&rule.value)? as usize;
            (text(value).chars().count() < limit)
                .then(|| message(rule, || format!("Must be at least {limit} characters")))
        }
        RuleKind::MaxLength => {
            let limit = as_f64(&rule.value)? as usize;
            (text(value).chars().count() > limit)
                .then(|| message(rule, || format!("Must be at most {limit} characters")))
        }
        RuleKind::Pattern => {
            let pattern = text(&rule.value);
            match Regex::new(&pattern) {
                Ok(re) => (!re.is_match(&text(value)))
                    .then(|| message(rule, || "Invalid format".to_string())),
                Err(err) => {
                    warn!(field = %item.id, %pattern, error = %err, "invalid validation pattern, skipping rule");
                    None
                }
            }
        }
        RuleKind::Min | RuleKind::Max => {
            let limit = as_f64(&rule.value)?;
            let Some(n) = as_f64(value) else {
                return Some(message(rule, || "Must be a number".to_string()));
            };
            let failed = if rule.kind == RuleKind::Min { n < limit } else { n > limit };
            failed.then(|| {
                message(rule, || {
                    if rule.kind == RuleKind::Min {
                        format!("Must be at least {limit}")
                    } else {
                        format!("Must be at most {limit}")
                    }
                })
            })
        }
        RuleKind::Email => (!is_email(text(value).trim()))
            .then(|| message(rule, || "Invalid email address".to_string())),
        RuleKind::Expression | RuleKind::Javascript => {
            let fallback = FormState::default();
            let (snapshot, scope) = state.unwrap_or((&fallback, None));
            match evaluator.evaluate(&rule.value, snapshot, scope, Some(value)) {
                Ok(result) => (!truthy(&result)).then(|| message(rule, || "Invalid value".to_string())),
                Err(err) => {
                    warn!(field = %item.id, error = %err, "validation expression failed, treating as passed");
                    None
                }
            }
        }
        RuleKind::Other(kind) => {
            warn!(field = %item.id, rule = %kind, "unknown validation rule, skipping");
            None
        }
    }
}

/// Validates every visible field, skipping the whole subtree of an invisible
/// group or container.
pub fn validate_all_fields(
    evaluator: &Evaluator,
    template: &FormDefinition,
    state: &FormState,
) -> ValidationReport {
    let mut errors = BTreeMap::new();
    validate_items(evaluator, template.items(), state, None, &mut errors);
    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

fn validate_items(
    evaluator: &Evaluator,
    items: &[Item],
    state: &FormState,
    scope: Option<Scope<'_>>,
    errors: &mut BTreeMap<String, String>,
) {
    for item in items {
        if !evaluator.is_visible(item, state, scope) {
            continue;
        }
        if item.is_container() {
            validate_items(evaluator, &item.container_items, state, scope, errors);
        } else if item.is_group() {
            for (index, instance) in item.group_items.iter().enumerate() {
                let inner = Some(Scope::new(&item.id, index));
                validate_items(evaluator, &instance.fields, state, inner, errors);
            }
        } else {
            let value = state.get(&item.id, scope).cloned().unwrap_or_else(empty_value);
            if let Some(error) = validate_field_with(evaluator, item, &value, Some((state, scope))) {
                errors.insert(item.id.clone(), error);
            }
        }
    }
}
