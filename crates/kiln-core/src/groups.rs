//! Repeater instance insertion, removal and clearing.
//!
//! Each operation changes the template and the state together. Failures are
//! reported before anything is touched, so a rejected call leaves both sides
//! as they were.

use crate::error::StructureError;
use crate::identity;
use crate::state::{FormState, Scope, empty_value};
use crate::template::{FormDefinition, GroupInstance, Item, relabel_fields};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Appends a clone of instance 0, relabeled with the next index. Nested
/// groups in the clone start with a single instance.
///
/// Returns the new instance's index.
pub fn add_group_item(
    template: &mut FormDefinition,
    state: &mut FormState,
    group_id: &str,
    initial: Option<&Map<String, Value>>,
) -> Result<usize, StructureError> {
    let index = push_template_instance(template, group_id)?;

    // A stale slot past the old end must not leak into the new instance.
    state
        .group_states
        .entry(group_id.to_string())
        .or_default()
        .truncate(index);
    state.fill_missing(template);

    if let Some(values) = initial {
        seed_instance(template, state, group_id, index, values)?;
    }
    info!(group_id, index, "group instance added");
    Ok(index)
}

/// Template half of [`add_group_item`]: appends a relabeled clone of instance 0
/// without touching any state.
pub(crate) fn push_template_instance(
    template: &mut FormDefinition,
    group_id: &str,
) -> Result<usize, StructureError> {
    let group = template
        .find_group_mut(group_id)
        .ok_or_else(|| StructureError::GroupNotFound(group_id.to_string()))?;
    let mut instance = group
        .group_items
        .first()
        .cloned()
        .ok_or_else(|| StructureError::NoTemplateInstance(group_id.to_string()))?;
    let index = group.group_items.len();

    reset_nested_groups(&mut instance.fields);
    relabel_fields(&mut instance.fields, group_id, group_id, index, &mut |_, _| {});
    group.group_items.push(instance);
    Ok(index)
}

/// Removes instance `index` and renumbers the following instances so ids and
/// state positions stay contiguous from 0. State of the removed instance,
/// including its nested groups, is dropped.
pub fn remove_group_item(
    template: &mut FormDefinition,
    state: &mut FormState,
    group_id: &str,
    index: usize,
) -> Result<(), StructureError> {
    let group = template
        .find_group_mut(group_id)
        .ok_or_else(|| StructureError::GroupNotFound(group_id.to_string()))?;
    let count = group.group_items.len();
    if index >= count {
        return Err(StructureError::InstanceOutOfRange {
            group_id: group_id.to_string(),
            index,
        });
    }
    if count == 1 {
        return Err(StructureError::LastInstance(group_id.to_string()));
    }

    let removed = group.group_items.remove(index);
    let mut dropped = HashSet::new();
    collect_ids(&removed.fields, &mut dropped);

    let mut renames = HashMap::new();
    for (new_index, instance) in group.group_items.iter_mut().enumerate().skip(index) {
        relabel_fields(&mut instance.fields, group_id, group_id, new_index, &mut |old, new| {
            renames.insert(old.to_string(), new.to_string());
        });
    }

    if let Some(states) = state.group_states.get_mut(group_id) {
        if index < states.len() {
            states.remove(index);
        }
    }
    state.migrate(&renames, &dropped);
    state.reconcile(template);
    info!(group_id, index, remaining = count - 1, "group instance removed");
    Ok(())
}

/// Empties every field of every instance of the group, nested groups
/// included, without removing instances. Returns the cleared field ids.
pub fn clear_group_item(
    template: &FormDefinition,
    state: &mut FormState,
    group_id: &str,
) -> Result<Vec<String>, StructureError> {
    let group = template
        .find_group(group_id)
        .ok_or_else(|| StructureError::GroupNotFound(group_id.to_string()))?;
    let mut cleared = state.clear_group(group_id);
    for instance in &group.group_items {
        for nested in nested_group_ids(&instance.fields) {
            cleared.extend(state.clear_group(&nested));
        }
    }
    debug!(group_id, fields = cleared.len(), "group cleared");
    Ok(cleared)
}

/// Empties the container's fields and clears its groups and nested
/// containers. Returns the cleared field ids.
pub fn clear_container(
    template: &FormDefinition,
    state: &mut FormState,
    container_id: &str,
) -> Result<Vec<String>, StructureError> {
    let container = template
        .find_container(container_id)
        .ok_or_else(|| StructureError::ContainerNotFound(container_id.to_string()))?;
    let mut cleared = Vec::new();
    clear_items(template, state, &container.container_items, &mut cleared)?;
    debug!(container_id, fields = cleared.len(), "container cleared");
    Ok(cleared)
}

fn clear_items(
    template: &FormDefinition,
    state: &mut FormState,
    items: &[Item],
    cleared: &mut Vec<String>,
) -> Result<(), StructureError> {
    for item in items {
        if item.is_container() {
            clear_items(template, state, &item.container_items, cleared)?;
        } else if item.is_group() {
            cleared.extend(clear_group_item(template, state, &item.id)?);
        } else if clear_value(state, &item.id) {
            cleared.push(item.id.clone());
        }
    }
    Ok(())
}

fn clear_value(state: &mut FormState, field_id: &str) -> bool {
    let scope = match state.locate(field_id) {
        Some((scope, _)) => scope.map(|s| (s.group_id.to_string(), s.index)),
        None => return false,
    };
    let scope = scope.as_ref().map(|(g, i)| Scope::new(g, *i));
    state.set(field_id, scope, empty_value());
    state.set_error(field_id, None);
    true
}

/// Writes prior values into an existing instance. Keys may be local or
/// namespaced; arrays under a nested group's key seed that group.
pub(crate) fn seed_instance(
    template: &mut FormDefinition,
    state: &mut FormState,
    group_id: &str,
    index: usize,
    values: &Map<String, Value>,
) -> Result<(), StructureError> {
    for (key, value) in values {
        let id = identity::namespace(group_id, index, key);
        if let Value::Array(instances) = value {
            if template.find_group(&id).is_some() {
                seed_group(template, state, &id, instances)?;
                continue;
            }
        }
        let known = state
            .get(&id, Some(Scope::new(group_id, index)))
            .is_some();
        if known {
            state.set(&id, Some(Scope::new(group_id, index)), value.clone());
        } else {
            debug!(group_id, index, key = %key, "prior value has no matching field, ignored");
        }
    }
    Ok(())
}

/// Seeds a group from a list of prior instance maps, adding instances past
/// the template's count.
pub(crate) fn seed_group(
    template: &mut FormDefinition,
    state: &mut FormState,
    group_id: &str,
    instances: &[Value],
) -> Result<(), StructureError> {
    for (index, values) in instances.iter().enumerate() {
        let existing = template
            .find_group(group_id)
            .map_or(0, |g| g.group_items.len());
        if index >= existing {
            add_group_item(template, state, group_id, None)?;
        }
        if let Value::Object(values) = values {
            seed_instance(template, state, group_id, index, values)?;
        }
    }
    Ok(())
}

fn reset_nested_groups(fields: &mut [Item]) {
    for field in fields {
        if field.is_container() {
            reset_nested_groups(&mut field.container_items);
        } else if field.is_group() {
            field.group_items.truncate(1);
            if field.group_items.is_empty() {
                field.group_items.push(GroupInstance::default());
            }
            for instance in &mut field.group_items {
                reset_nested_groups(&mut instance.fields);
            }
        }
    }
}

fn collect_ids(fields: &[Item], out: &mut HashSet<String>) {
    for field in fields {
        out.insert(field.id.clone());
        if field.is_container() {
            collect_ids(&field.container_items, out);
        } else if field.is_group() {
            for instance in &field.group_items {
                collect_ids(&instance.fields, out);
            }
        }
    }
}

fn nested_group_ids(fields: &[Item]) -> Vec<String> {
    let mut out = Vec::new();
    for field in fields {
        if field.is_container() {
            out.extend(nested_group_ids(&field.container_items));
        } else if field.is_group() {
            out.push(field.id.clone());
            for instance in &field.group_items {
                out.extend(nested_group_ids(&instance.fields));
            }
        }
    }
    out
}
