use kiln_core::identity;
use kiln_core::{FormData, FormDefinition, FormSession, RenderTarget};
use serde_json::{Value, json};

fn definition(items: Value) -> FormDefinition {
    FormDefinition::from_value(json!({"id": "doc", "data": {"items": items}})).expect("template")
}

fn session(items: Value, data: Value) -> FormSession {
    FormSession::load(FormData {
        form_definition: definition(items),
        data: data.as_object().cloned().unwrap_or_default(),
        ..FormData::default()
    })
}

fn people() -> Value {
    json!([
        {"id": "g1", "type": "group", "repeater": true, "groupItems": [
            {"fields": [
                {"id": "name", "type": "text-input"},
                {"id": "age", "type": "number-input"}
            ]}
        ]}
    ])
}

fn assert_consistent(session: &FormSession, group_id: &str) {
    let group = session.template().find_group(group_id).expect("group");
    let states = &session.state().group_states[group_id];
    assert_eq!(states.len(), group.group_items.len());
    for (index, instance) in group.group_items.iter().enumerate() {
        for field in &instance.fields {
            assert_eq!(
                identity::split_prefix(group_id, &field.id).map(|(i, _)| i),
                Some(index),
                "{} carries a stale index",
                field.id
            );
            assert!(states[index].contains_key(&field.id));
        }
        assert_eq!(states[index].len(), instance.fields.len());
    }
}

#[test]
fn add_and_remove_sequences_keep_indices_contiguous() {
    let mut s = session(people(), json!({}));
    let ops: &[(&str, usize)] = &[
        ("add", 0),
        ("add", 0),
        ("add", 0),
        ("remove", 1),
        ("remove", 0),
        ("add", 0),
        ("remove", 2),
        ("remove", 5),
        ("remove", 0),
        ("remove", 0),
    ];
    for (op, index) in ops {
        match *op {
            "add" => {
                s.add_group_item("g1", None);
            }
            _ => {
                s.remove_group_item("g1", *index);
            }
        }
        assert_consistent(&s, "g1");
    }
    assert_eq!(s.state().group_states["g1"].len(), 1);
}

#[test]
fn removing_the_middle_instance_shifts_values() {
    let mut s = session(
        people(),
        json!({"g1": [
            {"g1-0-name": "a", "g1-0-age": 1},
            {"g1-1-name": "b", "g1-1-age": 2},
            {"g1-2-name": "c", "g1-2-age": 3}
        ]}),
    );
    assert!(s.remove_group_item("g1", 1));
    assert_consistent(&s, "g1");
    let states = &s.state().group_states["g1"];
    assert_eq!(states[0]["g1-0-name"], json!("a"));
    assert_eq!(states[1]["g1-1-name"], json!("c"));
    assert_eq!(states[1]["g1-1-age"], json!(3));
}

#[test]
fn unchanged_session_projects_its_visible_input() {
    let items = json!([
        {"id": "married", "type": "radio"},
        {"id": "spouse", "type": "text-input",
         "conditions": [{"type": "visibility", "value": "(== (field \"married\") \"yes\")"}]},
        {"id": "reference", "type": "text-input",
         "conditions": [{"type": "visibility", "value": false}, {"type": "saveOnSubmit", "value": "true"}]},
        {"id": "details", "type": "container", "containerItems": [
            {"id": "city", "type": "text-input"}
        ]},
        {"id": "g1", "type": "group", "groupItems": [
            {"fields": [{"id": "name", "type": "text-input"}]}
        ]}
    ]);
    let data = json!({
        "married": "no",
        "spouse": "Sam",
        "reference": "R-1",
        "city": "Victoria",
        "g1": [{"g1-0-name": "a"}, {"g1-1-name": "b"}]
    });
    let s = session(items, data.clone());

    let mut expected = data.as_object().cloned().expect("object");
    expected.remove("spouse");
    assert_eq!(s.project(), expected);
}

#[test]
fn toggling_a_sibling_changes_visibility_immediately() {
    let items = json!([
        {"id": "married", "type": "radio"},
        {"id": "spouse", "type": "text-input",
         "conditions": [{"type": "visibility", "value": ["==", ["field", "married"], "yes"]}]}
    ]);
    let mut s = session(items, json!({"married": "no"}));
    let shown = |s: &mut FormSession| {
        s.render(RenderTarget::Web)
            .fields
            .iter()
            .any(|f| f.id == "spouse")
    };
    assert!(!shown(&mut s));
    s.handle_input_change("married", json!("yes"), None);
    assert!(shown(&mut s));
    s.handle_input_change("married", json!("no"), None);
    assert!(!shown(&mut s));
}

#[test]
fn calculated_value_emits_only_real_changes() {
    let items = json!([
        {"id": "g1", "type": "group", "groupItems": [
            {"fields": [
                {"id": "qty", "type": "number-input"},
                {"id": "price", "type": "number-input"},
                {"id": "line", "type": "number-input",
                 "conditions": [{"type": "calculatedValue",
                                 "value": "(* (field \"qty\") (field \"price\"))"}]}
            ]}
        ]},
        {"id": "total", "type": "number-input",
         "conditions": [{"type": "calculatedValue", "value": "(sum_field \"g1\" \"line\")"}]}
    ]);
    let mut s = session(
        items,
        json!({"g1": [{"g1-0-qty": 2, "g1-0-price": 5}, {"g1-1-qty": 1, "g1-1-price": 4}]}),
    );
    s.take_changes();

    s.render(RenderTarget::Web);
    let changes = s.take_changes();
    let ids: Vec<&str> = changes.iter().map(|c| c.field_id.as_str()).collect();
    assert_eq!(ids, vec!["g1-0-line", "g1-1-line", "total"]);
    assert_eq!(s.value("total"), Some(&json!(14)));

    s.render(RenderTarget::Web);
    assert!(s.take_changes().is_empty());
}

#[test]
fn saved_document_carries_the_served_definition() {
    let mut s = session(people(), json!({"g1": [{"g1-0-name": "a"}, {"g1-1-name": "b"}]}));
    s.add_group_item("g1", None);
    let date = chrono::NaiveDate::from_ymd_opt(2025, 11, 2).expect("date");
    let doc = s.saved_document(date);
    assert_eq!(doc.form_definition, definition(people()));
    assert_eq!(doc.metadata["updated_date"], json!("11/2/2025"));
    assert_eq!(doc.data["g1"].as_array().map(Vec::len), Some(3));
}
