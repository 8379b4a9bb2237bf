//! Placeholder substitution for `text-info` items.
//!
//! `{formStates['id']}` and `{groupStates['g']?.[0]?.['g-0-id']}` are
//! replaced by the stored value. A trailing `|format:dd/MM/yyyy` renders a
//! `yyyy-MM-dd` value with the given date pattern.

use crate::state::{FormState, Scope};
use chrono::NaiveDate;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

/// Rendered in place of a missing or empty value.
pub const BLANK_LINE: &str = "______________________________";

const INVALID_DATE: &str = "Invalid Date";

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| {
            Regex::new(
                r"\{(?:formStates\['(.*?)'\]|groupStates\['(.*?)'\]\?\.\[(.*?)!?\]\?\.\['(.*?)'\])\|?(?:format:([\w/-]+))?\}",
            )
            .ok()
        })
        .as_ref()
}

/// Substitutes every placeholder in `text`. Inside a group, an index written
/// as `groupIndex` refers to the instance being rendered.
pub fn render_dynamic_text(text: &str, state: &FormState, scope: Option<Scope<'_>>) -> String {
    let Some(re) = placeholder() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures| {
        let value = lookup(caps, state, scope);
        let Some(value) = value.filter(is_present) else {
            return BLANK_LINE.to_string();
        };
        let value = display(&value);
        match caps.get(5) {
            Some(pattern) if is_iso_date(&value) => format_date(&value, pattern.as_str()),
            _ => value,
        }
    })
    .into_owned()
}

fn lookup(caps: &Captures, state: &FormState, scope: Option<Scope<'_>>) -> Option<Value> {
    if let Some(field_id) = caps.get(1) {
        return state.form_states.get(field_id.as_str()).cloned();
    }
    let group_id = caps.get(2)?.as_str();
    let raw_index = caps.get(3)?.as_str().trim();
    let field_id = caps.get(4)?.as_str();
    let index = match raw_index.parse::<usize>() {
        Ok(index) => index,
        Err(_) if raw_index == "groupIndex" => scope?.index,
        Err(_) => {
            debug!(group_id, index = raw_index, "placeholder index is not a number");
            return None;
        }
    };
    state
        .group_states
        .get(group_id)?
        .get(index)?
        .get(field_id)
        .cloned()
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn format_date(value: &str, pattern: &str) -> String {
    let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") else {
        return INVALID_DATE.to_string();
    };
    match to_strftime(pattern) {
        Some(fmt) => date.format(&fmt).to_string(),
        None => INVALID_DATE.to_string(),
    }
}

/// Translates a date-fns style pattern (`dd/MM/yyyy`, `MMMM d yyyy`) into a
/// strftime string. Unknown letters make the pattern invalid.
fn to_strftime(pattern: &str) -> Option<String> {
    let mut out = String::new();
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let run = chars[i..].iter().take_while(|&&n| n == c).count();
        i += run;
        if c == '%' {
            out.push_str(&"%%".repeat(run));
            continue;
        }
        if !c.is_ascii_alphabetic() {
            out.extend(std::iter::repeat_n(c, run));
            continue;
        }
        let directive = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('E', 4..) => "%A",
            ('E', _) => "%a",
            _ => return None,
        };
        out.push_str(directive);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> FormState {
        let mut state = FormState::default();
        state.set("name", None, json!("Ada"));
        state.set("born", None, json!("1815-12-10"));
        state.set("g-1-x", Some(Scope::new("g", 1)), json!("second"));
        state
    }

    #[test]
    fn substitutes_form_and_group_values() {
        let st = state();
        assert_eq!(
            render_dynamic_text("Hi {formStates['name']}!", &st, None),
            "Hi Ada!"
        );
        assert_eq!(
            render_dynamic_text("{groupStates['g']?.[1]?.['g-1-x']}", &st, None),
            "second"
        );
        assert_eq!(
            render_dynamic_text("{groupStates['g']?.[groupIndex]?.['g-1-x']}", &st, Some(Scope::new("g", 1))),
            "second"
        );
    }

    #[test]
    fn missing_values_render_a_blank_line() {
        let st = state();
        assert_eq!(render_dynamic_text("{formStates['nope']}", &st, None), BLANK_LINE);
        assert_eq!(render_dynamic_text("{groupStates['g']?.[0]?.['g-0-x']}", &st, None), BLANK_LINE);
    }

    #[test]
    fn dates_follow_the_format_pattern() {
        let st = state();
        assert_eq!(
            render_dynamic_text("{formStates['born']|format:dd/MM/yyyy}", &st, None),
            "10/12/1815"
        );
        assert_eq!(
            render_dynamic_text("{formStates['born']|format:MMMM-d-yyyy}", &st, None),
            "December-10-1815"
        );
        assert_eq!(
            render_dynamic_text("{formStates['born']|format:qq}", &st, None),
            INVALID_DATE
        );
        // Formats only apply to ISO dates.
        assert_eq!(
            render_dynamic_text("{formStates['name']|format:yyyy}", &st, None),
            "Ada"
        );
    }
}
