//! Condition expression evaluator.
//!
//! Expressions are JSON trees. An array whose first element names a
//! registered operator is a call; every other value evaluates to itself
//! (arrays and objects element-wise). Operators only read the state snapshot
//! they are handed, they never write it.

use crate::identity;
use crate::state::{InstanceValues, Scope};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub type EvalResult = Result<Value, EvalError>;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

/// Read-only view an expression is evaluated against.
pub struct Context<'a> {
    pub form_states: &'a Map<String, Value>,
    pub group_states: &'a BTreeMap<String, Vec<InstanceValues>>,
    pub scope: Option<Scope<'a>>,
    /// Candidate value for validation expressions.
    pub value: Option<&'a Value>,
    pub operators: &'a Operators,
}

pub type Operator = fn(args: &[Value], ctx: &Context) -> EvalResult;

pub struct Operators {
    ops: HashMap<String, Operator>,
}

impl Operators {
    pub fn new() -> Self {
        let mut ops: HashMap<String, Operator> = HashMap::new();
        ops.insert("var".into(), op_var as Operator);
        ops.insert("field".into(), op_field as Operator);
        ops.insert("form".into(), op_form as Operator);
        ops.insert("group_field".into(), op_group_field as Operator);
        ops.insert("group".into(), op_group as Operator);
        ops.insert("group_id".into(), op_group_id as Operator);
        ops.insert("group_index".into(), op_group_index as Operator);
        ops.insert("value".into(), op_value as Operator);
        ops.insert("+".into(), op_add as Operator);
        ops.insert("-".into(), op_sub as Operator);
        ops.insert("*".into(), op_mul as Operator);
        ops.insert("/".into(), op_div as Operator);
        ops.insert("%".into(), op_mod as Operator);
        ops.insert("==".into(), op_eq as Operator);
        ops.insert("!=".into(), op_neq as Operator);
        ops.insert(">".into(), op_gt as Operator);
        ops.insert("<".into(), op_lt as Operator);
        ops.insert(">=".into(), op_gte as Operator);
        ops.insert("<=".into(), op_lte as Operator);
        ops.insert("if".into(), op_if as Operator);
        ops.insert("&&".into(), op_and as Operator);
        ops.insert("||".into(), op_or as Operator);
        ops.insert("!".into(), op_not as Operator);
        ops.insert("match".into(), op_match as Operator);
        ops.insert("do".into(), op_do as Operator);
        ops.insert("u.concat".into(), op_concat as Operator);
        ops.insert("u.lower".into(), op_lower as Operator);
        ops.insert("u.upper".into(), op_upper as Operator);
        ops.insert("u.contains".into(), op_contains as Operator);
        ops.insert("u.matches".into(), op_matches as Operator);
        ops.insert("u.template".into(), op_template as Operator);
        ops.insert("u.to_int".into(), op_to_int as Operator);
        ops.insert("u.to_float".into(), op_to_float as Operator);
        ops.insert("u.to_string".into(), op_to_string as Operator);
        ops.insert("u.trim".into(), op_trim as Operator);
        ops.insert("u.str_len".into(), op_str_len as Operator);
        ops.insert("len".into(), op_len as Operator);
        ops.insert("get".into(), op_get as Operator);
        ops.insert("empty?".into(), op_empty as Operator);
        ops.insert("sum".into(), op_sum as Operator);
        ops.insert("count".into(), op_count as Operator);
        ops.insert("sum_field".into(), op_sum_field as Operator);
        Self { ops }
    }

    pub fn get(&self, name: &str) -> Option<Operator> {
        self.ops.get(name).copied()
    }

    pub fn register(&mut self, name: impl Into<String>, operator: Operator) -> Option<Operator> {
        self.ops.insert(name.into(), operator)
    }
}

impl Default for Operators {
    fn default() -> Self {
        Self::new()
    }
}

pub fn evaluate(node: &Value, ctx: &Context) -> EvalResult {
    match node {
        Value::Array(arr) => {
            if arr.is_empty() {
                return Ok(Value::Array(vec![]));
            }
            if let Some(op_name) = arr.first().and_then(|v| v.as_str()) {
                if let Some(op) = ctx.operators.get(op_name) {
                    return op(&arr[1..], ctx);
                }
            }
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                out.push(evaluate(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k.clone(), evaluate(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(node.clone()),
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(if *b { 1 } else { 0 }),
        _ => None,
    }
}

/// Equality that treats `2`, `2.0` and `"2"` alike when a number is involved.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
            return x == y;
        }
    }
    false
}

/// Whole numbers come back as integers so `2 + 3` stores `5`, not `5.0`.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn require_arg<'a>(args: &'a [Value], index: usize, op: &str) -> Result<&'a Value, EvalError> {
    args.get(index)
        .ok_or_else(|| EvalError::new(format!("{op} requires argument {index}")))
}

fn eval_str(args: &[Value], index: usize, op: &str, ctx: &Context) -> Result<String, EvalError> {
    let v = evaluate(require_arg(args, index, op)?, ctx)?;
    match v {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(EvalError::new(format!("{op} argument {index} must be a string"))),
    }
}

fn eval_index(args: &[Value], index: usize, op: &str, ctx: &Context) -> Result<usize, EvalError> {
    let v = evaluate(require_arg(args, index, op)?, ctx)?;
    as_i64(&v)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| EvalError::new(format!("{op} argument {index} must be an index")))
}

fn map_get(map: &Map<String, Value>, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(Value::Object(map.clone()));
    }
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = map.get(first)?;
    for part in parts {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            Value::Array(arr) => {
                let idx = part.parse::<usize>().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current.clone())
}

fn group_instance<'a>(ctx: &'a Context, group_id: &str, index: usize) -> Option<&'a InstanceValues> {
    ctx.group_states.get(group_id)?.get(index)
}

fn group_value(ctx: &Context, group_id: &str, index: usize, local_id: &str) -> Option<Value> {
    let instance = group_instance(ctx, group_id, index)?;
    instance
        .get(&identity::namespace(group_id, index, local_id))
        .or_else(|| instance.get(local_id))
        .cloned()
}

fn op_var(args: &[Value], ctx: &Context) -> EvalResult {
    let raw = evaluate(require_arg(args, 0, "var")?, ctx)?;
    let Some(path) = raw.as_str() else {
        return Ok(Value::Null);
    };
    let (head, rest) = path.split_once('.').unwrap_or((path, ""));
    let out = match head {
        "formStates" => map_get(ctx.form_states, rest),
        "groupStates" => {
            let (group_id, tail) = rest.split_once('.').unwrap_or((rest, ""));
            ctx.group_states.get(group_id).and_then(|states| {
                let list = Value::Array(states.iter().cloned().map(Value::Object).collect());
                lookup_path(&list, tail)
            })
        }
        "groupId" => ctx.scope.map(|s| Value::String(s.group_id.to_string())),
        "groupIndex" => ctx.scope.map(|s| json!(s.index)),
        "value" => ctx.value.cloned(),
        _ => map_get(ctx.form_states, path),
    };
    Ok(out.unwrap_or(Value::Null))
}

fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            Value::Array(arr) => current = arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(current.clone())
}

/// `["field", id]`: the sibling in the current group instance when there is
/// one, otherwise the top-level field.
fn op_field(args: &[Value], ctx: &Context) -> EvalResult {
    let id = eval_str(args, 0, "field", ctx)?;
    if let Some(scope) = ctx.scope {
        if let Some(v) = group_value(ctx, scope.group_id, scope.index, &id) {
            return Ok(v);
        }
    }
    Ok(ctx.form_states.get(&id).cloned().unwrap_or(Value::Null))
}

fn op_form(args: &[Value], ctx: &Context) -> EvalResult {
    let id = eval_str(args, 0, "form", ctx)?;
    Ok(ctx.form_states.get(&id).cloned().unwrap_or(Value::Null))
}

fn op_group_field(args: &[Value], ctx: &Context) -> EvalResult {
    let group_id = eval_str(args, 0, "group_field", ctx)?;
    let index = eval_index(args, 1, "group_field", ctx)?;
    let id = eval_str(args, 2, "group_field", ctx)?;
    Ok(group_value(ctx, &group_id, index, &id).unwrap_or(Value::Null))
}

fn op_group(args: &[Value], ctx: &Context) -> EvalResult {
    let group_id = eval_str(args, 0, "group", ctx)?;
    Ok(ctx
        .group_states
        .get(&group_id)
        .map(|states| Value::Array(states.iter().cloned().map(Value::Object).collect()))
        .unwrap_or(Value::Null))
}

fn op_group_id(_args: &[Value], ctx: &Context) -> EvalResult {
    Ok(ctx
        .scope
        .map(|s| Value::String(s.group_id.to_string()))
        .unwrap_or(Value::Null))
}

fn op_group_index(_args: &[Value], ctx: &Context) -> EvalResult {
    Ok(ctx.scope.map(|s| json!(s.index)).unwrap_or(Value::Null))
}

fn op_value(_args: &[Value], ctx: &Context) -> EvalResult {
    Ok(ctx.value.cloned().unwrap_or(Value::Null))
}

fn op_add(args: &[Value], ctx: &Context) -> EvalResult {
    let mut total = 0.0;
    for arg in args {
        let v = evaluate(arg, ctx)?;
        total += as_f64(&v).unwrap_or(0.0);
    }
    Ok(number(total))
}

fn op_sub(args: &[Value], ctx: &Context) -> EvalResult {
    let first = evaluate(require_arg(args, 0, "-")?, ctx)?;
    let Some(second) = args.get(1) else {
        return Ok(number(-as_f64(&first).unwrap_or(0.0)));
    };
    let second = evaluate(second, ctx)?;
    Ok(number(as_f64(&first).unwrap_or(0.0) - as_f64(&second).unwrap_or(0.0)))
}

fn op_mul(args: &[Value], ctx: &Context) -> EvalResult {
    let mut product = 1.0;
    for arg in args {
        let v = evaluate(arg, ctx)?;
        product *= as_f64(&v).unwrap_or(0.0);
    }
    Ok(number(product))
}

fn op_div(args: &[Value], ctx: &Context) -> EvalResult {
    let a = evaluate(require_arg(args, 0, "/")?, ctx)?;
    let b = evaluate(require_arg(args, 1, "/")?, ctx)?;
    let denom = as_f64(&b).unwrap_or(0.0);
    if denom == 0.0 {
        return Err(EvalError::new("div by zero"));
    }
    Ok(number(as_f64(&a).unwrap_or(0.0) / denom))
}

fn op_mod(args: &[Value], ctx: &Context) -> EvalResult {
    let a = evaluate(require_arg(args, 0, "%")?, ctx)?;
    let b = evaluate(require_arg(args, 1, "%")?, ctx)?;
    let denom = as_i64(&b).unwrap_or(0);
    if denom == 0 {
        return Err(EvalError::new("mod by zero"));
    }
    as_i64(&a)
        .unwrap_or(0)
        .checked_rem(denom)
        .map(|rem| json!(rem))
        .ok_or_else(|| EvalError::new("mod overflow"))
}

fn cmp_numbers_or_strings(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(text(a).cmp(&text(b))),
    }
}

fn eval_pair(args: &[Value], op: &str, ctx: &Context) -> Result<(Value, Value), EvalError> {
    let a = evaluate(require_arg(args, 0, op)?, ctx)?;
    let b = evaluate(require_arg(args, 1, op)?, ctx)?;
    Ok((a, b))
}

fn op_eq(args: &[Value], ctx: &Context) -> EvalResult {
    let (a, b) = eval_pair(args, "==", ctx)?;
    Ok(Value::Bool(loose_eq(&a, &b)))
}

fn op_neq(args: &[Value], ctx: &Context) -> EvalResult {
    let (a, b) = eval_pair(args, "!=", ctx)?;
    Ok(Value::Bool(!loose_eq(&a, &b)))
}

fn op_gt(args: &[Value], ctx: &Context) -> EvalResult {
    let (a, b) = eval_pair(args, ">", ctx)?;
    Ok(Value::Bool(
        cmp_numbers_or_strings(&a, &b).is_some_and(|o| o.is_gt()),
    ))
}

fn op_lt(args: &[Value], ctx: &Context) -> EvalResult {
    let (a, b) = eval_pair(args, "<", ctx)?;
    Ok(Value::Bool(
        cmp_numbers_or_strings(&a, &b).is_some_and(|o| o.is_lt()),
    ))
}

fn op_gte(args: &[Value], ctx: &Context) -> EvalResult {
    let (a, b) = eval_pair(args, ">=", ctx)?;
    Ok(Value::Bool(
        cmp_numbers_or_strings(&a, &b).is_some_and(|o| !o.is_lt()),
    ))
}

fn op_lte(args: &[Value], ctx: &Context) -> EvalResult {
    let (a, b) = eval_pair(args, "<=", ctx)?;
    Ok(Value::Bool(
        cmp_numbers_or_strings(&a, &b).is_some_and(|o| !o.is_gt()),
    ))
}

fn op_if(args: &[Value], ctx: &Context) -> EvalResult {
    let cond = evaluate(require_arg(args, 0, "if")?, ctx)?;
    if truthy(&cond) {
        if let Some(t) = args.get(1) {
            evaluate(t, ctx)
        } else {
            Ok(Value::Null)
        }
    } else if let Some(f) = args.get(2) {
        evaluate(f, ctx)
    } else {
        Ok(Value::Null)
    }
}

fn op_and(args: &[Value], ctx: &Context) -> EvalResult {
    let mut last = Value::Bool(true);
    for arg in args {
        last = evaluate(arg, ctx)?;
        if !truthy(&last) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(last)
}

fn op_or(args: &[Value], ctx: &Context) -> EvalResult {
    for arg in args {
        let v = evaluate(arg, ctx)?;
        if truthy(&v) {
            return Ok(v);
        }
    }
    Ok(Value::Bool(false))
}

fn op_not(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "!")?, ctx)?;
    Ok(Value::Bool(!truthy(&v)))
}

fn op_match(args: &[Value], ctx: &Context) -> EvalResult {
    let value = evaluate(require_arg(args, 0, "match")?, ctx)?;
    let mut i = 1usize;
    while i + 1 < args.len() {
        let pat = evaluate(&args[i], ctx)?;
        if pat == Value::String("_".to_string()) || loose_eq(&pat, &value) {
            return evaluate(&args[i + 1], ctx);
        }
        i += 2;
    }
    Ok(Value::Null)
}

fn op_do(args: &[Value], ctx: &Context) -> EvalResult {
    let mut last = Value::Null;
    for arg in args {
        last = evaluate(arg, ctx)?;
    }
    Ok(last)
}

fn op_concat(args: &[Value], ctx: &Context) -> EvalResult {
    let mut out = String::new();
    for arg in args {
        out.push_str(&text(&evaluate(arg, ctx)?));
    }
    Ok(Value::String(out))
}

fn op_lower(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "u.lower")?, ctx)?;
    Ok(Value::String(text(&v).to_lowercase()))
}

fn op_upper(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "u.upper")?, ctx)?;
    Ok(Value::String(text(&v).to_uppercase()))
}

fn op_contains(args: &[Value], ctx: &Context) -> EvalResult {
    let (hay, needle) = eval_pair(args, "u.contains", ctx)?;
    let result = match hay {
        Value::String(s) => s.contains(&text(&needle)),
        Value::Array(arr) => arr.iter().any(|v| loose_eq(v, &needle)),
        _ => false,
    };
    Ok(Value::Bool(result))
}

fn op_matches(args: &[Value], ctx: &Context) -> EvalResult {
    let (subject, pattern) = eval_pair(args, "u.matches", ctx)?;
    let re = Regex::new(&text(&pattern))
        .map_err(|e| EvalError::new(format!("u.matches invalid pattern: {e}")))?;
    Ok(Value::Bool(re.is_match(&text(&subject))))
}

fn op_template(args: &[Value], ctx: &Context) -> EvalResult {
    let fmt = evaluate(require_arg(args, 0, "u.template")?, ctx)?;
    let mut out = text(&fmt);
    for arg in &args[1..] {
        let rep = text(&evaluate(arg, ctx)?);
        if out.contains("{}") {
            out = out.replacen("{}", &rep, 1);
        }
    }
    Ok(Value::String(out))
}

fn op_to_int(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "u.to_int")?, ctx)?;
    Ok(json!(as_i64(&v).unwrap_or(0)))
}

fn op_to_float(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "u.to_float")?, ctx)?;
    Ok(json!(as_f64(&v).unwrap_or(0.0)))
}

fn op_to_string(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "u.to_string")?, ctx)?;
    Ok(Value::String(text(&v)))
}

fn op_trim(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "u.trim")?, ctx)?;
    Ok(Value::String(text(&v).trim().to_string()))
}

fn op_str_len(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "u.str_len")?, ctx)?;
    Ok(json!(text(&v).chars().count()))
}

fn op_len(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "len")?, ctx)?;
    let n = match v {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        _ => 0,
    };
    Ok(json!(n))
}

fn op_get(args: &[Value], ctx: &Context) -> EvalResult {
    let (collection, key) = eval_pair(args, "get", ctx)?;
    let out = match (collection, key) {
        (Value::Object(obj), Value::String(k)) => obj.get(&k).cloned(),
        (Value::Array(arr), Value::Number(n)) => n.as_u64().and_then(|i| arr.get(i as usize).cloned()),
        (Value::Array(arr), Value::String(s)) => s.parse::<usize>().ok().and_then(|i| arr.get(i).cloned()),
        _ => None,
    };
    Ok(out.unwrap_or(Value::Null))
}

fn op_empty(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "empty?")?, ctx)?;
    Ok(Value::Bool(crate::state::is_empty_value(&v)))
}

fn op_sum(args: &[Value], ctx: &Context) -> EvalResult {
    let v = evaluate(require_arg(args, 0, "sum")?, ctx)?;
    let total = match v {
        Value::Array(items) => items.iter().filter_map(as_f64).sum(),
        other => as_f64(&other).unwrap_or(0.0),
    };
    Ok(number(total))
}

fn op_count(args: &[Value], ctx: &Context) -> EvalResult {
    let group_id = eval_str(args, 0, "count", ctx)?;
    Ok(json!(ctx.group_states.get(&group_id).map_or(0, Vec::len)))
}

/// `["sum_field", group, local_id]`: numeric total of one field across every
/// instance of a group.
fn op_sum_field(args: &[Value], ctx: &Context) -> EvalResult {
    let group_id = eval_str(args, 0, "sum_field", ctx)?;
    let id = eval_str(args, 1, "sum_field", ctx)?;
    let count = ctx.group_states.get(&group_id).map_or(0, Vec::len);
    let total = (0..count)
        .filter_map(|i| group_value(ctx, &group_id, i, &id))
        .filter_map(|v| as_f64(&v))
        .sum();
    Ok(number(total))
}
