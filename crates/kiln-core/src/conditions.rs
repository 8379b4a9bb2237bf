use crate::reader::read_body;
use crate::runtime::{self, Context, EvalError, EvalResult, Operators};
use crate::state::{FormState, Scope};
use crate::template::{Condition, ConditionKind, Item};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Evaluates item conditions against a state snapshot.
///
/// Every predicate is fail-safe: a missing condition or a failing expression
/// resolves to the default for its kind and is logged, never returned.
#[derive(Clone)]
pub struct Evaluator {
    operators: Arc<Operators>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(Operators::new())
    }
}

impl Evaluator {
    pub fn new(operators: Operators) -> Self {
        Self {
            operators: Arc::new(operators),
        }
    }

    pub fn shared() -> &'static Evaluator {
        static SHARED: OnceLock<Evaluator> = OnceLock::new();
        SHARED.get_or_init(Evaluator::default)
    }

    pub fn operators(&self) -> &Operators {
        &self.operators
    }

    /// Evaluates a stored expression body (JSON or textual).
    pub fn evaluate(
        &self,
        body: &Value,
        state: &FormState,
        scope: Option<Scope<'_>>,
        value: Option<&Value>,
    ) -> EvalResult {
        let expr = read_body(body).map_err(|e| EvalError::new(e.to_string()))?;
        let ctx = Context {
            form_states: &state.form_states,
            group_states: &state.group_states,
            scope,
            value,
            operators: &self.operators,
        };
        runtime::evaluate(&expr, &ctx)
    }

    fn run(&self, item: &Item, condition: &Condition, state: &FormState, scope: Option<Scope<'_>>) -> Option<Value> {
        match self.evaluate(&condition.value, state, scope, None) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(
                    field = %item.id,
                    condition = %condition.kind,
                    error = %err,
                    "condition evaluation failed, using default"
                );
                None
            }
        }
    }

    fn predicate(
        &self,
        kind: &ConditionKind,
        item: &Item,
        state: &FormState,
        scope: Option<Scope<'_>>,
        default: bool,
    ) -> bool {
        let Some(condition) = item.condition(kind) else {
            return default;
        };
        self.run(item, condition, state, scope)
            .map_or(default, |v| runtime::truthy(&v))
    }

    /// Visible unless a visibility condition evaluates falsy.
    pub fn is_visible(&self, item: &Item, state: &FormState, scope: Option<Scope<'_>>) -> bool {
        self.predicate(&ConditionKind::Visibility, item, state, scope, true)
    }

    pub fn is_read_only(&self, item: &Item, state: &FormState, scope: Option<Scope<'_>>) -> bool {
        self.predicate(&ConditionKind::ReadOnly, item, state, scope, false)
    }

    pub fn save_on_submit(&self, item: &Item, state: &FormState, scope: Option<Scope<'_>>) -> bool {
        self.predicate(&ConditionKind::SaveOnSubmit, item, state, scope, false)
    }

    /// Hidden fields are still persisted when `saveOnSubmit` holds.
    pub fn should_save(&self, item: &Item, state: &FormState, scope: Option<Scope<'_>>) -> bool {
        self.is_visible(item, state, scope) || self.save_on_submit(item, state, scope)
    }

    /// The derived value, or `None` when the item has no calculated value or
    /// the expression failed.
    pub fn calculated_value(
        &self,
        item: &Item,
        state: &FormState,
        scope: Option<Scope<'_>>,
    ) -> Option<Value> {
        let condition = item.condition(&ConditionKind::CalculatedValue)?;
        self.run(item, condition, state, scope)
    }

    /// Evaluates the calculated value and stores it when it differs from the
    /// stored one. Returns `Some(changed)` when a value was computed.
    pub fn apply_calculated_value(
        &self,
        item: &Item,
        state: &mut FormState,
        scope: Option<Scope<'_>>,
    ) -> Option<bool> {
        let computed = self.calculated_value(item, state, scope)?;
        if state.get(&item.id, scope) == Some(&computed) {
            return Some(false);
        }
        Some(state.set(&item.id, scope, computed))
    }
}
