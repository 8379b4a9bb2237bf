//! Kiln core crate.
//!
//! A form template state engine, layered leaf-first:
//!
//! - `template` + `identity`: the item tree and the `{group}-{index}-{id}`
//!   namespacing of fields inside repeated group instances.
//! - `state`: flat values for top-level fields, per-instance maps for groups,
//!   and the error map.
//! - `runtime` + `reader` + `conditions`: a small read-only expression
//!   language and the fail-safe visibility/read-only/calculated/save
//!   predicates built on it.
//! - `groups`, `validation`, `projection`, `render`, `dynamic_text`:
//!   operations over a template and its state.
//! - `session`: one loaded document tying the above together.
//!
//! Nothing in this crate performs I/O; the web crate drives sessions.

pub mod conditions;
pub mod document;
pub mod dynamic_text;
pub mod error;
pub mod groups;
pub mod identity;
pub mod projection;
pub mod reader;
pub mod render;
pub mod runtime;
pub mod session;
pub mod state;
pub mod template;
pub mod validation;

pub use conditions::Evaluator;
pub use document::{ApiDataResponse, FormData};
pub use error::{StructureError, TemplateError};
pub use projection::SavedDocument;
pub use render::{FieldView, RenderOptions, RenderOutput};
pub use runtime::{EvalError, EvalResult, Operator, Operators};
pub use session::FormSession;
pub use state::{FieldChange, FormState, Scope};
pub use template::{FormDefinition, Item, ItemKind, RenderTarget};
pub use validation::{ValidationReport, validate_field};
