use thiserror::Error;

/// Failure to read a template or document.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid template json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A group or container operation that did not resolve to the expected node.
///
/// Session operations log these and leave both the template and the state
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("group `{0}` not found")]
    GroupNotFound(String),

    #[error("container `{0}` not found")]
    ContainerNotFound(String),

    #[error("group `{group_id}` has no instance {index}")]
    InstanceOutOfRange { group_id: String, index: usize },

    /// Adding needs instance 0 as the clone source.
    #[error("group `{0}` has no template instance to clone")]
    NoTemplateInstance(String),

    /// The last instance doubles as the clone source for future adds.
    #[error("group `{0}` must keep at least one instance")]
    LastInstance(String),
}
