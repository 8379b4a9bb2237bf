//! The document served by the form data endpoint.

use crate::error::TemplateError;
use crate::template::FormDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiDataItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiDataItems {
    #[serde(default)]
    pub items: Vec<ApiDataItem>,
}

/// `GET {formEndpoint}/{id}/data` response body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiDataResponse {
    pub form_template: FormDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_version: Option<Value>,
    #[serde(default)]
    pub logs: Value,
    #[serde(default)]
    pub data: ApiDataItems,
}

impl ApiDataResponse {
    pub fn from_json(source: &str) -> Result<Self, TemplateError> {
        Ok(serde_json::from_str(source)?)
    }
}

/// A loaded document: the definition as served plus prior values keyed by
/// field id. Group values are arrays of instance maps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FormData {
    pub form_definition: FormDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_version: Option<Value>,
    #[serde(default)]
    pub logs: Value,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl FormData {
    /// Items without an id are skipped; a `null` value loads as empty.
    pub fn from_api_response(response: ApiDataResponse) -> Self {
        let data = response
            .data
            .items
            .into_iter()
            .filter_map(|item| {
                let id = item.id.filter(|id| !id.is_empty())?;
                let value = match item.value {
                    Value::Null => Value::String(String::new()),
                    other => other,
                };
                Some((id, value))
            })
            .collect();
        Self {
            form_definition: response.form_template,
            form_version: response.form_version,
            logs: response.logs,
            data,
            metadata: Map::new(),
        }
    }

    /// A document with no prior values, for rendering a bare template.
    pub fn from_template(form_definition: FormDefinition) -> Self {
        Self {
            form_definition,
            ..Self::default()
        }
    }
}
