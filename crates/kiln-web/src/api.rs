//! Blocking HTTP client for the document, save and unlock endpoints.

use crate::config::KilnConfig;
use crate::error::ApiError;
use chrono::Local;
use kiln_core::{ApiDataResponse, FormSession, SavedDocument, ValidationReport};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Who is saving: the host page's form parameters plus a credential.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveIdentity {
    pub params: BTreeMap<String, String>,
    pub credential: Credential,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Credential {
    Token(String),
    Username(String),
    #[default]
    Anonymous,
}

impl SaveIdentity {
    fn apply_credential(&self, body: &mut Map<String, Value>) {
        match &self.credential {
            Credential::Token(token) => {
                body.insert("token".to_string(), json!(token));
            }
            Credential::Username(name) if !name.trim().is_empty() => {
                body.insert("username".to_string(), json!(name.trim()));
            }
            _ => {}
        }
    }

    fn param(&self, key: &str) -> Value {
        self.params.get(key).map_or(Value::Null, |v| json!(v))
    }

    /// `{attachmentId, OfficeName, savedForm, token|username}`
    pub fn save_body(&self, document: &SavedDocument) -> Result<Value, ApiError> {
        let mut body = Map::new();
        body.insert("attachmentId".to_string(), self.param("attachmentId"));
        body.insert("OfficeName".to_string(), self.param("OfficeName"));
        body.insert(
            "savedForm".to_string(),
            Value::String(serde_json::to_string(document)?),
        );
        self.apply_credential(&mut body);
        Ok(Value::Object(body))
    }

    /// Every form parameter plus the credential.
    pub fn unlock_body(&self) -> Value {
        let mut body: Map<String, Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        self.apply_credential(&mut body);
        Value::Object(body)
    }
}

#[derive(Debug)]
pub enum SaveOutcome {
    Saved,
    ValidationFailed(ValidationReport),
    SaveFailed(ApiError),
    /// The save went through but the lock could not be released.
    UnlockFailed(ApiError),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved)
    }
}

#[derive(Clone)]
pub struct FormApi {
    agent: ureq::Agent,
    form_endpoint: String,
    save_endpoint: String,
    unlock_endpoint: String,
}

impl FormApi {
    pub fn new(config: &KilnConfig) -> Self {
        let timeout = config.http_timeout();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            form_endpoint: config.form_endpoint.trim_end_matches('/').to_string(),
            save_endpoint: config.save_endpoint.clone(),
            unlock_endpoint: config.unlock_endpoint.clone(),
        }
    }

    /// `{formEndpoint}/{id}/data[?draft=true]`
    pub fn document_url(&self, form_version_id: &str, draft: bool) -> String {
        let query = if draft { "?draft=true" } else { "" };
        format!("{}/{}/data{}", self.form_endpoint, form_version_id, query)
    }

    pub fn fetch_document(
        &self,
        form_version_id: &str,
        draft: bool,
    ) -> Result<ApiDataResponse, ApiError> {
        let url = self.document_url(form_version_id, draft);
        let body = match self.agent.get(&url).call() {
            Ok(resp) => resp.into_string().map_err(|err| ApiError::Decode {
                url: url.clone(),
                message: err.to_string(),
            })?,
            Err(err) => return Err(request_error("GET", &url, err)),
        };
        serde_json::from_str(&body).map_err(|err| ApiError::Decode {
            url,
            message: err.to_string(),
        })
    }

    pub fn save(&self, identity: &SaveIdentity, document: &SavedDocument) -> Result<(), ApiError> {
        let body = identity.save_body(document)?;
        self.post(&self.save_endpoint, &body)
    }

    pub fn unlock(&self, identity: &SaveIdentity) -> Result<(), ApiError> {
        self.post(&self.unlock_endpoint, &identity.unlock_body())
    }

    fn post(&self, url: &str, body: &Value) -> Result<(), ApiError> {
        match self
            .agent
            .post(url)
            .set("content-type", "application/json")
            .send_string(&body.to_string())
        {
            Ok(_) => Ok(()),
            Err(err) => Err(request_error("POST", url, err)),
        }
    }

    /// Validates, then posts the projection. Nothing is sent when validation
    /// fails.
    pub fn save_session(&self, session: &mut FormSession, identity: &SaveIdentity) -> SaveOutcome {
        let report = session.validate_all();
        if !report.valid {
            warn!(errors = report.errors.len(), "save blocked by validation");
            return SaveOutcome::ValidationFailed(report);
        }
        let document = session.saved_document(Local::now().date_naive());
        match self.save(identity, &document) {
            Ok(()) => {
                info!("form saved");
                SaveOutcome::Saved
            }
            Err(err) => {
                warn!(error = %err, "save failed");
                SaveOutcome::SaveFailed(err)
            }
        }
    }

    pub fn save_and_close(&self, session: &mut FormSession, identity: &SaveIdentity) -> SaveOutcome {
        match self.save_session(session, identity) {
            SaveOutcome::Saved => match self.unlock(identity) {
                Ok(()) => SaveOutcome::Saved,
                Err(err) => {
                    warn!(error = %err, "unlock after save failed");
                    SaveOutcome::UnlockFailed(err)
                }
            },
            other => other,
        }
    }
}

fn request_error(method: &'static str, url: &str, err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::Status(status, resp) => ApiError::Status {
            method,
            url: url.to_string(),
            status,
            body: resp.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(err) => ApiError::Transport {
            method,
            url: url.to_string(),
            message: err.to_string(),
        },
    }
}
