//! Read-only view of a received stanza's payload.
//!
//! Extracting the JSON from the stanza and parsing it are each done at most
//! once per stanza; every later accessor returns the cached result. Handlers
//! receive a `&MessageSource` next to the typed model for diagnostics.

use std::sync::OnceLock;

use serde_json::{Map, Value};

use crate::transport::Stanza;
use crate::utils::error::SourceError;

#[derive(Debug)]
pub struct MessageSource {
    stanza: Stanza,
    json: OnceLock<Result<String, SourceError>>,
    value: OnceLock<Result<Value, SourceError>>,
}

impl MessageSource {
    pub fn new(stanza: Stanza) -> Self {
        Self {
            stanza,
            json: OnceLock::new(),
            value: OnceLock::new(),
        }
    }

    /// Builds a source around a bare JSON payload, wrapping it in a stanza.
    pub fn from_json(json: impl Into<String>) -> Self {
        let json = json.into();
        let source = Self::new(Stanza::wrap_json(&json));
        let _ = source.json.set(Ok(json));
        source
    }

    pub fn stanza(&self) -> &Stanza {
        &self.stanza
    }

    /// The payload as the raw JSON text found in the stanza.
    pub fn as_json_str(&self) -> Result<&str, SourceError> {
        self.json
            .get_or_init(|| self.stanza.extract_json())
            .as_deref()
            .map_err(Clone::clone)
    }

    /// The payload parsed as a JSON object.
    pub fn as_value(&self) -> Result<&Value, SourceError> {
        self.value
            .get_or_init(|| {
                let json = self.as_json_str()?;
                let value: Value =
                    serde_json::from_str(json).map_err(|e| SourceError::Json(e.to_string()))?;
                if value.is_object() {
                    Ok(value)
                } else {
                    Err(SourceError::Json(format!("expected an object, got `{value}`")))
                }
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn as_map(&self) -> Result<&Map<String, Value>, SourceError> {
        self.as_value()?
            .as_object()
            .ok_or_else(|| SourceError::Json("expected an object".to_string()))
    }

    /// Convenience lookup of a top-level string field.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.as_map().ok()?.get(key)?.as_str()
    }
}
