//! Build response message types.
//!
//! The engine answers a build request with newline-delimited JSON records.
//! Each record carries at most one of the fields that matter here: `stream`
//! (a fragment of the build log) or `error` (the build failed). The remaining
//! fields are kept for diagnostics only, and a value of an unexpected shape in
//! any of them is dropped rather than rejected.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One decoded record of the build response stream.
///
/// Unknown keys are ignored for interpretation but kept in `extra`, so a
/// record can be written back out unchanged. A record with none of the known
/// keys is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildMessage {
    /// Incremental build log text, including its own newlines.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub stream: Option<String>,

    /// Failure payload. Usually a string, but any JSON value is accepted,
    /// and a present key marks a failure even when its value is `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<Value>,

    /// Structured failure details sent alongside `error`.
    #[serde(
        rename = "errorDetail",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_detail: Option<ErrorDetail>,

    /// Progress status line (pulls, pushes).
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,

    /// Auxiliary payload, e.g. `{"ID": "sha256:..."}` once the image is written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<Value>,

    /// Every other key of the record.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Structured error detail (`errorDetail`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub code: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub message: Option<String>,
}

/// Deserialize `T`, or `None` when the value has another shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Keep any value, `null` included, so key presence survives decoding.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl BuildMessage {
    /// A message carrying only a log fragment.
    pub fn stream(text: impl Into<String>) -> Self {
        Self {
            stream: Some(text.into()),
            ..Default::default()
        }
    }

    /// A message carrying only a string error payload.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(Value::String(message.into())),
            ..Default::default()
        }
    }

    /// Whether this message signals a failed build.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_detail.is_some()
    }

    /// Human-readable failure message, if this message signals one.
    ///
    /// String payloads are returned as-is; structured payloads are rendered
    /// as compact JSON. `errorDetail.message` is used when `error` is absent
    /// or `null`.
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => self
                .error_detail
                .as_ref()
                .map(ErrorDetail::describe)
                .or_else(|| self.error.as_ref().map(|_| "build error".to_string())),
            Some(value) => Some(value.to_string()),
        }
    }

    /// Image id reported in the `aux` payload.
    pub fn image_id(&self) -> Option<&str> {
        self.aux.as_ref()?.get("ID")?.as_str()
    }
}

impl ErrorDetail {
    fn describe(&self) -> String {
        match (&self.message, self.code) {
            (Some(message), _) => message.clone(),
            (None, Some(code)) => format!("build error (code {code})"),
            (None, None) => "build error".to_string(),
        }
    }
}
