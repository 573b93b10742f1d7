// ABOUTME: Execution data model shared between the sandbox manager and session history
// ABOUTME: Executions are immutable once returned and serialize losslessly to JSON

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

pub fn new_execution_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Timeout,
    Interrupted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Ok => "ok",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionStatus::Ok)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// Subtype of the image MIME type, e.g. `png`
    pub format: String,
    /// Base64 payload
    pub data: String,
}

/// One rich output. A single display call may carry several representations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DisplayData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl DisplayData {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.html.is_none() && self.image.is_none() && self.json.is_none()
    }

    /// Build from a Jupyter-style MIME bundle. Unknown types are dropped.
    pub fn from_mime_bundle(bundle: &Map<String, Value>) -> Self {
        let mut display = DisplayData::default();
        for (mime, value) in bundle {
            match mime.as_str() {
                "text/plain" => display.text = value_as_text(value),
                "text/html" => display.html = value_as_text(value),
                "application/json" => display.json = Some(value.clone()),
                other => {
                    if let Some(format) = other.strip_prefix("image/") {
                        // first image representation wins
                        if display.image.is_none() {
                            if let Some(data) = value_as_text(value) {
                                display.image = Some(ImageData {
                                    format: format.to_string(),
                                    data: data.trim().to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }
        display
    }

    pub fn to_mime_bundle(&self) -> Map<String, Value> {
        let mut bundle = Map::new();
        if let Some(text) = &self.text {
            bundle.insert("text/plain".into(), Value::String(text.clone()));
        }
        if let Some(html) = &self.html {
            bundle.insert("text/html".into(), Value::String(html.clone()));
        }
        if let Some(image) = &self.image {
            bundle.insert(
                format!("image/{}", image.format),
                Value::String(image.data.clone()),
            );
        }
        if let Some(json) = &self.json {
            bundle.insert("application/json".into(), json.clone());
        }
        bundle
    }
}

// Jupyter allows multi-line strings to arrive as arrays of lines
fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(lines) => Some(
            lines
                .iter()
                .filter_map(|line| line.as_str())
                .collect::<Vec<_>>()
                .concat(),
        ),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Exception type name, e.g. `ZeroDivisionError`
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: Vec<String>,
}

impl ExecutionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of running one code submission inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub display_artifacts: Vec<DisplayData>,
    pub errors: Vec<ExecutionError>,
    pub status: ExecutionStatus,
    /// Monotonic per sandbox, starting at 1
    pub execution_count: u64,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl Execution {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// First error frame, if the run raised
    pub fn first_error(&self) -> Option<&ExecutionError> {
        self.errors.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Interrupted).unwrap(),
            "\"interrupted\""
        );
        assert_eq!(ExecutionStatus::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_display_from_mime_bundle() {
        let bundle = json!({
            "text/plain": "<Figure>",
            "image/png": "iVBORw0KGgo=\n",
            "application/json": {"rows": 3},
            "application/x-unknown": "ignored"
        });
        let display = DisplayData::from_mime_bundle(bundle.as_object().unwrap());

        assert_eq!(display.text.as_deref(), Some("<Figure>"));
        assert_eq!(
            display.image,
            Some(ImageData {
                format: "png".into(),
                data: "iVBORw0KGgo=".into()
            })
        );
        assert_eq!(display.json, Some(json!({"rows": 3})));
        assert!(display.html.is_none());
    }

    #[test]
    fn test_display_accepts_line_arrays() {
        let bundle = json!({"text/html": ["<b>", "hi", "</b>"]});
        let display = DisplayData::from_mime_bundle(bundle.as_object().unwrap());
        assert_eq!(display.html.as_deref(), Some("<b>hi</b>"));
    }

    #[test]
    fn test_empty_display_skips_fields() {
        let display = DisplayData::text("42");
        assert_eq!(serde_json::to_value(&display).unwrap(), json!({"text": "42"}));
        assert!(DisplayData::default().is_empty());
    }
}
