//! Output normalization.
//!
//! Converts heterogeneous Jupyter output records (stream text, rich display
//! data, execute results, error tracebacks) into a uniform ordered sequence of
//! [`OutputItem`]s. All text passes through ANSI stripping; image outputs are
//! gated by the configured image policy. Nothing else in the crate constructs
//! `OutputItem`s from raw kernel data.

use std::sync::OnceLock;

use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One normalized output entry, in kernel emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl OutputItem {
    pub fn text(text: impl Into<String>) -> Self {
        OutputItem::Text { text: text.into() }
    }

    /// Text content, or a short tag for non-text items. Used by the streaming
    /// strategy's log lines and by the cell table renderer.
    pub fn as_text(&self) -> &str {
        match self {
            OutputItem::Text { text } => text,
            OutputItem::Image { mime_type, .. } => mime_type,
        }
    }
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("static regex"))
}

/// Remove ANSI color escape sequences from text.
pub fn strip_ansi_codes(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

/// Join an nbformat text field, which may be a single string or a list of
/// lines, into one string.
fn join_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .concat(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extract one readable output from an nbformat-shaped output record.
///
/// Returns `None` for records that normalize to empty text.
pub fn extract_output(output: &Value, allow_images: bool) -> Option<OutputItem> {
    let obj = match output.as_object() {
        Some(obj) => obj,
        None => {
            let text = strip_ansi_codes(&join_text(output));
            return (!text.is_empty()).then(|| OutputItem::text(text));
        }
    };

    let output_type = obj.get("output_type").and_then(Value::as_str).unwrap_or("");
    let item = match output_type {
        "stream" => {
            let text = strip_ansi_codes(&join_text(obj.get("text").unwrap_or(&Value::Null)));
            OutputItem::text(text)
        }
        "display_data" | "execute_result" => {
            let empty = Value::Object(Default::default());
            let data = obj.get("data").unwrap_or(&empty);
            if let Some(png) = data.get("image/png") {
                let payload = join_text(png);
                // Reject payloads the client could not decode, matching the
                // text placeholder behavior for disabled images.
                let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
                if !allow_images {
                    OutputItem::text("[Image Output (PNG) - Image display disabled]")
                } else if base64::engine::general_purpose::STANDARD
                    .decode(cleaned.as_bytes())
                    .is_ok()
                {
                    OutputItem::Image {
                        data: cleaned,
                        mime_type: "image/png".to_string(),
                    }
                } else {
                    OutputItem::text("[Image Output (PNG) - Error processing image]")
                }
            } else if let Some(plain) = data.get("text/plain") {
                OutputItem::text(strip_ansi_codes(&join_text(plain)))
            } else if data.get("text/html").is_some() {
                OutputItem::text("[HTML Output]")
            } else {
                let keys: Vec<&str> = data
                    .as_object()
                    .map(|m| m.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                OutputItem::text(format!("[{output_type} Data: keys={keys:?}]"))
            }
        }
        "error" => {
            let traceback = obj.get("traceback").unwrap_or(&Value::Null);
            let text = match traceback {
                Value::Array(lines) => lines
                    .iter()
                    .map(|line| strip_ansi_codes(&join_text(line)))
                    .collect::<Vec<_>>()
                    .join("\n"),
                other => strip_ansi_codes(&join_text(other)),
            };
            OutputItem::text(text)
        }
        other => OutputItem::text(format!("[Unknown output type: {other}]")),
    };

    match &item {
        OutputItem::Text { text } if text.is_empty() => None,
        _ => Some(item),
    }
}

/// Extract all outputs of a cell, skipping entries that normalize to nothing.
pub fn safe_extract_outputs(outputs: &[Value], allow_images: bool) -> Vec<OutputItem> {
    outputs
        .iter()
        .filter_map(|output| extract_output(output, allow_images))
        .collect()
}

/// Strip fields that exist only in the runtime output representation and are
/// not part of the persisted interchange schema. Writing them back would make
/// the file fail schema validation on a later read.
pub fn scrub_transient(output: &mut Value) {
    if let Some(obj) = output.as_object_mut() {
        obj.remove("transient");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_ansi_from_stream_text() {
        let output = json!({
            "output_type": "stream",
            "name": "stdout",
            "text": "\x1b[31merror\x1b[0m line"
        });
        assert_eq!(
            extract_output(&output, true),
            Some(OutputItem::text("error line"))
        );
    }

    #[test]
    fn joins_list_form_stream_text() {
        let output = json!({
            "output_type": "stream",
            "name": "stdout",
            "text": ["a\n", "b\n", "c"]
        });
        assert_eq!(extract_output(&output, true), Some(OutputItem::text("a\nb\nc")));
    }

    #[test]
    fn execute_result_prefers_plain_text() {
        let output = json!({
            "output_type": "execute_result",
            "data": {"text/plain": "4", "text/html": "<b>4</b>"},
            "execution_count": 2
        });
        assert_eq!(extract_output(&output, true), Some(OutputItem::text("4")));
    }

    #[test]
    fn html_only_yields_placeholder() {
        let output = json!({
            "output_type": "display_data",
            "data": {"text/html": "<table/>"}
        });
        assert_eq!(
            extract_output(&output, true),
            Some(OutputItem::text("[HTML Output]"))
        );
    }

    #[test]
    fn image_policy_disables_png() {
        let png = base64::engine::general_purpose::STANDARD.encode(b"not-really-a-png");
        let output = json!({
            "output_type": "display_data",
            "data": {"image/png": png}
        });
        assert_eq!(
            extract_output(&output, false),
            Some(OutputItem::text("[Image Output (PNG) - Image display disabled]"))
        );
        match extract_output(&output, true) {
            Some(OutputItem::Image { mime_type, .. }) => assert_eq!(mime_type, "image/png"),
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn invalid_base64_falls_back_to_placeholder() {
        let output = json!({
            "output_type": "display_data",
            "data": {"image/png": "@@not base64@@"}
        });
        assert_eq!(
            extract_output(&output, true),
            Some(OutputItem::text("[Image Output (PNG) - Error processing image]"))
        );
    }

    #[test]
    fn error_traceback_is_joined_and_cleaned() {
        let output = json!({
            "output_type": "error",
            "ename": "ValueError",
            "evalue": "bad",
            "traceback": ["\x1b[31mTraceback\x1b[0m", "ValueError: bad"]
        });
        assert_eq!(
            extract_output(&output, true),
            Some(OutputItem::text("Traceback\nValueError: bad"))
        );
    }

    #[test]
    fn unknown_type_is_tagged() {
        let output = json!({"output_type": "mystery"});
        assert_eq!(
            extract_output(&output, true),
            Some(OutputItem::text("[Unknown output type: mystery]"))
        );
    }

    #[test]
    fn empty_outputs_are_skipped() {
        let outputs = vec![
            json!({"output_type": "stream", "name": "stdout", "text": ""}),
            json!({"output_type": "stream", "name": "stdout", "text": "hi"}),
        ];
        assert_eq!(
            safe_extract_outputs(&outputs, true),
            vec![OutputItem::text("hi")]
        );
    }

    #[test]
    fn scrub_removes_transient_only() {
        let mut output = json!({
            "output_type": "display_data",
            "data": {"text/plain": "x"},
            "transient": {"display_id": "abc"}
        });
        scrub_transient(&mut output);
        assert!(output.get("transient").is_none());
        assert!(output.get("data").is_some());
    }
}
