//! LLM response parsing.
//!
//! Raw model text is stripped of `<think>` blocks first (thought content is
//! posted as a comment, never consumed as data), then parsed as JSON with
//! two fallbacks: a fenced ```json block, then the first `{...}` substring.
//! Total failure yields None and the phase-specific fallback applies.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("valid regex"))
}

fn fenced_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"))
}

/// Remove `<think>...</think>` blocks, returning the cleaned text and the
/// extracted thought contents.
pub fn strip_think(text: &str) -> (String, Vec<String>) {
    let thoughts: Vec<String> = think_regex()
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let cleaned = think_regex().replace_all(text, "").trim().to_string();
    (cleaned, thoughts)
}

/// Extract a JSON object from model output.
pub fn extract_json(text: &str) -> Option<Value> {
    let (cleaned, _) = strip_think(text);

    // Direct parse first.
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned)
        && value.is_object()
    {
        return Some(value);
    }

    // Fenced code block.
    if let Some(captures) = fenced_regex().captures(&cleaned)
        && let Ok(value) = serde_json::from_str::<Value>(&captures[1])
    {
        return Some(value);
    }

    // First '{' to last '}'.
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&cleaned[start..=end]) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "extract_json: every strategy failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_think_extracts_thoughts() {
        let text = "<think>let me reason</think>the answer";
        let (cleaned, thoughts) = strip_think(text);
        assert_eq!(cleaned, "the answer");
        assert_eq!(thoughts, vec!["let me reason"]);
    }

    #[test]
    fn test_strip_think_multiline() {
        let text = "<think>line one\nline two</think>{\"done\": true}";
        let (cleaned, thoughts) = strip_think(text);
        assert_eq!(cleaned, "{\"done\": true}");
        assert!(thoughts[0].contains("line two"));
    }

    #[test]
    fn test_strip_think_no_blocks() {
        let (cleaned, thoughts) = strip_think("plain text");
        assert_eq!(cleaned, "plain text");
        assert!(thoughts.is_empty());
    }

    #[test]
    fn test_extract_direct_json() {
        let value = extract_json(r#"{"replan_needed": false}"#).unwrap();
        assert_eq!(value, json!({"replan_needed": false}));
    }

    #[test]
    fn test_extract_from_fenced_block() {
        let text = "Here is the plan:\n```json\n{\"goal\": \"fix bug\"}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["goal"], "fix bug");
    }

    #[test]
    fn test_extract_from_bare_fence() {
        let text = "```\n{\"x\": 1}\n```";
        assert_eq!(extract_json(text).unwrap()["x"], 1);
    }

    #[test]
    fn test_extract_embedded_object() {
        let text = "The result is {\"status\": \"ok\", \"n\": 3} as requested.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn test_extract_strips_think_first() {
        let text = "<think>{\"decoy\": 1}</think>{\"real\": 2}";
        let value = extract_json(text).unwrap();
        assert_eq!(value, json!({"real": 2}));
    }

    #[test]
    fn test_extract_failure_returns_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{broken").is_none());
        assert!(extract_json("").is_none());
    }
}
