use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys that hold a status directly, in priority order.
const STATUS_KEYS: [&str; 2] = ["conversation_status", "status"];

/// Keys that commonly wrap the interesting part of a payload.
const NESTING_KEYS: [&str; 5] = ["output", "data", "result", "response", "message"];

/// Flat message keys, in priority order.
const MESSAGE_KEYS: [&str; 4] = ["message", "response", "text", "reply"];

const MAX_DEPTH: usize = 64;

/// Display message and status pulled out of a backend reply, whatever its shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub message: Option<String>,
    pub status: Option<String>,
}

#[cfg(test)]
impl NormalizedResponse {
    pub fn is_finished(&self) -> bool {
        is_finished_status(self.status.as_deref())
    }
}

/// Accepted payload shapes.
#[derive(Debug)]
enum Payload<'a> {
    Text(&'a str),
    Array(&'a [Value]),
    /// An object whose `output` is itself an object or array.
    NestedOutput {
        fields: &'a Map<String, Value>,
        output: &'a Value,
    },
    Flat(&'a Map<String, Value>),
    Unsupported,
}

impl<'a> Payload<'a> {
    fn classify(value: &'a Value) -> Self {
        match value {
            Value::String(text) => Payload::Text(text),
            Value::Array(items) => Payload::Array(items),
            Value::Object(fields) => match fields.get("output") {
                Some(output @ (Value::Object(_) | Value::Array(_))) => {
                    Payload::NestedOutput { fields, output }
                }
                _ => Payload::Flat(fields),
            },
            _ => Payload::Unsupported,
        }
    }
}

/// Pulls the display message out of an arbitrary reply. Empty strings count
/// as no message.
pub fn extract_message(value: &Value) -> Option<String> {
    match Payload::classify(value) {
        Payload::Text(text) => non_empty(text),
        Payload::Array(items) => items
            .iter()
            .find_map(|item| extract_message(present(item, "output").unwrap_or(item))),
        Payload::NestedOutput { fields, output } => {
            let inner = present(output, "output")
                .or_else(|| present(output, "message"))
                .or_else(|| present(output, "text"))
                .unwrap_or(output);
            extract_message(inner).or_else(|| extract_from_flat_keys(fields))
        }
        Payload::Flat(fields) => match fields.get("output") {
            Some(Value::String(output)) => non_empty(output),
            _ => extract_from_flat_keys(fields),
        },
        Payload::Unsupported => None,
    }
}

// The first truthy key decides, even if nothing usable is found below it.
fn extract_from_flat_keys(fields: &Map<String, Value>) -> Option<String> {
    MESSAGE_KEYS
        .iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| is_truthy(value))
        .and_then(extract_message)
}

/// Fast-path status lookup over the well-known locations.
pub fn extract_status(data: &Value) -> Option<String> {
    let candidates: Vec<Option<&Value>> = match data {
        Value::Array(items) => {
            let first = items.first();
            vec![
                first.and_then(|f| f.get("output")).and_then(|o| o.get("status")),
                first.and_then(|f| f.get("status")),
            ]
        }
        Value::Object(_) => vec![
            data.get("conversation_status"),
            data.get("status"),
            data.get("output").and_then(|o| o.get("status")),
        ],
        _ => Vec::new(),
    };

    candidates.into_iter().flatten().find_map(status_text)
}

/// Returns `None` when neither a message nor a status could be found.
pub fn normalize(data: &Value) -> Option<NormalizedResponse> {
    let message = extract_message(data);
    let status = extract_status(data);

    if message.is_none() && status.is_none() {
        return None;
    }
    Some(NormalizedResponse { message, status })
}

/// Status lookup that falls back to searching the whole payload when the
/// fast path found nothing.
pub fn extract_conversation_status(
    raw: &Value,
    parsed: Option<&NormalizedResponse>,
) -> Option<String> {
    if let Some(status) = parsed.and_then(|p| p.status.clone()) {
        return Some(status);
    }

    STATUS_KEYS
        .iter()
        .filter_map(|key| raw.get(*key))
        .find_map(status_text)
        .or_else(|| walk_for_status(raw, 0))
}

// Nesting keys are searched first and skipped by the catch-all scan, so every
// node is visited at most once.
fn walk_for_status(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_DEPTH {
        return None;
    }

    match value {
        Value::Array(items) => items.iter().find_map(|item| walk_for_status(item, depth + 1)),
        Value::Object(fields) => {
            for key in STATUS_KEYS {
                match fields.get(key) {
                    Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                    Some(Value::Number(n)) => return Some(n.to_string()),
                    _ => {}
                }
            }

            let nested = NESTING_KEYS
                .iter()
                .filter_map(|key| fields.get(*key))
                .filter(|v| is_truthy(v))
                .find_map(|v| walk_for_status(v, depth + 1));
            if nested.is_some() {
                return nested;
            }

            fields
                .iter()
                .filter(|(key, _)| !NESTING_KEYS.contains(&key.as_str()))
                .find_map(|(_, v)| walk_for_status(v, depth + 1))
        }
        _ => None,
    }
}

/// `finished`, or the `finised` typo older deployments emitted, in any case
/// and with surrounding whitespace.
pub fn is_finished_status(status: Option<&str>) -> bool {
    match status {
        Some(status) => {
            let normalized = status.trim().to_lowercase();
            normalized == "finished" || normalized == "finised"
        }
        None => false,
    }
}

/// The raw top-level `message` string, used as a last resort.
pub fn raw_message(data: &Value) -> Option<String> {
    data.get("message").and_then(Value::as_str).and_then(non_empty)
}

fn present<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).filter(|v| !v.is_null())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn status_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Number(_) | Value::Bool(true) if is_truthy(value) => Some(value.to_string()),
        _ => None,
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn common_shapes_yield_the_same_message() {
        for payload in [
            json!({"message": "hi"}),
            json!([{"output": "hi"}]),
            json!({"output": {"output": "hi"}}),
            json!({"response": "hi"}),
            json!("hi"),
        ] {
            assert_eq!(extract_message(&payload).as_deref(), Some("hi"), "{payload}");
        }
    }

    #[test]
    fn array_of_nested_outputs_with_status() {
        let payload = json!([{"output": {"output": "Thanks!", "status": "in_progress"}}]);
        let normalized = normalize(&payload).unwrap();
        assert_eq!(normalized.message.as_deref(), Some("Thanks!"));
        assert_eq!(normalized.status.as_deref(), Some("in_progress"));
        assert!(!normalized.is_finished());
    }

    #[test]
    fn array_skips_elements_without_messages() {
        let payload = json!([{"output": ""}, {"irrelevant": true}, {"text": "second"}]);
        assert_eq!(extract_message(&payload).as_deref(), Some("second"));
    }

    #[test]
    fn nested_output_prefers_output_then_message_then_text() {
        let payload = json!({"output": {"message": "from message", "text": "from text"}});
        assert_eq!(extract_message(&payload).as_deref(), Some("from message"));

        let payload = json!({"output": {"text": "from text"}});
        assert_eq!(extract_message(&payload).as_deref(), Some("from text"));
    }

    #[test]
    fn nested_output_without_message_falls_through_to_flat_keys() {
        let payload = json!({"output": {"status": "finished"}, "reply": "bye"});
        assert_eq!(extract_message(&payload).as_deref(), Some("bye"));
    }

    #[test]
    fn flat_keys_follow_priority_order() {
        let payload = json!({"reply": "d", "text": "c", "response": "b", "message": "a"});
        assert_eq!(extract_message(&payload).as_deref(), Some("a"));

        let payload = json!({"reply": "d", "text": "c"});
        assert_eq!(extract_message(&payload).as_deref(), Some("c"));
    }

    #[test]
    fn doubly_nested_message_objects_are_followed() {
        let payload = json!({"message": {"response": {"text": "deep"}}});
        assert_eq!(extract_message(&payload).as_deref(), Some("deep"));
    }

    #[test]
    fn unsupported_values_give_nothing() {
        assert_eq!(extract_message(&json!(42)), None);
        assert_eq!(extract_message(&json!(null)), None);
        assert_eq!(extract_message(&json!({"message": 7})), None);
        assert_eq!(normalize(&json!({"success": true})), None);
    }

    #[test]
    fn status_priority() {
        let payload = json!([{"output": {"status": "a"}, "status": "b"}]);
        assert_eq!(extract_status(&payload).as_deref(), Some("a"));

        let payload = json!([{"output": "x", "status": "b"}]);
        assert_eq!(extract_status(&payload).as_deref(), Some("b"));

        let payload = json!({"conversation_status": "c", "status": "d"});
        assert_eq!(extract_status(&payload).as_deref(), Some("c"));

        let payload = json!({"status": "d", "output": {"status": "e"}});
        assert_eq!(extract_status(&payload).as_deref(), Some("d"));

        let payload = json!({"output": {"status": "e"}});
        assert_eq!(extract_status(&payload).as_deref(), Some("e"));
    }

    #[test]
    fn status_only_payload_still_normalizes() {
        let normalized = normalize(&json!({"conversation_status": "finished"})).unwrap();
        assert_eq!(normalized.message, None);
        assert!(normalized.is_finished());
    }

    #[test]
    fn finished_status_accepts_the_historical_typo() {
        assert!(is_finished_status(Some("Finished")));
        assert!(is_finished_status(Some(" FINISED ")));
        assert!(!is_finished_status(Some("in_progress")));
        assert!(!is_finished_status(None));
    }

    #[test]
    fn deep_search_finds_status_in_unusual_places() {
        let payload = json!({"data": {"result": [{"meta": {"conversation_status": "finished"}}]}});
        assert_eq!(extract_status(&payload), None);
        assert_eq!(
            extract_conversation_status(&payload, None).as_deref(),
            Some("finished")
        );
    }

    #[test]
    fn deep_search_prefers_nesting_keys_over_other_values() {
        let payload = json!({"aaa": {"status": "other"}, "result": {"status": "wanted"}});
        assert_eq!(
            extract_conversation_status(&payload, None).as_deref(),
            Some("wanted")
        );
    }

    #[test]
    fn parsed_status_wins_over_deep_search() {
        let payload = json!({"data": {"status": "deep"}});
        let parsed = NormalizedResponse {
            message: None,
            status: Some("shallow".into()),
        };
        assert_eq!(
            extract_conversation_status(&payload, Some(&parsed)).as_deref(),
            Some("shallow")
        );
    }

    #[test]
    fn numeric_statuses_are_rendered_as_text() {
        let payload = json!({"output": {"code": {"status": 200}}});
        assert_eq!(
            extract_conversation_status(&payload, None).as_deref(),
            Some("200")
        );
    }

    #[test]
    fn deep_search_is_bounded() {
        let mut payload = json!({"status": "too deep"});
        for _ in 0..(MAX_DEPTH + 10) {
            payload = json!({"wrapper": payload});
        }
        assert_eq!(extract_conversation_status(&payload, None), None);
    }

    #[test]
    fn raw_message_only_accepts_strings() {
        assert_eq!(raw_message(&json!({"message": "plain"})).as_deref(), Some("plain"));
        assert_eq!(raw_message(&json!({"message": {"text": "nested"}})), None);
    }
}
