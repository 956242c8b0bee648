//! Small helpers shared by the client, transport and services.

use serde_json::Value;

/// Trimmed text, or `None` when nothing but whitespace is left.
pub fn non_blank(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// Key as the API sends it: a non-blank string or an integer.
///
/// PHP ids arrive as numbers; cursors and client ids as strings.
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => non_blank(text).map(str::to_string),
        Value::Number(number) if number.is_i64() || number.is_u64() => Some(number.to_string()),
        _ => None,
    }
}

pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

pub fn is_ws_url(value: &str) -> bool {
    value.starts_with("ws://") || value.starts_with("wss://")
}

/// First 180 characters of a response body, for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Wall-clock Unix milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn non_blank_trims() {
        assert_eq!(non_blank("  n-1 "), Some("n-1"));
        assert_eq!(non_blank(" \t"), None);
    }

    #[test]
    fn key_text_accepts_strings_and_integers() {
        assert_eq!(key_text(&json!(42)), Some("42".to_string()));
        assert_eq!(key_text(&json!(" n-1 ")), Some("n-1".to_string()));
        assert_eq!(key_text(&json!("")), None);
        assert_eq!(key_text(&json!(1.5)), None);
        assert_eq!(key_text(&json!(null)), None);
    }

    #[test]
    fn push_urls_need_a_websocket_scheme() {
        assert!(is_ws_url("ws://127.0.0.1:8080/app"));
        assert!(is_ws_url("wss://push.petsit.test"));
        assert!(!is_ws_url("https://push.petsit.test"));
        assert!(is_http_url("http://10.0.2.2:8000"));
    }
}
