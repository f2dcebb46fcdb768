//! User and protocol metadata attached to an upload.
//!
//! Metadata is an open map over JSON values. Two operations matter:
//! deep merging of partial updates, and the token-list encoding used by the
//! `Upload-Metadata` header and by the on-disk sidecar files.

use crate::errors::{ErrorCode, UploadError, UploadResult};
use base64::{Engine as _, engine::general_purpose};
use serde_json::{Map, Value};

/// Open string-keyed metadata map.
pub type Metadata = Map<String, Value>;

/// How token values are rendered inside a token list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValue {
    /// `key base64(text)`; non-string values are rendered as their JSON text.
    /// Decoding always yields strings.
    Raw,
    /// `key base64(json)`; every value round-trips with its type intact.
    Json,
}

/// Recursively merge `patch` into `target`.
///
/// Objects merge key by key. Arrays and scalars replace the target value
/// wholesale; arrays are never merged element-wise.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => merge_metadata(target, patch),
        (target, patch) => *target = patch,
    }
}

/// Deep-merge a metadata map into another.
pub fn merge_metadata(target: &mut Metadata, patch: Metadata) {
    for (key, value) in patch {
        match target.get_mut(&key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

/// Serialize metadata into a comma-separated `key base64(value)` list.
pub fn encode_tokens(metadata: &Metadata, mode: TokenValue) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            let text = match (mode, value) {
                (TokenValue::Raw, Value::String(s)) => s.clone(),
                (TokenValue::Raw, Value::Null) => return key.clone(),
                (_, other) => other.to_string(),
            };
            format!("{key} {}", general_purpose::STANDARD.encode(text))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a token list. Keys without a value decode to an empty string (raw)
/// or `null` (json).
pub fn decode_tokens(input: &str, mode: TokenValue) -> UploadResult<Metadata> {
    let mut metadata = Metadata::new();
    for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let mut parts = token.splitn(2, ' ');
        let key = parts.next().unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        let value = match parts.next().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => {
                let bytes = general_purpose::STANDARD.decode(encoded).map_err(|_| {
                    UploadError::with_message(
                        ErrorCode::BadRequest,
                        format!("invalid metadata value for key `{key}`"),
                    )
                })?;
                let text = String::from_utf8(bytes).map_err(|_| {
                    UploadError::with_message(
                        ErrorCode::BadRequest,
                        format!("metadata value for key `{key}` is not utf-8"),
                    )
                })?;
                match mode {
                    TokenValue::Raw => Value::String(text),
                    TokenValue::Json => serde_json::from_str(&text)?,
                }
            }
            _ => match mode {
                TokenValue::Raw => Value::String(String::new()),
                TokenValue::Json => Value::Null,
            },
        };
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

/// Approximate serialized size, used for the metadata size limit.
pub fn metadata_size(metadata: &Metadata) -> usize {
    serde_json::to_string(metadata).map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn merge_objects_key_by_key() {
        let mut target = json!({"a": {"x": 1, "y": 2}, "b": 1});
        deep_merge(&mut target, json!({"a": {"y": 3, "z": 4}}));
        assert_eq!(target, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1}));
    }

    #[test]
    fn merge_replaces_arrays_wholesale() {
        let mut target = json!({"chunks": [1, 2, 3]});
        deep_merge(&mut target, json!({"chunks": [9]}));
        assert_eq!(target, json!({"chunks": [9]}));
    }

    #[test]
    fn raw_tokens_follow_header_format() {
        let metadata = map(json!({"filename": "world_domination_plan.pdf"}));
        let encoded = encode_tokens(&metadata, TokenValue::Raw);
        assert_eq!(encoded, "filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==");
        let decoded = decode_tokens("filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential", TokenValue::Raw)
            .unwrap();
        assert_eq!(decoded["filename"], "world_domination_plan.pdf");
        assert_eq!(decoded["is_confidential"], "");
    }

    #[test]
    fn json_tokens_keep_value_types() {
        let metadata = map(json!({"chunks": [{"offset": 0, "length": 10}], "deferLength": true}));
        let encoded = encode_tokens(&metadata, TokenValue::Json);
        let decoded = decode_tokens(&encoded, TokenValue::Json).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = decode_tokens("name !!!", TokenValue::Raw).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }
}
