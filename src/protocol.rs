//! Wire types for the line-delimited JSON protocol.
//!
//! Every request is one line: `{"id": ..., "method": ..., "params": {...}}`.
//! Every response is one line: `{"id": ..., "result": {...}}` or
//! `{"id": ..., "error": {"message": ..., "type": ...}}`. The `id` is echoed
//! back exactly as received, whatever its JSON type.
//!
//! Handler-level failures are results, not errors: `{"success": false,
//! "error": ..., "error_type": ...}` plus the method's zero-valued fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;
use crate::updater::ContentMetadata;

/// First line written on startup.
pub fn ready_line() -> Value {
    serde_json::json!({ "status": "ready" })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Ping,
    Encode,
    Search,
    AddContent,
    Stats,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ping" => Some(Method::Ping),
            "encode" => Some(Method::Encode),
            "search" => Some(Method::Search),
            "add_content" => Some(Method::AddContent),
            "stats" => Some(Method::Stats),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::Encode => "encode",
            Method::Search => "search",
            Method::AddContent => "add_content",
            Method::Stats => "stats",
        }
    }
}

/// A request whose envelope parsed. `method` is still unvalidated.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

/// Parse one input line.
///
/// On failure the error carries whatever `id` could be recovered so the
/// response can still be correlated.
pub fn parse_request(line: &str) -> Result<Request, (Value, BridgeError)> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| (Value::Null, BridgeError::Protocol(format!("invalid JSON: {}", e))))?;

    let Value::Object(mut obj) = value else {
        return Err((
            Value::Null,
            BridgeError::Protocol("request must be a JSON object".to_string()),
        ));
    };

    let id = obj.remove("id").unwrap_or(Value::Null);
    let method = match obj.remove("method") {
        Some(Value::String(m)) => m,
        Some(_) => {
            return Err((id, BridgeError::Protocol("'method' must be a string".to_string())))
        }
        None => return Err((id, BridgeError::Protocol("missing 'method'".to_string()))),
    };
    let params = match obj.remove("params") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(p) => p,
    };

    Ok(Request { id, method, params })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn result(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => Self::error(id, &BridgeError::Internal(format!("serialize result: {}", e))),
        }
    }

    pub fn error(id: Value, err: &BridgeError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                message: err.to_string(),
                kind: err.kind().to_string(),
            }),
        }
    }
}

// ============ Params ============

#[derive(Debug, Clone, Deserialize)]
pub struct EncodeParams {
    #[serde(default)]
    pub sources: Vec<Value>,
    pub output_path: String,
    /// Maximum chunk length in characters.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Overlap between consecutive chunks in characters.
    #[serde(default)]
    pub overlap: Option<usize>,
    /// Accepted for compatibility; the configured embedder is always used.
    #[serde(default)]
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    #[serde(alias = "video_path")]
    pub bulk_data_file: String,
    #[serde(alias = "index_path")]
    pub index_file: String,
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddContentParams {
    pub bank_path: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<ContentMetadata>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub overlap: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsParams {
    pub bank_path: String,
}

// ============ Results ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingResult {
    pub status: String,
}

impl PingResult {
    pub fn pong() -> Self {
        Self {
            status: "pong".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub bulk_data: String,
    pub query_index: String,
    pub metadata_index: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeResult {
    pub success: bool,
    pub chunks_created: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<ArtifactPaths>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl EncodeResult {
    pub fn failure(err: &BridgeError) -> Self {
        Self {
            success: false,
            chunks_created: 0,
            files: None,
            stats: None,
            error: Some(err.to_string()),
            error_type: Some(err.kind().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub content: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub success: bool,
    pub results: Vec<SearchHit>,
    pub total_results: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl SearchResult {
    pub fn failure(err: &BridgeError) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            total_results: 0,
            search_time_ms: None,
            error: Some(err.to_string()),
            error_type: Some(err.kind().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddContentResult {
    pub success: bool,
    pub chunks_added: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl AddContentResult {
    pub fn failure(err: &BridgeError) -> Self {
        Self {
            success: false,
            chunks_added: 0,
            error: Some(err.to_string()),
            error_type: Some(err.kind().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsResult {
    pub success: bool,
    pub chunks: usize,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<ArtifactPaths>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl StatsResult {
    pub fn failure(err: &BridgeError) -> Self {
        Self {
            success: false,
            chunks: 0,
            size_bytes: 0,
            files: None,
            error: Some(err.to_string()),
            error_type: Some(err.kind().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_defaults_params() {
        let req = parse_request(r#"{"id": "a-1", "method": "ping"}"#).unwrap();
        assert_eq!(req.id, json!("a-1"));
        assert_eq!(req.method, "ping");
        assert_eq!(req.params, json!({}));
    }

    #[test]
    fn test_parse_request_keeps_id_type() {
        let req = parse_request(r#"{"id": 17, "method": "ping", "params": null}"#).unwrap();
        assert_eq!(req.id, json!(17));
    }

    #[test]
    fn test_malformed_json_has_null_id() {
        let (id, err) = parse_request("{not json").unwrap_err();
        assert_eq!(id, Value::Null);
        assert_eq!(err.kind(), "ProtocolError");
    }

    #[test]
    fn test_missing_method_keeps_best_effort_id() {
        let (id, err) = parse_request(r#"{"id": 9, "params": {}}"#).unwrap_err();
        assert_eq!(id, json!(9));
        assert_eq!(err.kind(), "ProtocolError");
    }

    #[test]
    fn test_non_object_request() {
        let (id, _) = parse_request("[1, 2]").unwrap_err();
        assert_eq!(id, Value::Null);
    }

    #[test]
    fn test_error_response_shape() {
        let resp = Response::error(json!(3), &BridgeError::UnknownMethod("frobnicate".into()));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], json!(3));
        assert_eq!(v["error"]["type"], json!("UnknownMethod"));
        assert!(v["error"]["message"].as_str().unwrap().contains("frobnicate"));
        assert!(v.get("result").is_none());
    }

    #[test]
    fn test_search_params_accept_legacy_names() {
        let p: SearchParams = serde_json::from_value(json!({
            "video_path": "bank.mp4",
            "index_path": "bank.json",
            "query": "q"
        }))
        .unwrap();
        assert_eq!(p.bulk_data_file, "bank.mp4");
        assert_eq!(p.index_file, "bank.json");
        assert_eq!(p.top_k, None);
    }

    #[test]
    fn test_failure_results_carry_zero_values() {
        let v = serde_json::to_value(AddContentResult::failure(&BridgeError::EmptyContent)).unwrap();
        assert_eq!(v["success"], json!(false));
        assert_eq!(v["chunks_added"], json!(0));
        assert_eq!(v["error_type"], json!("EmptyContent"));

        let v = serde_json::to_value(SearchResult::failure(&BridgeError::EmptyContent)).unwrap();
        assert_eq!(v["results"], json!([]));
    }
}
