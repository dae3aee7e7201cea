use scan_relay_common::config::SubmissionConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNKNOWN_RESPONSE: &str = "Processing failed (unknown server response)";
pub const TRANSPORT_FAILED: &str = "Processing failed (network or permissions).";

/// A decoded string that is a JSON object carrying the recognised `qr_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionPayload(Value);

impl SubmissionPayload {
    /// Anything that is not a JSON object tagged with `tag` is display-only.
    pub fn from_decoded(decoded: &str, tag: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(decoded.trim()).ok()?;
        let qr_type = value.as_object()?.get("qr_type")?.as_str()?;
        if qr_type == tag {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Updated,
    Success(Value),
    Failure(String),
    TransportError(String),
}

impl SubmissionOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::TransportError(_))
    }
}

/// Classify the result of a `process_incoming_qr` call. First match wins.
pub fn classify_response(body: &Value) -> SubmissionOutcome {
    if body.get("result").and_then(Value::as_str) == Some("updated") {
        return SubmissionOutcome::Updated;
    }
    if body.get("success").and_then(Value::as_bool) == Some(true) {
        let details = body.get("results").cloned().unwrap_or_else(|| body.clone());
        return SubmissionOutcome::Success(details);
    }
    let message = ["error", "details"]
        .iter()
        .find_map(|key| body.get(*key).and_then(message_text));
    SubmissionOutcome::Failure(message.unwrap_or_else(|| UNKNOWN_RESPONSE.to_string()))
}

fn message_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<RpcErrorData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RpcErrorData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub debug: Option<String>,
}

/// Pick the operator-facing message for a failed call: the server's
/// structured message, then the first line of its debug text, then the
/// exception text.
pub fn transport_message(error: Option<&RpcError>, exception: Option<&str>) -> String {
    let data = error.and_then(|e| e.data.as_ref());
    let candidates = [
        data.and_then(|d| d.message.as_deref()),
        data.and_then(|d| d.debug.as_deref())
            .and_then(|d| d.lines().map(str::trim).find(|l| !l.is_empty())),
        error.and_then(|e| e.message.as_deref()),
        exception,
    ];
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|m| !m.is_empty())
        .unwrap_or(TRANSPORT_FAILED)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMove {
    pub picking_id: i64,
    pub move_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMove {
    /// `None` when the server reports no picking state (Odoo sends `false`).
    pub picking_state: Option<String>,
    pub move_line_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("{0}")]
    Transport(String),
}

/// JSON-RPC client for the warehouse endpoint. Each call is a single attempt
/// with no timeout; cloning shares the connection pool and request ids.
#[derive(Clone)]
pub struct SubmissionClient {
    client: reqwest::Client,
    endpoint: String,
    process_path: String,
    scan_path: String,
    complete_path: String,
    qr_type: String,
    next_id: Arc<AtomicU64>,
}

impl SubmissionClient {
    pub fn new(config: &SubmissionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            process_path: config.process_path.clone(),
            scan_path: config.scan_path.clone(),
            complete_path: config.complete_path.clone(),
            qr_type: config.qr_type.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Discriminator a decoded payload must carry to be submitted.
    pub fn qr_type(&self) -> &str {
        &self.qr_type
    }

    pub async fn submit(&self, payload: &SubmissionPayload) -> SubmissionOutcome {
        let params = json!({ "payload": payload.as_value() });
        match self.call(&self.process_path, params).await {
            Ok(body) => {
                let outcome = classify_response(&body);
                info!(outcome = ?outcome, "payload processed");
                outcome
            }
            Err(message) => SubmissionOutcome::TransportError(message),
        }
    }

    /// Create a picking and move for a scanned product.
    pub async fn create_move(
        &self,
        product_barcode: &str,
        quantity: f64,
        lot: Option<&str>,
    ) -> Result<CreatedMove, RecordError> {
        let params = json!({
            "product_barcode": product_barcode,
            "quantity": quantity,
            "lot": lot,
        });
        let body = self
            .call(&self.scan_path, params)
            .await
            .map_err(RecordError::Transport)?;
        rejection(&body)?;

        let picking_id = body.get("picking_id").and_then(Value::as_i64);
        let move_id = body.get("move_id").and_then(Value::as_i64);
        match (picking_id, move_id) {
            (Some(picking_id), Some(move_id)) => {
                info!(picking_id, move_id, product_barcode, "move created");
                Ok(CreatedMove {
                    picking_id,
                    move_id,
                })
            }
            _ => Err(RecordError::Rejected(UNKNOWN_RESPONSE.to_string())),
        }
    }

    /// Record the done quantity on a move and try to validate it.
    pub async fn complete_move(
        &self,
        move_id: i64,
        qty_done: f64,
        lot_name: Option<&str>,
    ) -> Result<CompletedMove, RecordError> {
        let params = json!({
            "move_id": move_id,
            "qty_done": qty_done,
            "lot_name": lot_name,
        });
        let body = self
            .call(&self.complete_path, params)
            .await
            .map_err(RecordError::Transport)?;
        rejection(&body)?;

        // Only `error` marks a failure; the rest of the body is informational.
        let picking_state = body
            .get("picking_state")
            .and_then(Value::as_str)
            .map(str::to_string);
        let move_line_id = body.get("move_line_id").and_then(Value::as_i64);
        info!(move_id, ?picking_state, "move completed");
        Ok(CompletedMove {
            picking_state,
            move_line_id,
        })
    }

    /// One JSON-RPC round trip. Errors are already turned into the
    /// operator-facing message.
    async fn call(&self, path: &str, params: Value) -> Result<Value, String> {
        let url = format!("{}{}", self.endpoint, path);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": params,
            "id": id,
        });
        debug!(url, id, "sending request");

        let resp = self.client.post(&url).json(&request).send().await.map_err(|e| {
            warn!(url, error = %e, "request failed");
            transport_message(None, Some(&e.to_string()))
        })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| {
            warn!(url, error = %e, "failed to read response");
            transport_message(None, Some(&e.to_string()))
        })?;

        let parsed: RpcResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                warn!(url, status = status.as_u16(), "endpoint returned error status");
                return Err(format!("endpoint returned HTTP {}", status.as_u16()));
            }
            Err(e) => {
                warn!(url, error = %e, "malformed response");
                return Err(format!("malformed response: {e}"));
            }
        };

        if let Some(error) = parsed.error {
            warn!(url, code = ?error.code, message = ?error.message, "endpoint returned an error");
            return Err(transport_message(Some(&error), None));
        }
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "endpoint returned error status");
            return Err(format!("endpoint returned HTTP {}", status.as_u16()));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

fn rejection(body: &Value) -> Result<(), RecordError> {
    match body.get("error").and_then(message_text) {
        Some(code) => Err(RecordError::Rejected(code)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;

    fn config(endpoint: String) -> SubmissionConfig {
        SubmissionConfig {
            endpoint,
            process_path: "/mobile_warehouse/api/process_incoming_qr".into(),
            scan_path: "/mobile_warehouse/api/scan".into(),
            complete_path: "/mobile_warehouse/api/complete".into(),
            qr_type: "incomingstaging".into(),
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Fake endpoint answering every call with `{"result": result}` and
    /// remembering the params it saw.
    async fn rpc_endpoint(path: &'static str, result: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        let app = Router::new().route(
            path,
            post(move |Json(req): Json<Value>| {
                let result = result.clone();
                let seen = seen_by_handler.clone();
                async move {
                    seen.lock().unwrap().push(req.clone());
                    Json(json!({ "jsonrpc": "2.0", "id": req["id"], "result": result }))
                }
            }),
        );
        (serve(app).await, seen)
    }

    fn tagged() -> SubmissionPayload {
        SubmissionPayload::from_decoded(
            r#"{"qr_type":"incomingstaging","id":42}"#,
            "incomingstaging",
        )
        .unwrap()
    }

    #[test]
    fn only_tagged_objects_are_payloads() {
        assert!(SubmissionPayload::from_decoded("hello world", "incomingstaging").is_none());
        assert!(SubmissionPayload::from_decoded(r#"{"id":1}"#, "incomingstaging").is_none());
        assert!(SubmissionPayload::from_decoded(r#"{"qr_type":"other"}"#, "incomingstaging").is_none());
        assert!(SubmissionPayload::from_decoded(r#"["incomingstaging"]"#, "incomingstaging").is_none());
        assert_eq!(tagged().as_value()["id"], 42);
    }

    #[test]
    fn classification_order() {
        assert_eq!(
            classify_response(&json!({"result": "updated", "success": true})),
            SubmissionOutcome::Updated
        );
        assert_eq!(
            classify_response(&json!({"success": true, "results": {"a": 1}})),
            SubmissionOutcome::Success(json!({"a": 1}))
        );
        assert_eq!(
            classify_response(&json!({"success": true, "id": 3})),
            SubmissionOutcome::Success(json!({"success": true, "id": 3}))
        );
        assert_eq!(
            classify_response(&json!({"error": "bad lot"})),
            SubmissionOutcome::Failure("bad lot".into())
        );
        assert_eq!(
            classify_response(&json!({"details": "no staging record"})),
            SubmissionOutcome::Failure("no staging record".into())
        );
        assert_eq!(
            classify_response(&json!({"success": false})),
            SubmissionOutcome::Failure(UNKNOWN_RESPONSE.into())
        );
        assert_eq!(
            classify_response(&Value::Null),
            SubmissionOutcome::Failure(UNKNOWN_RESPONSE.into())
        );
    }

    #[test]
    fn transport_message_priority() {
        let full = RpcError {
            code: Some(200),
            message: Some("Odoo Server Error".into()),
            data: Some(RpcErrorData {
                message: Some("Access Denied".into()),
                debug: Some("Traceback (most recent call last):\n  File".into()),
            }),
        };
        assert_eq!(transport_message(Some(&full), None), "Access Denied");

        let debug_only = RpcError {
            message: Some("Odoo Server Error".into()),
            data: Some(RpcErrorData {
                message: None,
                debug: Some("\nTraceback (most recent call last):\n  File".into()),
            }),
            ..Default::default()
        };
        assert_eq!(
            transport_message(Some(&debug_only), None),
            "Traceback (most recent call last):"
        );

        assert_eq!(transport_message(None, Some("connection refused")), "connection refused");
        assert_eq!(transport_message(None, None), TRANSPORT_FAILED);
        assert_eq!(transport_message(Some(&RpcError::default()), Some("  ")), TRANSPORT_FAILED);
    }

    #[tokio::test]
    async fn submit_sends_jsonrpc_envelope() {
        let (base, seen) =
            rpc_endpoint("/mobile_warehouse/api/process_incoming_qr", json!({"result": "updated"})).await;
        let client = SubmissionClient::new(&config(base));

        assert_eq!(client.submit(&tagged()).await, SubmissionOutcome::Updated);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["jsonrpc"], "2.0");
        assert_eq!(seen[0]["method"], "call");
        assert_eq!(seen[0]["params"]["payload"]["id"], 42);
    }

    #[tokio::test]
    async fn rpc_error_becomes_transport_error() {
        let app = Router::new().route(
            "/mobile_warehouse/api/process_incoming_qr",
            post(|| async {
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": 200, "message": "Odoo Server Error",
                              "data": {"message": "You are not allowed to do this"}}
                }))
            }),
        );
        let client = SubmissionClient::new(&config(serve(app).await));
        assert_eq!(
            client.submit(&tagged()).await,
            SubmissionOutcome::TransportError("You are not allowed to do this".into())
        );
    }

    #[tokio::test]
    async fn http_error_without_rpc_body() {
        let app = Router::new().route(
            "/mobile_warehouse/api/process_incoming_qr",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let client = SubmissionClient::new(&config(serve(app).await));
        assert_eq!(
            client.submit(&tagged()).await,
            SubmissionOutcome::TransportError("endpoint returned HTTP 502".into())
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_carries_exception_text() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = SubmissionClient::new(&config(format!("http://{addr}")));
        match client.submit(&tagged()).await {
            SubmissionOutcome::TransportError(msg) => {
                assert!(!msg.is_empty());
                assert_ne!(msg, TRANSPORT_FAILED);
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_move_roundtrip() {
        let (base, seen) = rpc_endpoint(
            "/mobile_warehouse/api/scan",
            json!({"success": true, "picking_id": 7, "move_id": 11}),
        )
        .await;
        let client = SubmissionClient::new(&config(base));

        let created = client.create_move("5901234123457", 3.0, Some("LOT-1")).await.unwrap();
        assert_eq!(created, CreatedMove { picking_id: 7, move_id: 11 });
        let seen = seen.lock().unwrap();
        let params = &seen[0]["params"];
        assert_eq!(params["product_barcode"], "5901234123457");
        assert_eq!(params["quantity"], 3.0);
        assert_eq!(params["lot"], "LOT-1");
    }

    #[tokio::test]
    async fn create_move_rejected() {
        let (base, _) = rpc_endpoint(
            "/mobile_warehouse/api/scan",
            json!({"error": "product_not_found", "barcode": "x"}),
        )
        .await;
        let client = SubmissionClient::new(&config(base));
        assert_eq!(
            client.create_move("x", 1.0, None).await.unwrap_err(),
            RecordError::Rejected("product_not_found".into())
        );
    }

    #[tokio::test]
    async fn complete_move_roundtrip() {
        let (base, seen) = rpc_endpoint(
            "/mobile_warehouse/api/complete",
            json!({"success": true, "move_line_id": 5, "picking_state": "done"}),
        )
        .await;
        let client = SubmissionClient::new(&config(format!("{base}/")));

        let done = client.complete_move(11, 2.5, None).await.unwrap();
        assert_eq!(done.picking_state.as_deref(), Some("done"));
        assert_eq!(done.move_line_id, Some(5));
        let seen = seen.lock().unwrap();
        let params = &seen[0]["params"];
        assert_eq!(params["move_id"], 11);
        assert!(params["lot_name"].is_null());
    }

    #[tokio::test]
    async fn complete_move_without_picking_state_succeeds() {
        let (base, _) = rpc_endpoint(
            "/mobile_warehouse/api/complete",
            json!({"success": true, "move_line_id": 5, "picking_state": false}),
        )
        .await;
        let client = SubmissionClient::new(&config(base));

        let done = client.complete_move(11, 1.0, None).await.unwrap();
        assert_eq!(done.picking_state, None);
        assert_eq!(done.move_line_id, Some(5));
    }

    #[tokio::test]
    async fn complete_move_rejected() {
        let (base, _) = rpc_endpoint(
            "/mobile_warehouse/api/complete",
            json!({"error": "move_not_found"}),
        )
        .await;
        let client = SubmissionClient::new(&config(base));
        assert_eq!(
            client.complete_move(11, 1.0, None).await.unwrap_err(),
            RecordError::Rejected("move_not_found".into())
        );
    }
}
