//! Wire message types shared by both stratum dialects.
//!
//! Requests are `{id, method, params}` with a params list; responses are
//! `{id, result, error}` with exactly one of result/error non-null, and
//! errors encoded as the conventional 3-element `[code, message, null]`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Subscription tag echoed in `mining.subscribe` replies.
pub const SESSION_TAG: &str = "xhash_proxy";

/// Generic share rejection.
pub const ERR_REJECTED: i64 = 20;
/// Stale or unknown job, or a submission we cannot reconstruct.
pub const ERR_STALE_JOB: i64 = 21;
/// Submit before authorize.
pub const ERR_UNAUTHORIZED: i64 = 24;
/// EthProxy-side generic failure code.
pub const ERR_GENERIC: i64 = -1;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

pub fn ok(id: Value, result: Value) -> Response {
    Response {
        id,
        result,
        error: Value::Null,
    }
}

pub fn err(id: Value, code: i64, message: &str) -> Response {
    Response {
        id,
        result: Value::Null,
        error: json!([code, message, Value::Null]),
    }
}

/// Server-initiated frame; `id` is always null.
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "id": null, "method": method, "params": params })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_shape() {
        let encoded = serde_json::to_string(&ok(json!(1), json!(true))).unwrap();
        assert_eq!(encoded, r#"{"id":1,"result":true,"error":null}"#);
    }

    #[test]
    fn test_err_shape() {
        let encoded = serde_json::to_string(&err(json!(3), ERR_STALE_JOB, "stale")).unwrap();
        assert_eq!(encoded, r#"{"id":3,"result":null,"error":[21,"stale",null]}"#);
    }

    #[test]
    fn test_notification_shape() {
        let frame = notification("mining.set_difficulty", json!([4.0]));
        assert!(frame["id"].is_null());
        assert_eq!(frame["method"], "mining.set_difficulty");
        assert_eq!(frame["params"], json!([4.0]));
    }

    #[test]
    fn test_request_tolerates_missing_members() {
        let req: Request = serde_json::from_str(r#"{"method":"eth_getWork"}"#).unwrap();
        assert!(req.id.is_null());
        assert_eq!(req.method, "eth_getWork");
        assert!(req.params.is_empty());

        let req: Request = serde_json::from_str(r#"{"id":9}"#).unwrap();
        assert_eq!(req.method, "");
    }

    #[test]
    fn test_request_rejects_non_list_params() {
        assert!(serde_json::from_str::<Request>(r#"{"id":1,"method":"x","params":{}}"#).is_err());
    }
}
