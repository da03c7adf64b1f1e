//! Wire protocol shared by the Remote Channel (client side) and the
//! Dispatcher (server side): newline-delimited UTF-8 JSON, one object per
//! line in each direction.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request frame: `{"action": str, "arguments": object}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub action: String,
    #[serde(default)]
    pub arguments: Value,
}

impl WireRequest {
    pub fn new(action: impl Into<String>, arguments: Value) -> Self {
        WireRequest {
            action: action.into(),
            arguments,
        }
    }

    /// The sentinel action that instructs the worker to exit without
    /// sending a response.
    pub const CLOSE: &'static str = "close";

    pub fn is_close(&self) -> bool {
        self.action == Self::CLOSE
    }
}

/// A response frame. Either a successful JSON value (a blank/`Null` line on
/// void operations) or a tagged error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireResponse {
    Ok(Value),
    Err {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
}

impl WireResponse {
    pub fn ok(value: Value) -> Self {
        WireResponse::Ok(value)
    }

    pub fn void() -> Self {
        WireResponse::Ok(Value::Null)
    }

    pub fn from_error(err: &crate::error::McVirtError) -> Self {
        let wire: WireError = err.into();
        WireResponse::Err {
            kind: wire.kind,
            message: wire.message,
            detail: wire.detail,
        }
    }

    pub fn into_result(self) -> crate::error::Result<Value> {
        match self {
            WireResponse::Ok(v) => Ok(v),
            WireResponse::Err { kind, message, detail } => {
                Err(WireError { kind, message, detail }.into())
            }
        }
    }
}

/// `checkStatus`'s success sentinel: `["0"]` means "ready, unlocked".
pub fn check_status_ready() -> Value {
    serde_json::json!(["0"])
}

pub fn is_check_status_ready(value: &Value) -> bool {
    value.as_array().map(|a| a.as_slice()) == Some([Value::String("0".to_string())].as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json_line() {
        let req = WireRequest::new("ping", serde_json::json!({}));
        let line = serde_json::to_string(&req).unwrap();
        let decoded: WireRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.action, "ping");
    }

    #[test]
    fn close_sentinel_detected() {
        let req = WireRequest::new("close", Value::Null);
        assert!(req.is_close());
    }

    #[test]
    fn check_status_sentinel_matches() {
        assert!(is_check_status_ready(&check_status_ready()));
        assert!(!is_check_status_ready(&serde_json::json!(["1"])));
    }

    #[test]
    fn error_response_round_trips_to_mcvirt_error() {
        let resp = WireResponse::Err {
            kind: "VMExists".to_string(),
            message: "web".to_string(),
        };
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, crate::error::McVirtError::VMExists(_)));
    }
}
