//! JSON-lines protocol spoken by `vf serve`.
//!
//! One request object per stdin line, one response object per stdout line:
//!
//! ```json
//! {"id": "1", "method": "start_session", "params": {"handle": "tab-1", "cwd": "/work/app"}}
//! {"ok": true, "id": "1", "data": {"outcome": "started", ...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vibeflow_core::FlowError;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Optional; when present it must match [`PROTOCOL_VERSION`].
    #[serde(default)]
    pub protocol_version: Option<u32>,
    pub method: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&FlowError> for ErrorInfo {
    fn from(err: &FlowError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }

    /// Serializes `data`, turning a serialization failure into an error response.
    pub fn from_data<T: Serialize>(id: Option<String>, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize response: {}", err),
            ),
        }
    }

    pub fn from_result<T: Serialize>(id: Option<String>, result: Result<T, FlowError>) -> Self {
        match result {
            Ok(data) => Response::from_data(id, &data),
            Err(err) => Response::error_with_info(id, ErrorInfo::from(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_optional_fields() {
        let request: Request = serde_json::from_str(r#"{"method": "get_health"}"#).unwrap();
        assert_eq!(request.method, "get_health");
        assert!(request.id.is_none());
        assert!(request.params.is_none());
        assert!(request.protocol_version.is_none());
    }

    #[test]
    fn error_response_omits_data() {
        let response = Response::error(Some("7".into()), "not_found", "missing");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["id"], "7");
        assert_eq!(json["error"]["code"], "not_found");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn flow_errors_keep_their_codes() {
        let err = FlowError::NoActiveSession {
            handle: "tab-1".into(),
        };
        let response = Response::from_result::<()>(None, Err(err));
        let info = response.error.unwrap();
        assert_eq!(info.code, "no_active_session");
        assert!(info.message.contains("tab-1"));
    }
}
