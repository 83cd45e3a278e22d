//! Generic request/response boundary to the file-backed service.
//!
//! The client only interprets `ok`, `status`, `payload.success`,
//! `payload.error` and `payload.code`; anything that can answer with that
//! shape (HTTP, an in-memory mock, files on disk) can stand behind
//! [`ServiceAdapter`].

use crate::errors::{classify, ClassifiedError, ErrorCode};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type ServiceFuture = BoxFuture<'static, Result<ServiceReply, TransportError>>;

pub trait ServiceAdapter: Send + Sync {
    fn request(&self, path: &str, request: ServiceRequest) -> ServiceFuture;
}

impl<T: ServiceAdapter + ?Sized> ServiceAdapter for Arc<T> {
    fn request(&self, path: &str, request: ServiceRequest) -> ServiceFuture {
        (**self).request(path, request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub method: RequestMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ServiceRequest {
    pub fn get() -> Self {
        Self {
            method: RequestMethod::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post() -> Self {
        Self {
            method: RequestMethod::Post,
            ..Self::get()
        }
    }

    pub fn post_json(body: &Value) -> Self {
        Self {
            method: RequestMethod::Post,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMeta {
    pub ok: bool,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReply {
    pub response: ResponseMeta,
    pub payload: Value,
}

impl ServiceReply {
    pub fn ok(payload: Value) -> Self {
        Self {
            response: ResponseMeta {
                ok: true,
                status: 200,
            },
            payload,
        }
    }

    pub fn failed(status: u16, payload: Value) -> Self {
        Self {
            response: ResponseMeta { ok: false, status },
            payload,
        }
    }

    /// Normalises the reply. A `success: false` payload counts as a failure
    /// even when the response itself was ok.
    pub fn into_result(self, fallback_message: &str) -> Result<Value, ServiceError> {
        let payload = if self.payload.is_null() {
            Value::Object(Default::default())
        } else {
            self.payload
        };
        let success_flag = payload.get("success").and_then(Value::as_bool);
        let ok = self.response.ok && success_flag != Some(false);
        if ok {
            return Ok(payload);
        }

        let message = payload_error_message(&payload)
            .unwrap_or_else(|| {
                if fallback_message.trim().is_empty() {
                    "Request failed".to_string()
                } else {
                    fallback_message.to_string()
                }
            });
        let code = payload
            .get("code")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| ErrorCode::ServerError.as_str().to_string());
        let status = if self.response.status == 0 {
            500
        } else {
            self.response.status
        };
        Err(ServiceError {
            code,
            message,
            status,
            data: payload,
        })
    }
}

fn payload_error_message(payload: &Value) -> Option<String> {
    match payload.get("error") {
        Some(Value::String(message)) if !message.trim().is_empty() => Some(message.clone()),
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .filter(|message| !message.trim().is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Failure below the service contract: the request never produced a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
}

/// A normalised failed reply.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({code}, status {status})")]
pub struct ServiceError {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub data: Value,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>, status: u16) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            status,
            data: Value::Null,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message, 400)
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code == code.as_str()
    }

    pub fn classified(&self) -> ClassifiedError {
        classify(&self.message, Some(&self.code), None)
    }
}

impl From<TransportError> for ServiceError {
    fn from(err: TransportError) -> Self {
        Self {
            code: ErrorCode::NetworkError.as_str().to_string(),
            message: err.to_string(),
            status: 0,
            data: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_false_payload_is_a_failure() {
        let reply = ServiceReply::ok(json!({"success": false, "error": "lint failed", "code": "PROMPT_MISSING"}));
        let err = reply.into_result("fallback").expect_err("must fail");
        assert_eq!(err.code, "PROMPT_MISSING");
        assert_eq!(err.message, "lint failed");
        assert_eq!(err.status, 200);
    }

    #[test]
    fn failed_reply_without_details_uses_fallbacks() {
        let err = ServiceReply::failed(0, Value::Null)
            .into_result("Failed to load generation jobs")
            .expect_err("must fail");
        assert_eq!(err.code, "SERVER_ERROR");
        assert_eq!(err.message, "Failed to load generation jobs");
        assert_eq!(err.status, 500);
    }

    #[test]
    fn error_object_message_is_used() {
        let err = ServiceReply::failed(409, json!({"error": {"message": "busy"}, "code": "LOCK_CONFLICT"}))
            .into_result("x")
            .expect_err("must fail");
        assert!(err.is_code(ErrorCode::LockConflict));
        assert_eq!(err.message, "busy");
    }

    #[test]
    fn ok_reply_returns_payload() {
        let data = ServiceReply::ok(json!({"jobs": []}))
            .into_result("x")
            .expect("ok");
        assert_eq!(data, json!({"jobs": []}));
    }

    #[test]
    fn transport_errors_become_network_errors() {
        let err = ServiceError::from(TransportError::Connection("refused".to_string()));
        assert!(err.is_code(ErrorCode::NetworkError));
        assert_eq!(err.classified().code, "NETWORK_ERROR");
    }
}
