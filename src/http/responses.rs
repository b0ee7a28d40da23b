use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Response, StatusCode};
use serde::Serialize;

use crate::engine::EngineError;

pub fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(data).unwrap_or_else(|_| b"{}".to_vec());
    raw_json_response(status, Bytes::from(json))
}

/// Responds with bytes that are already JSON, such as a stored lock record.
pub fn raw_json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(body))
        .unwrap()
}

pub fn bytes_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Full::new(body))
        .unwrap()
}

pub fn text_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(message.as_bytes())))
        .unwrap()
}

pub fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub fn not_found() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "404 Not Found")
}

/// Return 401 response, with a challenge when the policy has one
pub fn unauthorized(challenge: Option<&'static str>) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if let Some(challenge) = challenge {
        builder = builder.header(header::WWW_AUTHENTICATE, challenge);
    }
    builder
        .body(Full::new(Bytes::from_static(b"Unauthorized")))
        .unwrap()
}

/// Status code for each engine failure.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        EngineError::Locked(_) => StatusCode::LOCKED,
        EngineError::NotLocked | EngineError::LockMismatch(_) => StatusCode::CONFLICT,
        EngineError::MalformedLock(_) => StatusCode::BAD_REQUEST,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: EngineError, challenge: Option<&'static str>) -> Response<Full<Bytes>> {
    let status = status_for(&err);
    match err {
        EngineError::Unauthorized(_) => unauthorized(challenge),
        EngineError::Locked(existing) | EngineError::LockMismatch(existing) => {
            raw_json_response(status, existing)
        }
        EngineError::NotLocked => {
            text_response(status, "attempting to unlock but resource not locked")
        }
        EngineError::MalformedLock(_) => text_response(status, "malformed lock record"),
        // already logged by the engine
        EngineError::Storage(_) => empty_response(status),
    }
}
