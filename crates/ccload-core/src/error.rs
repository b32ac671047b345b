use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::StatusCode;

/// An error that terminates request handling before (or instead of)
/// forwarding to an upstream — body-too-large, unroutable path, auth
/// failure at the boundary.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ProxyError {
    pub fn new(status: StatusCode, message: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn payload_too_large(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn service_unavailable(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut resp = Response::new(Body::from(self.body));
        *resp.status_mut() = self.status;
        resp
    }
}

#[derive(Debug)]
pub struct AuthError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl AuthError {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut resp = Response::new(Body::from(self.body));
        *resp.status_mut() = self.status;
        resp
    }
}
