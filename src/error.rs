//! Error handling and error responses for the gateway

use crate::body::BodyError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the gateway error code on responses the gateway generated itself
pub const X_GATEWAY_ERROR: &str = "X-Gateway-Error";

/// Body of the Basic challenge response
const CHALLENGE_BODY: &str = "Authentication required\nPlease provide valid credentials";

/// Response body type produced by the gateway
pub type GatewayBody = BoxBody<Bytes, BodyError>;

/// Error codes for gateway-generated responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Missing, malformed or wrong credentials
    Unauthorized,
    /// Backend refused or dropped the connection
    UpstreamUnavailable,
    /// Backend did not answer in time, or a body stopped moving
    UpstreamTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::Unauthorized => "UNAUTHORIZED",
            GatewayErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            GatewayErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap a static or owned payload into the gateway body type
pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Build the `WWW-Authenticate` value for a realm
pub fn challenge_header(realm: &str) -> String {
    format!("Basic realm=\"{}\"", realm.replace('"', "'"))
}

/// Create the 401 Basic challenge response
pub fn unauthorized_response(realm: &str) -> Response<GatewayBody> {
    let code = GatewayErrorCode::Unauthorized;
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::WWW_AUTHENTICATE, challenge_header(realm))
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(full_body(CHALLENGE_BODY))
        .unwrap_or_else(|_| json_error_response(GatewayErrorCode::InternalError, "Invalid challenge realm"))
}
