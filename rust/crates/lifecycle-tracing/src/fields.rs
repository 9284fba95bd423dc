//! Attribute keys recorded on request spans.
//!
//! Keys defined by [OpenTelemetry's semantic convention](https://opentelemetry.io/docs/specs/semconv/)
//! are re-exported from `opentelemetry-semantic-conventions`; the rest are
//! declared here.

pub use opentelemetry_semantic_conventions::trace::{
    CLIENT_ADDRESS, HTTP_REQUEST_BODY_SIZE, HTTP_REQUEST_METHOD, HTTP_RESPONSE_BODY_SIZE,
    HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE, SERVER_ADDRESS, SERVER_PORT, URL_FULL, URL_PATH,
    URL_QUERY, URL_SCHEME, USER_AGENT_ORIGINAL,
};

/// The server-assigned identifier of the request.
pub const HTTP_REQUEST_ID: &str = "http.request.id";

pub const HTTP_RESPONSE_BODY: &str = "http.response.body";

pub const HTTP_REQUEST_BODY: &str = "http.request.body";

pub const HTTP_REQUEST_CONTENT_LENGTH: &str = "http.request_content_length";

/// Every cookie the request sent, as one JSON object.
pub const HTTP_REQUEST_COOKIE: &str = "http.request.cookie";

pub const ERROR_TYPE: &str = "error.type";

/// The error's source chain, standing in for a stack trace.
pub const ERROR_STACK: &str = "error.stack";

/// The key for a request header, e.g. `http.request.header.content-type`.
pub fn http_request_header(name: &str) -> String {
    format!("http.request.header.{}", name.to_ascii_lowercase())
}

/// The key for a response header, e.g. `http.response.header.content-type`.
pub fn http_response_header(name: &str) -> String {
    format!("http.response.header.{}", name.to_ascii_lowercase())
}
