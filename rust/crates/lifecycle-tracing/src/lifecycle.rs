//! The vocabulary shared with the web framework: lifecycle phases, the
//! request and response facts it hands over, and event outcomes.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};
use hyper::body::Bytes;

/// A stage of the request-handling lifecycle, in the order the framework
/// runs them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Request,
    Parse,
    Transform,
    BeforeHandle,
    Handle,
    AfterHandle,
    Error,
    MapResponse,
    AfterResponse,
}

impl Phase {
    /// Every phase, in lifecycle order.
    pub const ALL: [Phase; 9] = [
        Phase::Request,
        Phase::Parse,
        Phase::Transform,
        Phase::BeforeHandle,
        Phase::Handle,
        Phase::AfterHandle,
        Phase::Error,
        Phase::MapResponse,
        Phase::AfterResponse,
    ];

    /// The name used for this phase's span.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Parse => "parse",
            Phase::Transform => "transform",
            Phase::BeforeHandle => "beforeHandle",
            Phase::Handle => "handle",
            Phase::AfterHandle => "afterHandle",
            Phase::Error => "error",
            Phase::MapResponse => "mapResponse",
            Phase::AfterResponse => "afterResponse",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is known about a request when it enters the pipeline.
#[derive(Clone, Debug)]
pub struct RequestHead {
    /// The server-assigned request identifier.
    pub id: String,
    pub method: Method,
    /// The full request URL, including scheme and authority when known.
    pub url: String,
    pub path: String,
    /// Byte index of the `?` separating the query in [`RequestHead::url`].
    pub query_index: Option<usize>,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Builds a head from an `http` request.
    ///
    /// Server-side request URIs usually carry only a path and query, so the
    /// authority is taken from the `Host` header when the URI has none.
    pub fn from_request<B>(request: &http::Request<B>, id: impl Into<String>) -> Self {
        let uri = request.uri();
        let path_and_query = uri.path_and_query().map_or("/", |p| p.as_str());
        let authority = uri.authority().map(|a| a.as_str().to_owned()).or_else(|| {
            request
                .headers()
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_owned)
        });
        let url = match authority {
            Some(authority) => {
                let scheme = uri.scheme_str().unwrap_or("http");
                format!("{scheme}://{authority}{path_and_query}")
            }
            None => path_and_query.to_owned(),
        };
        let query_index = url.find('?');

        Self {
            id: id.into(),
            method: request.method().clone(),
            path: uri.path().to_owned(),
            url,
            query_index,
            headers: request.headers().clone(),
        }
    }
}

/// A request or response body, as far as the framework materialised it.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    /// A body that was streamed through without being buffered.
    Streaming { size: Option<u64> },
}

/// The outgoing status as set by the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Code(u16),
    /// A reason phrase, such as `"Not Found"`.
    Named(Cow<'static, str>),
}

impl ResponseStatus {
    /// Resolves the status to a numeric code.
    ///
    /// Names are matched case-insensitively against the canonical reason
    /// phrases; unknown names resolve to 200.
    pub fn code(&self) -> u16 {
        match self {
            ResponseStatus::Code(code) => *code,
            ResponseStatus::Named(name) => (100..=599)
                .filter_map(|code| StatusCode::from_u16(code).ok())
                .find(|status| {
                    status
                        .canonical_reason()
                        .is_some_and(|reason| reason.eq_ignore_ascii_case(name))
                })
                .map_or(200, |status| status.as_u16()),
        }
    }
}

impl From<StatusCode> for ResponseStatus {
    fn from(status: StatusCode) -> Self {
        ResponseStatus::Code(status.as_u16())
    }
}

/// The server the request arrived on.
pub trait ServerBinding: Send + Sync {
    fn port(&self) -> Option<u16>;

    fn hostname(&self) -> String;

    /// Looks up the address of the client that sent `head`.
    fn request_ip(&self, head: &RequestHead) -> Option<IpAddr> {
        let _ = head;
        None
    }
}

impl ServerBinding for SocketAddr {
    fn port(&self) -> Option<u16> {
        Some(SocketAddr::port(self))
    }

    fn hostname(&self) -> String {
        self.ip().to_string()
    }
}

/// What is known about a request once its response has been sent.
#[derive(Clone, Default)]
pub struct ResponseContext {
    /// The route pattern the request matched, e.g. `/users/:id`.
    pub route: Option<String>,
    pub request_body: Option<Payload>,
    pub response_body: Option<Payload>,
    pub status: Option<ResponseStatus>,
    pub response_headers: HeaderMap,
    pub cookies: Option<BTreeMap<String, serde_json::Value>>,
    pub server: Option<Arc<dyn ServerBinding>>,
    /// The client address, when the framework resolved it itself.
    pub client_ip: Option<IpAddr>,
}

impl fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseContext")
            .field("route", &self.route)
            .field("request_body", &self.request_body)
            .field("response_body", &self.response_body)
            .field("status", &self.status)
            .field("response_headers", &self.response_headers)
            .field("cookies", &self.cookies)
            .field("server", &self.server.as_ref().map(|s| s.hostname()))
            .field("client_ip", &self.client_ip)
            .finish()
    }
}

/// How a lifecycle event or handler ended.
#[derive(Clone, Copy, Debug)]
pub enum Outcome<'a> {
    Success,
    Failure(Failure<'a>),
}

impl<'a> Outcome<'a> {
    /// The outcome of `result`, without taking ownership of it.
    pub fn of<T, E>(result: &'a Result<T, E>) -> Self
    where
        E: Error + 'static,
    {
        match result {
            Ok(_) => Outcome::Success,
            Err(error) => Outcome::Failure(Failure::new(error)),
        }
    }
}

impl<'a, E> From<&'a E> for Outcome<'a>
where
    E: Error + 'static,
{
    fn from(error: &'a E) -> Self {
        Outcome::Failure(Failure::new(error))
    }
}

/// An error raised by a lifecycle event or the handler.
#[derive(Clone, Copy)]
pub struct Failure<'a> {
    error: &'a (dyn Error + 'static),
    type_name: &'static str,
}

impl<'a> Failure<'a> {
    pub fn new<E>(error: &'a E) -> Self
    where
        E: Error + 'static,
    {
        Self {
            error,
            type_name: short_type_name(std::any::type_name::<E>()),
        }
    }

    pub fn error(&self) -> &'a (dyn Error + 'static) {
        self.error
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The error's source chain, one cause per line.
    pub fn source_chain(&self) -> String {
        use std::fmt::Write as _;

        let mut chain = self.error.to_string();
        let mut source = self.error.source();
        while let Some(cause) = source {
            let _ = write!(chain, "\n- {cause}");
            source = cause.source();
        }
        chain
    }
}

impl fmt::Debug for Failure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("type_name", &self.type_name)
            .field("error", &self.error.to_string())
            .finish()
    }
}

/// `std::io::error::Error` becomes `Error`; generic arguments are dropped.
fn short_type_name(full: &'static str) -> &'static str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}
