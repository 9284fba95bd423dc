//! Functions to assist in enabling tracing for an HTTP server.

use std::collections::BTreeMap;
use std::error::Error;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{HeaderMap, Request, Response, StatusCode};
use hyper::body::HttpBody;
use opentelemetry::trace::FutureExt;
use tower::{Layer, Service};
use tower_http::classify::{
    ClassifiedResponse, ClassifyResponse, ServerErrorsAsFailures, ServerErrorsFailureClass,
};

use crate::lifecycle::{
    Outcome, Payload, RequestHead, ResponseContext, ResponseStatus, ServerBinding,
};
use crate::trace::Instrumentation;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// A Tower layer that enables tracing and produces a root span for each
/// request.
///
/// If trace parent headers are specified in the incoming request, they will be
/// adopted and used as the span parent. The inner service finds the request's
/// [`RequestTrace`](crate::RequestTrace) in the request extensions.
pub fn layer(instrumentation: Instrumentation) -> TracingLayer {
    TracingLayer { instrumentation }
}

#[derive(Clone, Debug)]
pub struct TracingLayer {
    instrumentation: Instrumentation,
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            instrumentation: self.instrumentation.clone(),
        }
    }
}

/// The connection a request arrived on.
///
/// Servers that insert this into request extensions get `server.*` and
/// `client.address` attributes recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl ServerBinding for ConnectionInfo {
    fn port(&self) -> Option<u16> {
        Some(self.local.port())
    }

    fn hostname(&self) -> String {
        self.local.ip().to_string()
    }

    fn request_ip(&self, _head: &RequestHead) -> Option<IpAddr> {
        Some(self.peer.ip())
    }
}

/// A response the server classified as a failure.
#[derive(Debug, derive_more::Display)]
#[display(fmt = "{}", _0)]
pub struct ServerError(ServerErrorsFailureClass);

impl Error for ServerError {}

#[derive(Clone, Debug)]
pub struct TracingService<S> {
    inner: S,
    instrumentation: Instrumentation,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TracingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Error + Send + 'static,
    ReqBody: 'static,
    ResBody: HttpBody + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map_or_else(|| self.instrumentation.next_request_id(), str::to_owned);
        let head = RequestHead::from_request(&request, id);
        let connection = request.extensions().get::<ConnectionInfo>().copied();
        let cookies = parse_cookies(request.headers());

        let trace = self.instrumentation.start_request(head);
        request.extensions_mut().insert(trace.clone());
        let root = trace.root_context();

        let handle = trace.on_handle();
        // The handler sees its own span as the active one, not the root.
        let ambient = handle
            .as_ref()
            .map_or_else(|| root.clone(), |handle| handle.context().clone());
        let future = {
            let _guard = ambient.clone().attach();
            self.inner.call(request)
        }
        .with_context(ambient);

        Box::pin(
            async move {
                let result = future.await;

                let failure = result.as_ref().ok().and_then(classify);
                if let Some(handle) = handle {
                    match (&result, &failure) {
                        (Err(error), _) => handle.stop(Outcome::from(error)),
                        (Ok(_), Some(failure)) => handle.stop(Outcome::from(failure)),
                        (Ok(_), None) => handle.stop(Outcome::Success),
                    }
                }

                let mut response_cx = ResponseContext {
                    cookies,
                    server: connection.map(|c| Arc::new(c) as Arc<dyn ServerBinding>),
                    ..ResponseContext::default()
                };
                match &result {
                    Ok(response) => {
                        response_cx.status = Some(response.status().into());
                        response_cx.response_headers = response.headers().clone();
                        response_cx.response_body = Some(Payload::Streaming {
                            size: response.body().size_hint().exact(),
                        });
                    }
                    Err(_) => {
                        response_cx.status = Some(ResponseStatus::from(StatusCode::INTERNAL_SERVER_ERROR));
                    }
                }
                if let Some(after_response) = trace.on_after_response(0, &response_cx) {
                    after_response.stop();
                }

                result
            }
            .with_context(root),
        )
    }
}

fn classify<B>(response: &Response<B>) -> Option<ServerError> {
    match ServerErrorsAsFailures::new().classify_response(response) {
        ClassifiedResponse::Ready(Err(class)) => Some(ServerError(class)),
        _ => None,
    }
}

/// Parses the `Cookie` header into name/value pairs. `None` if the request
/// sent no cookies at all.
fn parse_cookies(headers: &HeaderMap) -> Option<BTreeMap<String, serde_json::Value>> {
    let mut values = headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .peekable();
    values.peek()?;

    let cookies = values
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(name, value)| (name.to_owned(), serde_json::Value::from(value)))
        .collect();
    Some(cookies)
}
