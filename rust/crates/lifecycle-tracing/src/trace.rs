//! The entry point: one root span per request, and the request-scoped state
//! every phase hook works against.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use http::HeaderMap;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{FutureExt, SpanContext, SpanKind, Status, TraceContextExt};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_http::HeaderExtractor;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::attributes::{request_identity, AttributeMap};
use crate::context::{span_context_of, SpanFactory};
use crate::fields::HTTP_ROUTE;
use crate::lifecycle::{Outcome, RequestHead};
use crate::stack::SpanStack;

/// What a root span is called until it is renamed after its route.
const ROOT_SPAN_NAME: &str = "request";

/// Opens a root span for every request and hands out the [`RequestTrace`]
/// the framework's lifecycle hooks report to.
///
/// The tracer is fixed at construction and shared by every request; all
/// mutable tracking state lives in the per-request [`RequestTrace`].
#[derive(Clone)]
pub struct Instrumentation {
    tracer: Arc<dyn SpanFactory>,
    propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
    next_request_id: Arc<AtomicU64>,
}

impl Instrumentation {
    /// Uses the tracer of the globally installed provider.
    pub fn global(tracer_name: impl Into<Cow<'static, str>>) -> Self {
        Self::with_tracer(global::tracer(tracer_name))
    }

    pub fn with_tracer<T>(tracer: T) -> Self
    where
        T: opentelemetry::trace::Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        Self {
            tracer: Arc::new(tracer),
            propagator: None,
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Extracts inbound trace parents with `propagator` instead of the
    /// global one.
    #[must_use]
    pub fn with_propagator(
        mut self,
        propagator: impl TextMapPropagator + Send + Sync + 'static,
    ) -> Self {
        self.propagator = Some(Arc::new(propagator));
        self
    }

    /// A fresh server-side request identifier.
    pub fn next_request_id(&self) -> String {
        self.next_request_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }

    /// Opens the root span for a request.
    ///
    /// If the request headers carry a valid trace parent, the root span
    /// adopts it.
    pub fn start_request(&self, head: RequestHead) -> RequestTrace {
        let parent = self.extract(&head.headers);
        let root = self
            .tracer
            .start_child(ROOT_SPAN_NAME.into(), SpanKind::Server, &parent);
        tracing::debug!(
            request.id = %head.id,
            method = %head.method,
            path = %head.path,
            "request trace started",
        );

        let attributes = request_identity(&head);
        RequestTrace {
            tracer: Arc::clone(&self.tracer),
            propagator: self.propagator.clone(),
            state: Arc::new(Mutex::new(RequestState {
                stack: SpanStack::new(root),
                head,
                attributes,
                route: None,
                root_status: RootStatus::Unset,
                closed: false,
            })),
        }
    }

    /// Runs `dispatch` for a request with its root span as the active
    /// OpenTelemetry context.
    pub async fn wrap<F, Fut>(&self, head: RequestHead, dispatch: F) -> Fut::Output
    where
        F: FnOnce(RequestTrace) -> Fut,
        Fut: Future,
    {
        let trace = self.start_request(head);
        let cx = trace.root_context();
        dispatch(trace).with_context(cx).await
    }

    fn extract(&self, headers: &HeaderMap) -> Context {
        let extractor = HeaderExtractor(headers);
        let parent = match &self.propagator {
            Some(propagator) => propagator.extract(&extractor),
            None => global::get_text_map_propagator(|propagator| propagator.extract(&extractor)),
        };

        // Without a trace parent the extracted span context is invalid, and
        // must not be adopted.
        if parent.span().span_context().is_valid() {
            parent
        } else {
            Context::new()
        }
    }
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation")
            .field("custom_propagator", &self.propagator.is_some())
            .finish_non_exhaustive()
    }
}

/// The trace of a single request.
///
/// Clones share the same state. Lifecycle hooks ([`RequestTrace::inspect`],
/// [`RequestTrace::on_handle`], [`RequestTrace::on_after_response`]) nest
/// their spans through it, and request handlers can use it to start their
/// own spans under whichever span is currently the parent.
#[derive(Clone)]
pub struct RequestTrace {
    tracer: Arc<dyn SpanFactory>,
    propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
    state: Arc<Mutex<RequestState>>,
}

impl RequestTrace {
    /// The server-assigned request identifier.
    pub fn id(&self) -> String {
        self.lock().head.id.clone()
    }

    /// Whether the root span has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// How many phase, event or handler spans sit between the root and the
    /// current parent.
    pub fn parent_depth(&self) -> usize {
        self.lock().stack.depth()
    }

    /// The identity of the span new spans currently nest under.
    pub fn current_span_context(&self) -> SpanContext {
        span_context_of(&self.current_context())
    }

    /// Records the route pattern the request matched. The root span is
    /// named after it once the request completes.
    pub fn set_route(&self, route: impl Into<String>) {
        self.lock().route = Some(route.into());
    }

    /// Sets attributes on the current parent span.
    ///
    /// Returns `false` if that span is no longer recording.
    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = KeyValue>) -> bool {
        let cx = self.current_context();
        let span = cx.span();
        if !span.is_recording() {
            return false;
        }
        for attribute in attributes {
            span.set_attribute(attribute);
        }
        true
    }

    /// Starts a span under the current parent. The caller ends it.
    pub fn start_span(&self, name: impl Into<Cow<'static, str>>) -> Context {
        let parent = self.current_context();
        self.tracer
            .start_child(name.into(), SpanKind::Internal, &parent)
    }

    /// Runs `body` in a new span under the current parent, ending the span
    /// afterwards. An error is recorded on the span and returned as-is.
    pub fn in_span<T, E, F>(&self, name: impl Into<Cow<'static, str>>, body: F) -> Result<T, E>
    where
        F: FnOnce(&Context) -> Result<T, E>,
        E: Error + 'static,
    {
        let cx = self.start_span(name);
        let result = {
            let _guard = cx.clone().attach();
            body(&cx)
        };
        end_manual_span(&cx, Outcome::of(&result));
        result
    }

    /// The asynchronous form of [`RequestTrace::in_span`].
    pub async fn in_span_async<T, E, F, Fut>(
        &self,
        name: impl Into<Cow<'static, str>>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let cx = self.start_span(name);
        let result = body(cx.clone()).with_context(cx.clone()).await;
        end_manual_span(&cx, Outcome::of(&result));
        result
    }

    /// Makes a [`tracing`] span a child of the current parent, so spans
    /// created through `tracing` inside a handler land in the same tree.
    pub fn link_tracing_span(&self, span: &tracing::Span) {
        span.set_parent(self.current_context());
    }

    pub(crate) fn tracer(&self) -> &dyn SpanFactory {
        self.tracer.as_ref()
    }

    pub(crate) fn propagator(&self) -> Option<&(dyn TextMapPropagator + Send + Sync)> {
        self.propagator.as_deref()
    }

    pub(crate) fn root_context(&self) -> Context {
        self.lock().stack.root().clone()
    }

    pub(crate) fn current_context(&self) -> Context {
        self.lock().stack.current().clone()
    }

    /// Locks the request state. Tracing must never take a request down, so
    /// a poisoned lock is recovered rather than propagated.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RequestTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RequestTrace")
            .field("id", &state.head.id)
            .field("depth", &state.stack.depth())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

fn end_manual_span(cx: &Context, outcome: Outcome<'_>) {
    let span = cx.span();
    if !span.is_recording() {
        return;
    }
    if let Outcome::Failure(failure) = outcome {
        span.set_status(Status::error(failure.error().to_string()));
        span.record_error(failure.error());
    }
    span.end();
}

pub(crate) struct RequestState {
    pub(crate) stack: SpanStack,
    pub(crate) head: RequestHead,
    pub(crate) attributes: AttributeMap,
    pub(crate) route: Option<String>,
    root_status: RootStatus,
    closed: bool,
}

/// The root span's status, applied when it closes. Errors are sticky.
enum RootStatus {
    Unset,
    Ok,
    Error(String),
}

impl RequestState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn record_success(&mut self) {
        if matches!(self.root_status, RootStatus::Unset) {
            self.root_status = RootStatus::Ok;
        }
    }

    pub(crate) fn record_failure(&mut self, message: String) {
        self.root_status = RootStatus::Error(message);
    }

    /// Renames, annotates and ends the root span. Only the first call has
    /// any effect.
    pub(crate) fn close_root(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stack.reset();

        if let Some(route) = &self.route {
            self.attributes.insert(HTTP_ROUTE, route.clone());
        }
        let name = format!(
            "{} {}",
            self.head.method,
            self.route.as_deref().unwrap_or(&self.head.path)
        );

        let root = self.stack.root().span();
        root.update_name(name);
        for attribute in self.attributes.drain() {
            root.set_attribute(attribute);
        }
        match &self.root_status {
            RootStatus::Unset => {}
            RootStatus::Ok => root.set_status(Status::Ok),
            RootStatus::Error(message) => root.set_status(Status::error(message.clone())),
        }
        root.end();
        tracing::debug!(request.id = %self.head.id, "request trace closed");
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                request.id = %self.head.id,
                "request dropped before its trace completed",
            );
            self.record_failure("request aborted".to_owned());
            self.close_root();
        }
    }
}
