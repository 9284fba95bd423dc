//! Contexts whose active span is chosen explicitly.
//!
//! Lifecycle phases don't run inside the execution scope that would
//! naturally inherit the right parent, so every span is started against a
//! [`Context`] built here rather than [`Context::current`].

use std::borrow::Cow;

use opentelemetry::trace::{SpanContext, SpanKind, TraceContextExt, Tracer};
use opentelemetry::Context;

/// Starts spans under an explicit parent context.
///
/// This is an object-safe view over any [`Tracer`], so a single tracer can
/// be shared by every request without the engine being generic over it.
pub trait SpanFactory: Send + Sync {
    /// Starts a span named `name` as a child of the span active in
    /// `parent`, returning `parent` with the new span made active.
    fn start_child(&self, name: Cow<'static, str>, kind: SpanKind, parent: &Context) -> Context;
}

impl<T> SpanFactory for T
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn start_child(&self, name: Cow<'static, str>, kind: SpanKind, parent: &Context) -> Context {
        let span = self
            .span_builder(name)
            .with_kind(kind)
            .start_with_context(self, parent);
        parent.with_span(span)
    }
}

/// The identity of the span active in `cx`.
pub fn span_context_of(cx: &Context) -> SpanContext {
    cx.span().span_context().clone()
}

/// Ends the span active in `cx` unless it has already ended.
pub(crate) fn end_if_recording(cx: &Context) {
    let span = cx.span();
    if span.is_recording() {
        span.end();
    }
}
