//! Functions to assist in tracing when making a HTTP request.

use opentelemetry::global;
use opentelemetry_http::HeaderInjector;

use crate::trace::RequestTrace;

/// The headers required to propagate the trace context to another service,
/// parented on the span currently tracked for `trace`.
///
/// Uses the propagator the trace was instrumented with, or the global one.
pub fn trace_headers(trace: &RequestTrace) -> http::HeaderMap {
    let cx = trace.current_context();

    let mut headers_map = http::HeaderMap::new();
    let mut header_injector = HeaderInjector(&mut headers_map);
    match trace.propagator() {
        Some(propagator) => propagator.inject_context(&cx, &mut header_injector),
        None => global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut header_injector);
        }),
    }
    headers_map
}
