use std::io;

use lifecycle_tracing::fields::*;
use lifecycle_tracing::http_client::trace_headers;
use lifecycle_tracing::{
    Instrumentation, Outcome, Payload, RequestHead, ResponseContext, ResponseStatus,
};
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceContextExt, TracerProvider as _};
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;

struct Harness {
    provider: TracerProvider,
    exporter: InMemorySpanExporter,
    instrumentation: Instrumentation,
}

impl Harness {
    fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let instrumentation = Instrumentation::with_tracer(provider.tracer("lifecycle-tests"))
            .with_propagator(TraceContextPropagator::new());
        Self {
            provider,
            exporter,
            instrumentation,
        }
    }

    fn finished(&self) -> Vec<SpanData> {
        let _ = self.provider.force_flush();
        self.exporter.get_finished_spans().unwrap()
    }
}

fn get(path: &str) -> RequestHead {
    let request = http::Request::get(path)
        .header("Host", "localhost:3000")
        .body(())
        .unwrap();
    RequestHead::from_request(&request, "1")
}

fn named<'a>(spans: &'a [SpanData], name: &str) -> &'a SpanData {
    spans
        .iter()
        .find(|span| span.name == name)
        .unwrap_or_else(|| panic!("no span named {name:?} in {:#?}", names(spans)))
}

fn names(spans: &[SpanData]) -> Vec<&str> {
    spans.iter().map(|span| span.name.as_ref()).collect()
}

fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .find(|attribute| attribute.key.as_str() == key)
        .map(|attribute| &attribute.value)
}

fn string(value: &str) -> Value {
    Value::from(value.to_owned())
}

fn roots(spans: &[SpanData]) -> Vec<&SpanData> {
    spans
        .iter()
        .filter(|span| span.span_kind == SpanKind::Server)
        .collect()
}

#[test]
fn closes_exactly_one_root_span_after_the_final_phase() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/users/42"));

    let parse = trace.on_parse(1).unwrap();
    parse.on_event("json").stop(Outcome::Success);
    parse.stop();
    trace.on_handle().unwrap().stop(Outcome::Success);
    let after_response = trace
        .on_after_response(1, &ResponseContext::default())
        .unwrap();
    after_response.on_event("log").unwrap().stop(Outcome::Success);

    assert!(roots(&harness.finished()).is_empty());
    assert!(!trace.is_closed());

    after_response.stop();

    let spans = harness.finished();
    assert_eq!(roots(&spans).len(), 1);
    assert!(trace.is_closed());
    assert!(trace.on_parse(1).is_none());
    assert!(trace.on_handle().is_none());
    assert!(trace.on_after_response(0, &ResponseContext::default()).is_none());

    drop(trace);
    assert_eq!(roots(&harness.finished()).len(), 1);
}

#[test]
fn phases_without_events_produce_no_spans() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));

    assert!(trace.on_request(0).is_none());
    assert!(trace.on_parse(0).is_none());
    assert!(trace.on_transform(0).is_none());
    trace.on_handle().unwrap().stop(Outcome::Success);
    assert!(trace.on_after_handle(0).is_none());
    assert!(trace.on_map_response(0).is_none());
    trace
        .on_after_response(0, &ResponseContext::default())
        .unwrap()
        .stop();

    assert_eq!(names(&harness.finished()), ["handle", "GET /"]);
}

#[test]
fn events_nest_under_their_phase_and_restore_the_parent() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));
    let root = trace.current_span_context();

    let transform = trace.on_transform(2).unwrap();
    for step in ["trim", "normalise"] {
        let event = transform.on_event(step);
        assert_eq!(trace.parent_depth(), 1);
        assert_eq!(
            trace.current_span_context(),
            event.context().span().span_context().clone()
        );

        let lookup = trace.start_span("lookup");
        lookup.span().end();

        event.stop(Outcome::Success);
        assert_eq!(trace.parent_depth(), 0);
        assert_eq!(trace.current_span_context(), root);
    }
    transform.stop();
    drop(trace);

    let spans = harness.finished();
    let root = named(&spans, "GET /");
    let phase = named(&spans, "transform");
    assert_eq!(phase.parent_span_id, root.span_context.span_id());
    for step in ["trim", "normalise"] {
        let event = named(&spans, step);
        assert_eq!(event.parent_span_id, phase.span_context.span_id());
        assert_eq!(event.status, Status::Ok);
    }
    let event_ids: Vec<SpanId> = ["trim", "normalise"]
        .iter()
        .map(|step| named(&spans, step).span_context.span_id())
        .collect();
    let lookups: Vec<_> = spans.iter().filter(|span| span.name == "lookup").collect();
    assert_eq!(lookups.len(), 2);
    for lookup in lookups {
        assert!(event_ids.contains(&lookup.parent_span_id));
    }
}

#[test]
fn events_may_finish_out_of_order() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));
    let root = trace.current_span_context();

    let before_handle = trace.on_before_handle(2).unwrap();
    let auth = before_handle.on_event("auth");
    let rate_limit = before_handle.on_event("rateLimit");
    let rate_limit_cx = rate_limit.context().span().span_context().clone();

    auth.stop(Outcome::Success);
    assert_eq!(trace.parent_depth(), 1);
    assert_eq!(trace.current_span_context(), rate_limit_cx);

    rate_limit.stop(Outcome::Success);
    assert_eq!(trace.parent_depth(), 0);
    assert_eq!(trace.current_span_context(), root);

    before_handle.stop();
}

#[test]
fn handler_errors_mark_the_handle_and_root_spans_and_still_propagate() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/users/42"));

    let parse = trace.on_parse(1).unwrap();
    parse.on_event("json").stop(Outcome::Success);
    parse.stop();

    let result: Result<(), io::Error> = trace
        .on_handle()
        .unwrap()
        .stop_with(Err(io::Error::new(io::ErrorKind::NotFound, "no such user")));
    let error = result.unwrap_err();
    assert_eq!(error.to_string(), "no such user");

    // The framework's error handling still sees the error, and recovering
    // from it doesn't clear the request's failure.
    let on_error = trace.on_error(1).unwrap();
    on_error.on_event("renderError").stop(Outcome::Success);
    on_error.stop();
    trace
        .on_after_response(
            0,
            &ResponseContext {
                status: Some(ResponseStatus::Named("Not Found".into())),
                ..ResponseContext::default()
            },
        )
        .unwrap()
        .stop();

    let spans = harness.finished();
    let handle = named(&spans, "handle");
    assert_eq!(handle.status, Status::error("no such user"));
    assert!(handle.events.iter().any(|event| event.name == "exception"));

    let root = named(&spans, "GET /users/42");
    assert_eq!(root.status, Status::error("no such user"));
    assert!(root.events.iter().any(|event| event.name == "exception"));
    assert_eq!(
        attribute(root, HTTP_RESPONSE_STATUS_CODE),
        Some(&Value::I64(404))
    );

    assert_eq!(named(&spans, "renderError").status, Status::Ok);
}

#[test]
fn event_errors_close_their_phase_immediately() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));

    let before_handle = trace.on_before_handle(2).unwrap();
    let failure = io::Error::new(io::ErrorKind::PermissionDenied, "forbidden");
    before_handle.on_event("auth").stop(Outcome::from(&failure));

    let spans = harness.finished();
    let auth = named(&spans, "auth");
    assert_eq!(auth.status, Status::error("forbidden"));
    assert_eq!(attribute(auth, ERROR_TYPE), Some(&string("Error")));
    assert_eq!(attribute(auth, ERROR_STACK), Some(&string("forbidden")));
    // The phase span has already ended, before the phase itself stops.
    assert_eq!(
        named(&spans, "beforeHandle").span_context.span_id(),
        auth.parent_span_id
    );
    assert_eq!(trace.parent_depth(), 0);

    before_handle.stop();
    trace
        .on_after_response(0, &ResponseContext::default())
        .unwrap()
        .stop();

    let spans = harness.finished();
    assert_eq!(
        spans.iter().filter(|span| span.name == "beforeHandle").count(),
        1
    );
    assert_eq!(named(&spans, "GET /").status, Status::error("forbidden"));
}

#[test]
fn concurrent_requests_never_nest_under_each_other() {
    let harness = Harness::new();
    let a = harness.instrumentation.start_request(get("/a"));
    let b = harness.instrumentation.start_request(get("/b"));

    let a_parse = a.on_parse(1).unwrap();
    let b_parse = b.on_parse(1).unwrap();
    let a_event = a_parse.on_event("a-json");
    let b_event = b_parse.on_event("b-json");
    let a_manual = a.start_span("a-manual");
    let b_manual = b.start_span("b-manual");
    b_event.stop(Outcome::Success);
    a_manual.span().end();
    a_event.stop(Outcome::Success);
    b_manual.span().end();
    b_parse.stop();
    a_parse.stop();
    let a_handle = a.on_handle().unwrap();
    let b_handle = b.on_handle().unwrap();
    b_handle.stop(Outcome::Success);
    a_handle.stop(Outcome::Success);
    b.on_after_response(0, &ResponseContext::default()).unwrap().stop();
    a.on_after_response(0, &ResponseContext::default()).unwrap().stop();

    let spans = harness.finished();
    let a_root = named(&spans, "GET /a");
    let b_root = named(&spans, "GET /b");
    assert_ne!(a_root.span_context.trace_id(), b_root.span_context.trace_id());

    for (prefix, root) in [("a-", a_root), ("b-", b_root)] {
        let trace_id = root.span_context.trace_id();
        for span in spans.iter().filter(|span| span.name.starts_with(prefix)) {
            assert_eq!(span.span_context.trace_id(), trace_id, "{}", span.name);
        }
    }
    assert_eq!(
        named(&spans, "a-manual").parent_span_id,
        named(&spans, "a-json").span_context.span_id()
    );
    assert_eq!(
        named(&spans, "b-manual").parent_span_id,
        named(&spans, "b-json").span_context.span_id()
    );
    let handles: Vec<_> = spans.iter().filter(|span| span.name == "handle").collect();
    assert_eq!(handles.len(), 2);
    for handle in handles {
        assert!(
            handle.parent_span_id == a_root.span_context.span_id()
                || handle.parent_span_id == b_root.span_context.span_id()
        );
    }
}

#[test]
fn records_the_request_and_response_on_the_root_span() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/users/42"));

    trace.on_handle().unwrap().stop(Outcome::Success);
    trace
        .on_after_response(
            0,
            &ResponseContext {
                route: Some("/users/:id".to_owned()),
                response_body: Some(Payload::Json(serde_json::json!({ "id": 42 }))),
                status: Some(ResponseStatus::Code(200)),
                ..ResponseContext::default()
            },
        )
        .unwrap()
        .stop();

    let spans = harness.finished();
    let root = named(&spans, "GET /users/:id");
    assert_eq!(root.span_kind, SpanKind::Server);
    assert_eq!(root.status, Status::Ok);
    assert_eq!(attribute(root, HTTP_REQUEST_METHOD), Some(&string("GET")));
    assert_eq!(attribute(root, URL_PATH), Some(&string("/users/42")));
    assert_eq!(attribute(root, HTTP_ROUTE), Some(&string("/users/:id")));
    assert_eq!(
        attribute(root, URL_FULL),
        Some(&string("http://localhost:3000/users/42"))
    );
    assert_eq!(attribute(root, URL_SCHEME), Some(&string("http")));
    assert_eq!(
        attribute(root, HTTP_RESPONSE_STATUS_CODE),
        Some(&Value::I64(200))
    );
    assert_eq!(attribute(root, HTTP_RESPONSE_BODY), Some(&string(r#"{"id":42}"#)));
    assert_eq!(attribute(root, HTTP_RESPONSE_BODY_SIZE), Some(&Value::I64(9)));
    assert_eq!(
        attribute(root, "http.request.header.host"),
        Some(&string("localhost:3000"))
    );
}

#[test]
fn names_the_root_after_the_route_set_by_the_handler() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/orders/7"));

    trace.set_route("/orders/:id");
    trace
        .on_after_response(0, &ResponseContext::default())
        .unwrap()
        .stop();

    let spans = harness.finished();
    let root = named(&spans, "GET /orders/:id");
    assert_eq!(attribute(root, HTTP_ROUTE), Some(&string("/orders/:id")));
}

#[test]
fn adopts_the_inbound_trace_parent() {
    let harness = Harness::new();
    let request = http::Request::get("/")
        .header(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )
        .body(())
        .unwrap();
    let trace = harness
        .instrumentation
        .start_request(RequestHead::from_request(&request, "1"));
    drop(trace);

    let spans = harness.finished();
    let root = named(&spans, "GET /");
    assert_eq!(
        root.span_context.trace_id().to_string(),
        "0af7651916cd43dd8448eb211c80319c"
    );
    assert_eq!(root.parent_span_id.to_string(), "b7ad6b7169203331");
}

#[test]
fn ignores_an_invalid_trace_parent() {
    let harness = Harness::new();
    let request = http::Request::get("/")
        .header("traceparent", "not a trace parent")
        .body(())
        .unwrap();
    drop(
        harness
            .instrumentation
            .start_request(RequestHead::from_request(&request, "1")),
    );

    let spans = harness.finished();
    assert_eq!(named(&spans, "GET /").parent_span_id, SpanId::INVALID);
}

#[test]
fn dropped_requests_close_their_spans_as_aborted() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/slow"));

    let parse = trace.on_parse(1).unwrap();
    let event = parse.on_event("stream");
    drop(event);
    assert_eq!(trace.parent_depth(), 0);
    drop(parse);
    let handle = trace.on_handle().unwrap();
    drop(handle);
    drop(trace);

    let spans = harness.finished();
    assert_eq!(named(&spans, "stream").status, Status::error("aborted"));
    assert_eq!(named(&spans, "parse").status, Status::error("aborted"));
    assert_eq!(named(&spans, "handle").status, Status::error("aborted"));
    assert_eq!(
        named(&spans, "GET /slow").status,
        Status::error("request aborted")
    );
}

#[test]
fn handler_helpers_follow_the_current_parent() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));

    let handle = trace.on_handle().unwrap();
    let handle_id = handle.context().span().span_context().span_id();
    assert!(trace.set_attributes([KeyValue::new("user.id", 42_i64)]));

    let value = trace
        .in_span("load", |cx| {
            assert!(cx.span().is_recording());
            assert_eq!(
                Context::current().span().span_context(),
                cx.span().span_context()
            );
            Ok::<_, io::Error>(7)
        })
        .unwrap();
    assert_eq!(value, 7);
    let failed = trace.in_span("save", |_| {
        Err::<(), _>(io::Error::new(io::ErrorKind::Other, "disk full"))
    });
    assert!(failed.is_err());

    handle.stop(Outcome::Success);
    trace
        .on_after_response(0, &ResponseContext::default())
        .unwrap()
        .stop();

    let spans = harness.finished();
    let handle = named(&spans, "handle");
    assert_eq!(attribute(handle, "user.id"), Some(&Value::I64(42)));
    assert_eq!(named(&spans, "load").parent_span_id, handle_id);
    assert_eq!(named(&spans, "load").status, Status::Unset);
    let save = named(&spans, "save");
    assert_eq!(save.parent_span_id, handle_id);
    assert_eq!(save.status, Status::error("disk full"));
}

#[test]
fn set_attributes_reports_a_closed_parent() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));
    trace
        .on_after_response(0, &ResponseContext::default())
        .unwrap()
        .stop();

    assert!(!trace.set_attributes([KeyValue::new("late", true)]));
}

#[tokio::test]
async fn wrap_makes_the_root_span_ambient() {
    let harness = Harness::new();

    let (ambient, tracked) = harness
        .instrumentation
        .wrap(get("/"), |trace| async move {
            let ambient = Context::current().span().span_context().clone();
            let tracked = trace.current_span_context();
            let _ = trace
                .in_span_async("fetch", |_| async { Ok::<_, io::Error>(()) })
                .await;
            (ambient, tracked)
        })
        .await;

    assert!(ambient.is_valid());
    assert_eq!(ambient, tracked);
    let spans = harness.finished();
    assert_eq!(
        named(&spans, "fetch").parent_span_id,
        ambient.span_id()
    );
}

#[test]
fn outbound_headers_carry_the_current_parent() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));

    let handle = trace.on_handle().unwrap();
    let span_id = handle.context().span().span_context().span_id();
    let headers = trace_headers(&trace);
    handle.stop(Outcome::Success);

    let traceparent = headers["traceparent"].to_str().unwrap();
    assert!(traceparent.contains(&span_id.to_string()), "{traceparent}");
}

#[test]
fn event_stop_with_hands_the_error_back() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));

    let transform = trace.on_transform(2).unwrap();
    let value = transform.on_event("trim").stop_with(Ok::<_, io::Error>(" x ".trim()));
    assert_eq!(value.unwrap(), "x");
    let error = transform
        .on_event("decode")
        .stop_with(Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "bad utf-8")))
        .unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    transform.stop();
    drop(trace);

    let spans = harness.finished();
    assert_eq!(named(&spans, "trim").status, Status::Ok);
    let decode = named(&spans, "decode");
    assert_eq!(decode.status, Status::error("bad utf-8"));
    assert_eq!(attribute(decode, ERROR_STACK), Some(&string("bad utf-8")));
}

#[tokio::test]
async fn in_span_async_records_and_returns_errors() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/"));
    let handle = trace.on_handle().unwrap();
    let handle_id = handle.context().span().span_context().span_id();

    let result = trace
        .in_span_async("publish", |_| async {
            Err::<(), _>(io::Error::new(io::ErrorKind::TimedOut, "broker timed out"))
        })
        .await;
    assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    handle.stop(Outcome::Success);
    drop(trace);

    let spans = harness.finished();
    let publish = named(&spans, "publish");
    assert_eq!(publish.parent_span_id, handle_id);
    assert_eq!(publish.status, Status::error("broker timed out"));
    assert!(publish.events.iter().any(|event| event.name == "exception"));
}

#[test]
fn links_tracing_spans_under_the_current_parent() {
    use tracing_subscriber::layer::SubscriberExt;

    let harness = Harness::new();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(harness.provider.tracer("bridge")));
    let trace = harness.instrumentation.start_request(get("/"));
    let handle = trace.on_handle().unwrap();
    let handle_id = handle.context().span().span_context().span_id();

    tracing::subscriber::with_default(subscriber, || {
        let span = tracing::info_span!("query_users");
        trace.link_tracing_span(&span);
        span.in_scope(|| tracing::info!("querying"));
    });
    handle.stop(Outcome::Success);
    drop(trace);

    let spans = harness.finished();
    let query = named(&spans, "query_users");
    assert_eq!(query.parent_span_id, handle_id);
    assert_eq!(
        query.span_context.trace_id(),
        named(&spans, "GET /").span_context.trace_id()
    );
}

#[test]
fn dropping_the_final_phase_aborts_the_request() {
    let harness = Harness::new();
    let trace = harness.instrumentation.start_request(get("/download"));

    trace.on_handle().unwrap().stop(Outcome::Success);
    let after_response = trace
        .on_after_response(1, &ResponseContext::default())
        .unwrap();
    drop(after_response);

    assert!(trace.is_closed());
    let spans = harness.finished();
    assert_eq!(named(&spans, "afterResponse").status, Status::Unset);
    assert_eq!(named(&spans, "GET /download").status, Status::error("aborted"));
}
