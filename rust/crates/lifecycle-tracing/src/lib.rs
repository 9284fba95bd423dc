//! Traces every request through a web framework's lifecycle as a tree of
//! OpenTelemetry spans: one root span per request, one span per lifecycle
//! phase, and one per event each phase runs.
//!
//! The framework reports its phases to a [`RequestTrace`], obtained from
//! [`Instrumentation::start_request`] (or the [`http_server::layer`] Tower
//! layer). All tracking state is scoped to that request, so concurrent
//! requests sharing one tracer never nest under each other's spans.
//!
//! ```no_run
//! use lifecycle_tracing::{Instrumentation, Outcome, RequestHead, ResponseContext};
//!
//! # fn run(head: RequestHead) {
//! let instrumentation = Instrumentation::global("users-service");
//! let trace = instrumentation.start_request(head);
//!
//! if let Some(parse) = trace.on_parse(1) {
//!     let event = parse.on_event("json");
//!     event.stop(Outcome::Success);
//!     parse.stop();
//! }
//! if let Some(handle) = trace.on_handle() {
//!     handle.stop(Outcome::Success);
//! }
//! if let Some(after_response) = trace.on_after_response(0, &ResponseContext::default()) {
//!     after_response.stop();
//! }
//! # }
//! ```

mod after_response;
pub mod attributes;
pub mod context;
pub mod fields;
mod handle;
pub mod http_client;
pub mod http_server;
pub mod lifecycle;
pub mod numeric;
mod phase;
pub mod setup;
mod stack;
mod trace;

pub use after_response::AfterResponse;
pub use handle::HandleSpan;
pub use lifecycle::{Failure, Outcome, Payload, Phase, RequestHead, ResponseContext, ResponseStatus, ServerBinding};
pub use phase::{EventSpan, PhaseSpan};
pub use trace::{Instrumentation, RequestTrace};

// Re-export [`tracing`] so clients don't have to add it separately.
pub use tracing;
