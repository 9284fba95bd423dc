//! The span around the request handler itself.

use std::error::Error;

use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use opentelemetry::Context;

use crate::lifecycle::{Outcome, Phase};
use crate::trace::RequestTrace;

impl RequestTrace {
    /// Opens the span for the handler, which becomes the current parent.
    ///
    /// It stays the parent after it stops, until the next phase with events
    /// starts.
    pub fn on_handle(&self) -> Option<HandleSpan> {
        let root = {
            let mut state = self.lock();
            if state.is_closed() {
                tracing::warn!("handler reported after the request trace closed");
                return None;
            }
            state.stack.reset();
            state.stack.root().clone()
        };

        let cx = self
            .tracer()
            .start_child(Phase::Handle.as_str().into(), SpanKind::Internal, &root);
        // Released by the next phase rather than by the handler stopping.
        let _ = self.lock().stack.descend(cx.clone());
        Some(HandleSpan {
            trace: self.clone(),
            cx,
            stopped: false,
        })
    }
}

/// The running request handler.
#[derive(Debug)]
#[must_use = "dropping a handle span closes it as aborted"]
pub struct HandleSpan {
    trace: RequestTrace,
    cx: Context,
    stopped: bool,
}

impl HandleSpan {
    /// The context carrying the handler's span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Signals that the handler returned.
    ///
    /// A failure is recorded as an exception on both the handler span and
    /// the root span.
    pub fn stop(mut self, outcome: Outcome<'_>) {
        self.stopped = true;
        let span = self.cx.span();
        let mut state = self.trace.lock();
        match outcome {
            Outcome::Failure(failure) => {
                let message = failure.error().to_string();
                span.set_status(Status::error(message.clone()));
                span.record_error(failure.error());
                state.stack.root().span().record_error(failure.error());
                state.record_failure(message);
            }
            Outcome::Success => {
                span.set_status(Status::Ok);
                state.record_success();
            }
        }
        span.end();
    }

    /// Stops with the outcome of `result`, handing the result back so the
    /// error still reaches the framework's error handling.
    pub fn stop_with<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: Error + 'static,
    {
        self.stop(Outcome::of(&result));
        result
    }
}

impl Drop for HandleSpan {
    fn drop(&mut self) {
        if !self.stopped {
            tracing::warn!("handler dropped before it stopped");
            let span = self.cx.span();
            span.set_status(Status::error("aborted"));
            span.end();
        }
    }
}
