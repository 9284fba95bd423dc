//! Spans for lifecycle phases that run a variable number of events.

use std::borrow::Cow;
use std::error::Error;

use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};

use crate::context::end_if_recording;
use crate::fields::{ERROR_STACK, ERROR_TYPE};
use crate::lifecycle::{Outcome, Phase};
use crate::stack::Frame;
use crate::trace::RequestTrace;

impl RequestTrace {
    /// Opens a span for `phase`, which is about to run `total` events.
    ///
    /// Phases with nothing scheduled produce no span, and so do phases
    /// reported after the request's root span has closed.
    pub fn inspect(&self, phase: Phase, total: usize) -> Option<PhaseSpan> {
        if total == 0 {
            return None;
        }
        let root = {
            let mut state = self.lock();
            if state.is_closed() {
                tracing::warn!(%phase, "phase reported after the request trace closed");
                return None;
            }
            state.stack.reset();
            state.stack.root().clone()
        };

        let cx = self
            .tracer()
            .start_child(phase.as_str().into(), SpanKind::Internal, &root);
        tracing::debug!(%phase, total, "phase started");
        Some(PhaseSpan {
            trace: self.clone(),
            phase,
            cx,
            stopped: false,
        })
    }

    pub fn on_request(&self, total: usize) -> Option<PhaseSpan> {
        self.inspect(Phase::Request, total)
    }

    pub fn on_parse(&self, total: usize) -> Option<PhaseSpan> {
        self.inspect(Phase::Parse, total)
    }

    pub fn on_transform(&self, total: usize) -> Option<PhaseSpan> {
        self.inspect(Phase::Transform, total)
    }

    pub fn on_before_handle(&self, total: usize) -> Option<PhaseSpan> {
        self.inspect(Phase::BeforeHandle, total)
    }

    pub fn on_after_handle(&self, total: usize) -> Option<PhaseSpan> {
        self.inspect(Phase::AfterHandle, total)
    }

    pub fn on_error(&self, total: usize) -> Option<PhaseSpan> {
        self.inspect(Phase::Error, total)
    }

    pub fn on_map_response(&self, total: usize) -> Option<PhaseSpan> {
        self.inspect(Phase::MapResponse, total)
    }
}

/// An open lifecycle phase.
///
/// Each event the phase runs gets its own child span via
/// [`PhaseSpan::on_event`]. Dropping the phase without calling
/// [`PhaseSpan::stop`] closes it as aborted.
#[derive(Debug)]
#[must_use = "dropping a phase span closes it as aborted"]
pub struct PhaseSpan {
    trace: RequestTrace,
    phase: Phase,
    cx: Context,
    stopped: bool,
}

impl PhaseSpan {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The context carrying this phase's span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Opens a span for an event that is about to run. It becomes the
    /// current parent until it stops.
    pub fn on_event(&self, name: impl Into<Cow<'static, str>>) -> EventSpan {
        let cx = self
            .trace
            .tracer()
            .start_child(name.into(), SpanKind::Internal, &self.cx);
        let frame = self.trace.lock().stack.descend(cx.clone());
        EventSpan {
            trace: self.trace.clone(),
            phase_cx: self.cx.clone(),
            cx,
            frame: Some(frame),
        }
    }

    /// Signals that every event of the phase has been dispatched.
    pub fn stop(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.stopped = true;
        end_if_recording(&self.cx);
        self.trace.lock().stack.reset();
        tracing::debug!(phase = %self.phase, "phase stopped");
    }
}

impl Drop for PhaseSpan {
    fn drop(&mut self) {
        if !self.stopped {
            tracing::warn!(phase = %self.phase, "phase dropped before it stopped");
            self.cx.span().set_status(Status::error("aborted"));
            self.finish();
        }
    }
}

/// A single event running within a phase.
#[derive(Debug)]
#[must_use = "dropping an event span closes it as aborted"]
pub struct EventSpan {
    trace: RequestTrace,
    phase_cx: Context,
    cx: Context,
    frame: Option<Frame>,
}

impl EventSpan {
    /// The context carrying this event's span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Signals that the event finished.
    ///
    /// A failure marks the event and the request as failed and closes the
    /// enclosing phase span.
    pub fn stop(mut self, outcome: Outcome<'_>) {
        self.finish(Some(outcome));
    }

    /// Stops with the outcome of `result`, handing the result back so the
    /// error keeps propagating.
    pub fn stop_with<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: Error + 'static,
    {
        self.stop(Outcome::of(&result));
        result
    }

    fn finish(&mut self, outcome: Option<Outcome<'_>>) {
        let Some(frame) = self.frame.take() else {
            return;
        };

        let span = self.cx.span();
        let mut state = self.trace.lock();
        match outcome {
            Some(Outcome::Failure(failure)) => {
                let message = failure.error().to_string();
                span.set_attribute(KeyValue::new(ERROR_TYPE, failure.type_name()));
                span.set_attribute(KeyValue::new(ERROR_STACK, failure.source_chain()));
                span.set_status(Status::error(message.clone()));
                end_if_recording(&self.phase_cx);
                state.record_failure(message);
            }
            Some(Outcome::Success) => {
                span.set_status(Status::Ok);
                state.record_success();
            }
            None => {
                span.set_status(Status::error("aborted"));
            }
        }
        span.end();
        state.stack.restore(frame);
    }
}

impl Drop for EventSpan {
    fn drop(&mut self) {
        if self.frame.is_some() {
            tracing::warn!("event dropped before it stopped");
            self.finish(None);
        }
    }
}
