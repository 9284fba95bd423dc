//! The final lifecycle phase, which annotates and closes the root span.

use std::borrow::Cow;

use crate::attributes::response_attributes;
use crate::lifecycle::{Phase, ResponseContext};
use crate::phase::{EventSpan, PhaseSpan};
use crate::trace::RequestTrace;

impl RequestTrace {
    /// Starts the final phase of the request, which is about to run `total`
    /// events, and collects the attributes describing the response.
    ///
    /// The root span closes when the returned phase stops. Dropping it
    /// instead closes the root as aborted.
    pub fn on_after_response(&self, total: usize, cx: &ResponseContext) -> Option<AfterResponse> {
        if self.is_closed() {
            tracing::warn!("response reported after the request trace closed");
            return None;
        }
        let phase = self.inspect(Phase::AfterResponse, total);

        let mut state = self.lock();
        let attributes = response_attributes(&state.head, cx);
        state.attributes.extend(attributes);
        if let Some(route) = &cx.route {
            state.route = Some(route.clone());
        }
        drop(state);

        Some(AfterResponse {
            trace: self.clone(),
            phase,
            stopped: false,
        })
    }
}

/// The open final phase of a request.
#[derive(Debug)]
#[must_use = "dropping the final phase closes the request trace as aborted"]
pub struct AfterResponse {
    trace: RequestTrace,
    phase: Option<PhaseSpan>,
    stopped: bool,
}

impl AfterResponse {
    /// Opens a span for one of the phase's events, if the phase announced
    /// any.
    pub fn on_event(&self, name: impl Into<Cow<'static, str>>) -> Option<EventSpan> {
        self.phase.as_ref().map(|phase| phase.on_event(name))
    }

    /// Signals the end of the request: the root span is renamed after the
    /// route, receives every collected attribute, and ends.
    pub fn stop(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.stopped = true;
        if let Some(phase) = self.phase.take() {
            phase.stop();
        }
        self.trace.lock().close_root();
    }
}

impl Drop for AfterResponse {
    fn drop(&mut self) {
        if !self.stopped {
            tracing::warn!("final phase dropped before it stopped");
            self.trace.lock().record_failure("aborted".to_owned());
            self.finish();
        }
    }
}
