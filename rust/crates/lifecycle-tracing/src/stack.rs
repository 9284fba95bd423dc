//! The per-request record of which span new spans should nest under.

use opentelemetry::Context;

/// A pushed parent. Restoring consumes it, so a frame can't be popped twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a frame that is never restored keeps its span as the current parent"]
pub(crate) struct Frame(u64);

/// Tracks the current parent span of a single request.
///
/// The root is always at the bottom and can't be popped. Frames above it
/// are addressed individually: restoring a frame removes exactly that
/// frame, even when sibling frames pushed after it are still live.
#[derive(Debug)]
pub(crate) struct SpanStack {
    root: Context,
    frames: Vec<(u64, Context)>,
    next_id: u64,
}

impl SpanStack {
    pub fn new(root: Context) -> Self {
        Self {
            root,
            frames: Vec::new(),
            next_id: 0,
        }
    }

    pub fn root(&self) -> &Context {
        &self.root
    }

    /// The span any newly started span should nest under.
    pub fn current(&self) -> &Context {
        self.frames.last().map_or(&self.root, |(_, cx)| cx)
    }

    /// Number of frames above the root.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Makes `cx` the current parent.
    pub fn descend(&mut self, cx: Context) -> Frame {
        let id = self.next_id;
        self.next_id += 1;
        self.frames.push((id, cx));
        Frame(id)
    }

    /// Removes `frame`, making the parent that was current before it was
    /// pushed current again (unless frames pushed later are still live).
    ///
    /// Frames already discarded by [`SpanStack::reset`] are ignored.
    pub fn restore(&mut self, frame: Frame) {
        if let Some(position) = self.frames.iter().rposition(|(id, _)| *id == frame.0) {
            self.frames.remove(position);
        }
    }

    /// Makes the root the current parent again.
    pub fn reset(&mut self) {
        self.frames.clear();
    }
}
