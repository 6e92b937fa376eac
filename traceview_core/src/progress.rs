//! Progress callback plumbing shared by trackers and transforms.
//!
//! Protocol: monotonic non-decreasing integers in `[0, 100]`, final call is
//! always `100`, repeated same-value calls are allowed, and a missing
//! callback is accepted everywhere.

/// Callback signature: percent complete in `[0, 100]`.
pub type ProgressFn<'a> = &'a mut dyn FnMut(i32);

/// Wrapper enforcing the callback protocol over an optional sink.
pub struct Progress<'a> {
    sink: Option<ProgressFn<'a>>,
    last: i32,
}

impl<'a> Progress<'a> {
    pub fn new(sink: Option<ProgressFn<'a>>) -> Self {
        Self { sink, last: 0 }
    }

    /// Silent progress for callers that do not report.
    pub fn none() -> Self {
        Self { sink: None, last: 0 }
    }

    /// Report a percentage. Values are clamped to `[0, 100]`; regressions
    /// below the last reported value are dropped to keep the stream monotone.
    pub fn report(&mut self, pct: i32) {
        let pct = pct.clamp(0, 100);
        if pct < self.last {
            return;
        }
        self.last = pct;
        if let Some(sink) = self.sink.as_mut() {
            sink(pct);
        }
    }

    /// Report completion. Every operation calls this exactly once on exit.
    pub fn finish(&mut self) {
        self.report(100);
    }
}
