//! Reporting seam for background components.

use std::fmt;

use log::warn;

/// Sink for operational events of background machinery.
///
/// The engine never fails an operation because reporting failed; sinks are
/// fire-and-forget.
pub trait MetricsSink: Send + Sync {
    /// Called once per maintenance tick.
    fn poll(&self) {}

    /// Report a background failure attributed to `component`.
    fn report(&self, component: &'static str, error: &dyn fmt::Display);
}

/// Default sink: forwards failures to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn report(&self, component: &'static str, error: &dyn fmt::Display) {
        warn!("{component}: {error}");
    }
}
