//! Timing guards for the hot paths of the harness.
//!
//! A [`PerformanceSpan`] starts a clock when created and emits one debug
//! event with its duration when dropped. Whether anything is emitted, and the
//! minimum duration worth emitting, are process-wide settings installed by
//! [`crate::init_global_tracing`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
static THRESHOLD_US: AtomicU64 = AtomicU64::new(0);

/// Install the process-wide performance-span settings.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    THRESHOLD_US.store(threshold_us.unwrap_or(0), Ordering::Relaxed);
}

/// Whether performance spans currently emit events.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// RAII guard that logs its own lifetime.
///
/// ```rust
/// use jacrun_tracing::performance::PerformanceSpan;
///
/// {
///     let _span = PerformanceSpan::new("transfer_in", None);
///     // ... work ...
/// } // logged here if performance tracing is enabled
/// ```
pub struct PerformanceSpan {
    name: &'static str,
    threshold_us: Option<u64>,
    start: Instant,
    _entered: Option<tracing::span::EnteredSpan>,
}

impl PerformanceSpan {
    /// Start timing `name`. `threshold_us` overrides the global threshold.
    pub fn new(name: &'static str, threshold_us: Option<u64>) -> Self {
        Self {
            name,
            threshold_us,
            start: Instant::now(),
            _entered: None,
        }
    }

    /// Like [`Self::new`], but keeps `span` entered for the guard's lifetime.
    pub fn in_span(name: &'static str, span: tracing::Span) -> Self {
        Self {
            _entered: Some(span.entered()),
            ..Self::new(name, None)
        }
    }

    /// Time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Microseconds elapsed since creation.
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let duration_us = self.elapsed_us();
        let threshold = self.threshold_us.unwrap_or_else(|| THRESHOLD_US.load(Ordering::Relaxed));
        if duration_us >= threshold {
            tracing::debug!(
                target: "jacrun::perf",
                name = self.name,
                duration_us,
                duration_ms = duration_us as f64 / 1000.0,
                "span complete"
            );
        }
    }
}
