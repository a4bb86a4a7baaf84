//! Shorthands over [`crate::performance::PerformanceSpan`].

/// Enter a debug span carrying the given fields and return a
/// [`crate::performance::PerformanceSpan`] guard for the same scope.
///
/// ```rust
/// use jacrun_tracing::perf_span;
///
/// {
///     let _timer = perf_span!("chunk", offset = 0usize, len = 128usize);
///     // ... chunk work ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::in_span(
            $name,
            $crate::__private::tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Run a block and return `(result, elapsed Duration)`, emitting a debug
/// event with the timing.
///
/// ```rust
/// use jacrun_tracing::timed_block;
///
/// let (sum, elapsed) = timed_block!("sum", { (1..=10).sum::<u32>() });
/// assert_eq!(sum, 55);
/// assert!(elapsed.as_secs() < 1);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let elapsed = start.elapsed();
        $crate::__private::tracing::debug!(
            operation = $name,
            duration_us = elapsed.as_micros() as u64,
            "timed block complete"
        );
        (result, elapsed)
    }};
}
