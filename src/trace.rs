//! Optional tracing hooks.
//!
//! Fitting sweeps are hot loops, so instrumentation must cost nothing when
//! it is not wanted. Both macros take an operation name plus `key = value`
//! measurement pairs; spans carry exactly one (the work-item count of the
//! sweep) and are entered immediately, so call sites bind the result and
//! the span covers the enclosing scope. With the `tracing` cargo feature
//! off the expansions are empty and the field expressions are never
//! evaluated.

/// Opens and enters a span around one sweep or seeding pass.
#[cfg(feature = "tracing")]
macro_rules! trace_span {
    ($name:expr, $count:ident = $value:expr) => {
        tracing::info_span!($name, $count = $value).entered()
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_span {
    ($name:expr, $count:ident = $value:expr) => {
        ()
    };
}

/// Records sweep measurements (unconverged counts, solve totals).
#[cfg(feature = "tracing")]
macro_rules! trace_event {
    ($name:expr, $($key:ident = $value:expr),+) => {
        tracing::info!(name: $name, $($key = $value),+)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_event {
    ($name:expr, $($key:ident = $value:expr),+) => {
        ()
    };
}

pub(crate) use trace_event;
pub(crate) use trace_span;
