//! logrelay logger
//!
//! The composite logger applications log through. Every call is fanned out
//! to the configured sinks; see `logrelay-output` for the sinks themselves.

pub mod logger;

pub use logger::{CompositeLogger, DEFAULT_FATAL_GRACE};
pub use logrelay_core::concat;

/// Log several values as one space-separated line
///
/// ```ignore
/// relay!(logger, info, request_id, "served in", elapsed_ms, "ms").await;
/// ```
#[macro_export]
macro_rules! relay {
    ($logger:expr, $level:ident, $($value:expr),+ $(,)?) => {
        $logger.$level($crate::concat(&[$(&$value as &dyn ::std::fmt::Display),+]))
    };
}
