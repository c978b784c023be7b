//! Derived-signal side of the engine: indicator computation, pluggable
//! strategies, and the readiness gate that decides whether a symbol has
//! enough quality data to run a signal at all.

pub mod indicators;
pub mod readiness;
pub mod strategy;
