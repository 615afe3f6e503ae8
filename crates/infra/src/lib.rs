//! Infrastructure layer for the OpenData gateway: guarded HTTP access to
//! upstream open-data APIs.
//!
//! The [`api`] module composes the generic resilience primitives from
//! `opendata-common` into a single call-guarding pipeline
//! (limiter → breaker → retry → transport) and owns the classified error
//! taxonomy that callers use to distinguish retryable from terminal
//! failures.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod api;
