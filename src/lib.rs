//! Throttlegate - Distributed Rate Limiting Engine
//!
//! This crate throttles incoming and outgoing requests with fixed window,
//! sliding window, semaphore and circuit breaker limits. Counters live in a
//! pluggable store so every instance of a service shares the same quota.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
