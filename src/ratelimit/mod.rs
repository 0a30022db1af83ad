//! Rate limiting logic: methods, rules, evaluation and the gates that wrap
//! request handling.

pub mod check;
pub mod circuit_breaker;
mod descriptor;
pub mod fixed_window;
pub mod gate;
pub mod limiter;
pub mod method;
pub mod request;
pub mod rules;
pub mod semaphore;
pub mod sliding_window;
pub mod source;

pub use check::{LimitCheckResult, TooManyRequests, Verdict};
pub use circuit_breaker::{CircuitBreaker, TrialRegistry};
pub use descriptor::{DescriptorKey, Direction};
pub use fixed_window::FixedWindow;
pub use gate::{EgressGate, GateError, Handled, IngressGate};
pub use limiter::{Evaluation, ReleaseGuard, Throttler, ThrottlerBuilder};
pub use method::{MethodContext, MethodKind, MethodSettings, RateLimitMethod};
pub use request::{
    EgressResponse, IngressResponse, RequestProxy, ResponseFabric, ResponseProxy, ThrottledResponse,
};
pub use rules::{ConfigSnapshot, FilterConfig, RequestFilter, Rule, RuleConfig, ThrottleConfig};
pub use semaphore::Semaphore;
pub use sliding_window::SlidingWindow;
pub use source::{ConfigSource, FileConfigSource, FnConfigSource, StaticConfigSource};
