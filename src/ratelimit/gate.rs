//! Check, run, release and render around a protected call.
//!
//! [`IngressGate`] guards incoming requests, [`EgressGate`] guards outgoing
//! calls. An egress gate configured to propagate raises
//! [`TooManyRequests`](crate::error::TooManyRequests), which an ingress gate
//! further up the call chain renders as its own throttled response.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::check::{worst_of, LimitCheckResult};
use super::limiter::Throttler;
use super::request::{
    render_default, EgressResponse, IngressResponse, RequestProxy, ResponseFabric, ResponseProxy,
    ResponseStatus,
};
use crate::error::{find_too_many_requests, ThrottleError};

/// What happened to a guarded call.
#[derive(Debug)]
pub enum Handled<T, R> {
    /// The call ran and produced a value
    Completed(T),
    /// The call was throttled; `R` is the rendered response
    Throttled(R),
}

impl<T, R> Handled<T, R> {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Handled::Throttled(_))
    }
}

/// Failure of a guarded call.
#[derive(Debug, Error)]
pub enum GateError<E>
where
    E: std::error::Error + 'static,
{
    /// The throttling engine failed, or a throttled call must be surfaced
    #[error("Throttling: {0}")]
    Throttle(#[source] ThrottleError),

    /// The protected call itself failed
    #[error("Protected call failed: {0}")]
    Work(#[source] E),
}

/// Pick the fabric for the worst result and render with it.
fn render(
    gate_fabric: Option<&ResponseFabric>,
    results: &[LimitCheckResult],
    request: &RequestProxy,
    response: &mut dyn ResponseProxy,
) {
    let Some(worst) = worst_of(results) else {
        return;
    };
    let fabric = worst
        .rule
        .as_ref()
        .and_then(|rule| rule.response_fabric())
        .or(gate_fabric);
    match fabric {
        Some(fabric) => fabric(results, request, response),
        None => render_default(worst, response),
    }
}

async fn record<T: ResponseStatus, E>(
    throttler: &Throttler,
    request: &RequestProxy,
    outcome: &std::result::Result<T, E>,
) {
    match outcome {
        Ok(value) => throttler.record_outcome(request, value.status_code(), false).await,
        Err(_) => throttler.record_outcome(request, None, true).await,
    }
}

/// Guards incoming requests.
pub struct IngressGate {
    throttler: Arc<Throttler>,
    fabric: Option<ResponseFabric>,
}

impl IngressGate {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self {
            throttler,
            fabric: None,
        }
    }

    /// Renderer used when the exceeded rule has none of its own.
    pub fn with_response_fabric(mut self, fabric: ResponseFabric) -> Self {
        self.fabric = Some(fabric);
        self
    }

    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    /// Check `request`, run `work` unless throttled, then release held slots
    /// and report the outcome to circuit breakers.
    pub async fn process<T, E, F, Fut>(
        &self,
        request: &RequestProxy,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<Handled<T, IngressResponse>, GateError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        T: ResponseStatus,
        E: std::error::Error + 'static,
    {
        let evaluation = self
            .throttler
            .check(request, cancel)
            .await
            .map_err(GateError::Throttle)?;

        if evaluation.is_exceeded() {
            let mut response = IngressResponse::default();
            render(self.fabric.as_ref(), &evaluation.results, request, &mut response);
            if !response.continue_as_normal {
                evaluation.release().await;
                return Ok(Handled::Throttled(response));
            }
            debug!(uri = %request.uri(), "Throttled request continues as normal");
        }

        let outcome = work().await;
        evaluation.release().await;
        record(&self.throttler, request, &outcome).await;

        match outcome {
            Ok(value) => Ok(Handled::Completed(value)),
            Err(e) => {
                let Some(signal) = find_too_many_requests(&e) else {
                    return Err(GateError::Work(e));
                };
                debug!(
                    counter = %signal.counter_id,
                    retry_after = signal.retry_after_seconds,
                    "Downstream call throttled, throttling request"
                );
                let result = LimitCheckResult::from(signal);
                let mut response = IngressResponse::default();
                render(self.fabric.as_ref(), std::slice::from_ref(&result), request, &mut response);
                if response.continue_as_normal {
                    return Err(GateError::Work(e));
                }
                Ok(Handled::Throttled(response))
            }
        }
    }
}

/// Guards outgoing calls.
pub struct EgressGate {
    throttler: Arc<Throttler>,
    fabric: Option<ResponseFabric>,
}

impl EgressGate {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self {
            throttler,
            fabric: None,
        }
    }

    /// Renderer used when the exceeded rule has none of its own. It may set
    /// `should_retry` to wait out the limit and try again.
    pub fn with_response_fabric(mut self, fabric: ResponseFabric) -> Self {
        self.fabric = Some(fabric);
        self
    }

    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    /// Check `request` and run `work` once allowed.
    ///
    /// A throttled call is retried while the response fabric asks for it.
    /// Otherwise it yields the synthetic response, or a
    /// [`TooManyRequests`](crate::error::TooManyRequests) error when the
    /// configuration propagates to ingress.
    pub async fn send<T, E, F, Fut>(
        &self,
        request: &RequestProxy,
        cancel: &CancellationToken,
        mut work: F,
    ) -> Result<Handled<T, EgressResponse>, GateError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        T: ResponseStatus,
        E: std::error::Error + 'static,
    {
        let mut retry_count = 0;
        loop {
            let evaluation = self
                .throttler
                .check(request, cancel)
                .await
                .map_err(GateError::Throttle)?;

            let Some(worst) = evaluation.exceeded().cloned() else {
                let outcome = work().await;
                evaluation.release().await;
                record(&self.throttler, request, &outcome).await;
                return outcome.map(Handled::Completed).map_err(GateError::Work);
            };

            let mut response = EgressResponse {
                retry_count,
                ..EgressResponse::default()
            };
            render(self.fabric.as_ref(), &evaluation.results, request, &mut response);
            evaluation.release().await;

            if response.should_retry {
                debug!(
                    uri = %request.uri(),
                    retry_count = retry_count,
                    retry_after = worst.retry_after_seconds,
                    "Retrying throttled call"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(GateError::Throttle(ThrottleError::Cancelled));
                    }
                    _ = tokio::time::sleep(Duration::from_secs(worst.retry_after_seconds)) => {}
                }
                retry_count += 1;
                continue;
            }

            if self.throttler.snapshot().propagate_to_ingress {
                return Err(GateError::Throttle(ThrottleError::TooManyRequests(
                    worst.to_signal(),
                )));
            }
            return Ok(Handled::Throttled(response));
        }
    }
}
