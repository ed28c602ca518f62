//! Metered call gateway
//!
//! Every LLM completion and web search passes through [`CallGateway::call`]:
//! cache lookup, budget gate on misses, per-attempt timeout, bounded retry
//! with exponential backoff, and ledger bookkeeping.

use std::{future::Future, sync::Arc};

use uuid::Uuid;

use crate::{
    brain::ProviderError,
    cache::{CacheStore, CachedValue, CanonicalKey, Namespace},
    config::CallPolicy,
    ledger::{CallUsage, CostLedger, RunMeter},
    workflow::stages::StageKind,
};

/// Failure of a metered external call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("external call failed: {detail}")]
    ExternalCallFailure { detail: String, retryable: bool },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("budget exceeded: spent ${spent_usd:.4} of ${cap_usd:.4}")]
    BudgetExceeded { spent_usd: f64, cap_usd: f64 },
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::ExternalCallFailure { retryable, .. } => *retryable,
            CallError::MalformedResponse(_) => true,
            CallError::BudgetExceeded { .. } => false,
        }
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, CallError::BudgetExceeded { .. })
    }
}

impl From<ProviderError> for CallError {
    fn from(err: ProviderError) -> Self {
        let retryable = err.is_retryable();
        CallError::ExternalCallFailure {
            detail: err.to_string(),
            retryable,
        }
    }
}

/// Output of one successful attempt
#[derive(Debug, Clone)]
pub struct ComputedCall {
    pub payload: serde_json::Value,
    pub usage: CallUsage,
}

/// What the caller gets back, whether it came from the cache or the provider
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub payload: serde_json::Value,
    pub cache_hit: bool,
}

#[derive(Debug)]
pub struct CallGateway {
    cache: Arc<CacheStore>,
    ledger: Arc<CostLedger>,
    policy: CallPolicy,
}

impl CallGateway {
    pub fn new(cache: Arc<CacheStore>, ledger: Arc<CostLedger>, policy: CallPolicy) -> Self {
        Self {
            cache,
            ledger,
            policy,
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Open a meter for a new run
    pub fn meter(&self, run_id: Uuid, budget_cap_usd: Option<f64>, use_cache: bool) -> RunMeter {
        RunMeter::new(run_id, self.ledger.clone(), budget_cap_usd, use_cache)
    }

    /// Run `compute` at most once per canonical key (when the run uses the
    /// cache), subject to the run's budget and the retry policy.
    ///
    /// `estimate_usd` is the expected cost of a miss; the budget gate refuses
    /// the call when it would take the run past its cap. Hits are never gated.
    pub async fn call<F, Fut>(
        &self,
        meter: &RunMeter,
        stage: StageKind,
        namespace: Namespace,
        key: &CanonicalKey,
        estimate_usd: f64,
        compute: F,
    ) -> Result<GatewayResponse, CallError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<ComputedCall, CallError>>,
    {
        let compute = &compute;
        let miss = move || async move {
            if meter.would_exceed(estimate_usd) {
                let refusal = budget_error(meter);
                tracing::warn!(
                    "[GATEWAY] {} {} refused: {}",
                    stage.as_str(),
                    namespace,
                    refusal
                );
                return Err(refusal);
            }
            let computed = self.with_retry(stage, namespace, compute).await?;
            Ok::<_, CallError>(CachedValue::new(computed.payload, computed.usage))
        };

        if !meter.use_cache() {
            let value = miss().await?;
            meter.record(stage, &value.usage, false);
            return Ok(GatewayResponse {
                payload: value.payload,
                cache_hit: false,
            });
        }

        let (value, cache_hit) = match self.cache.get_or_compute(namespace, key, miss()).await {
            // A waiter shares the computing run's refusal; judge it against this run's budget
            Err(err) if err.is_budget_exceeded() => {
                if meter.would_exceed(estimate_usd) {
                    return Err(budget_error(meter));
                }
                tracing::debug!(
                    "[GATEWAY] {} {} refused for another run; computing under this run's budget",
                    stage.as_str(),
                    namespace
                );
                self.cache.get_or_compute(namespace, key, miss()).await?
            }
            result => result?,
        };
        if cache_hit {
            meter.record(stage, &CallUsage::default(), true);
        } else {
            meter.record(stage, &value.usage, false);
        }

        Ok(GatewayResponse {
            payload: value.payload.clone(),
            cache_hit,
        })
    }

    async fn with_retry<F, Fut>(
        &self,
        stage: StageKind,
        namespace: Namespace,
        compute: &F,
    ) -> Result<ComputedCall, CallError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<ComputedCall, CallError>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.policy.timeout(), compute()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::ExternalCallFailure {
                    detail: format!("timed out after {}s", self.policy.timeout_secs),
                    retryable: true,
                }),
            };

            match outcome {
                Ok(computed) => return Ok(computed),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        "[GATEWAY] {} {} attempt {}/{} failed: {}; retrying in {:?}",
                        stage.as_str(),
                        namespace,
                        attempt,
                        self.policy.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(CallError::MalformedResponse(detail)) => {
                    tracing::error!(
                        "[GATEWAY] {} {} gave up after {} attempts: malformed response",
                        stage.as_str(),
                        namespace,
                        attempt
                    );
                    return Err(CallError::ExternalCallFailure {
                        detail: format!("malformed response: {}", detail),
                        retryable: false,
                    });
                }
                Err(err) => {
                    tracing::error!(
                        "[GATEWAY] {} {} gave up after {} attempts: {}",
                        stage.as_str(),
                        namespace,
                        attempt,
                        err
                    );
                    return Err(err);
                }
            }
        }
    }
}

fn budget_error(meter: &RunMeter) -> CallError {
    CallError::BudgetExceeded {
        spent_usd: meter.spent_usd(),
        cap_usd: meter.budget_cap_usd().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::*;

    fn gateway(max_attempts: u32) -> CallGateway {
        CallGateway::new(
            Arc::new(CacheStore::with_limits(100, 60)),
            Arc::new(CostLedger::new()),
            CallPolicy {
                timeout_secs: 1,
                max_attempts,
                backoff_base_ms: 10,
            },
        )
    }

    fn ok_call(cost: f64) -> Result<ComputedCall, CallError> {
        Ok(ComputedCall {
            payload: serde_json::json!({ "ok": true }),
            usage: CallUsage::flat(cost),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures_with_backoff() {
        let gateway = gateway(3);
        let meter = gateway.meter(Uuid::new_v4(), None, true);
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let key = CanonicalKey::new().text("query", "retry");

        let response = gateway
            .call(&meter, StageKind::Evidence, Namespace::Search, &key, 0.0, move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CallError::ExternalCallFailure {
                        detail: "503".to_string(),
                        retryable: true,
                    })
                } else {
                    ok_call(0.001)
                }
            })
            .await
            .unwrap();

        assert!(!response.cache_hit);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(meter.stage_totals(StageKind::Evidence).calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_and_bounded() {
        let gateway = gateway(2);
        let meter = gateway.meter(Uuid::new_v4(), None, true);
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let key = CanonicalKey::new().text("query", "slow");

        let err = gateway
            .call(&meter, StageKind::Evidence, Namespace::Search, &key, 0.0, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                ok_call(0.001)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::ExternalCallFailure { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(gateway.cache().peek(Namespace::Search, &key).await.is_none());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_retried() {
        let gateway = gateway(3);
        let meter = gateway.meter(Uuid::new_v4(), None, true);
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let key = CanonicalKey::new().text("query", "auth");

        let err = gateway
            .call(&meter, StageKind::Leads, Namespace::Leads, &key, 0.0, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CallError::ExternalCallFailure {
                    detail: "401".to_string(),
                    retryable: false,
                })
            })
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_surfaces_as_external_failure() {
        let gateway = gateway(2);
        let meter = gateway.meter(Uuid::new_v4(), None, true);
        let key = CanonicalKey::new().text("prompt", "bad json");

        let err = gateway
            .call(&meter, StageKind::Curate, Namespace::Events, &key, 0.0, || async {
                Err(CallError::MalformedResponse("expected object".to_string()))
            })
            .await
            .unwrap_err();

        match err {
            CallError::ExternalCallFailure { detail, .. } => {
                assert!(detail.contains("malformed response"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_budget_gates_misses_but_not_hits() {
        let gateway = gateway(1);
        let meter = gateway.meter(Uuid::new_v4(), Some(0.002), true);
        let cached_key = CanonicalKey::new().text("query", "cached");
        let fresh_key = CanonicalKey::new().text("query", "fresh");

        gateway
            .call(&meter, StageKind::Evidence, Namespace::Search, &cached_key, 0.001, || async {
                ok_call(0.002)
            })
            .await
            .unwrap();

        let err = gateway
            .call(&meter, StageKind::Evidence, Namespace::Search, &fresh_key, 0.001, || async {
                ok_call(0.001)
            })
            .await
            .unwrap_err();
        assert!(err.is_budget_exceeded());

        let hit = gateway
            .call(&meter, StageKind::Evidence, Namespace::Search, &cached_key, 0.001, || async {
                ok_call(0.002)
            })
            .await
            .unwrap();
        assert!(hit.cache_hit);

        let totals = meter.stage_totals(StageKind::Evidence);
        assert_eq!(totals.calls, 1);
        assert_eq!(totals.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_refusal_for_another_run_is_rechecked_against_own_budget() {
        let gateway = Arc::new(gateway(1));
        let key = CanonicalKey::new().text("query", "shared");
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        // Another run holds the key in flight and is then refused by its own cap
        let other = {
            let gateway = gateway.clone();
            let key = key.clone();
            let started = started.clone();
            let release = release.clone();
            tokio::spawn(async move {
                gateway
                    .cache()
                    .get_or_compute(Namespace::Search, &key, async move {
                        started.notify_one();
                        release.notified().await;
                        Err::<CachedValue, _>(CallError::BudgetExceeded {
                            spent_usd: 0.1,
                            cap_usd: 0.1,
                        })
                    })
                    .await
            })
        };
        started.notified().await;

        let waiter = {
            let gateway = gateway.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let meter = gateway.meter(Uuid::new_v4(), Some(1.0), true);
                let response = gateway
                    .call(&meter, StageKind::Evidence, Namespace::Search, &key, 0.001, || async {
                        ok_call(0.001)
                    })
                    .await;
                (response, meter.stage_totals(StageKind::Evidence))
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();

        assert!(other.await.unwrap().unwrap_err().is_budget_exceeded());
        let (response, totals) = waiter.await.unwrap();
        let response = response.unwrap();
        assert!(!response.cache_hit);
        assert_eq!(totals.calls, 1);
        assert!(gateway.cache().peek(Namespace::Search, &key).await.is_some());
    }

    #[tokio::test]
    async fn test_bypassing_the_cache_always_computes() {
        let gateway = gateway(1);
        let meter = gateway.meter(Uuid::new_v4(), None, false);
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let key = CanonicalKey::new().text("query", "nocache");

        for _ in 0..2 {
            let response = gateway
                .call(&meter, StageKind::Evidence, Namespace::Search, &key, 0.0, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ok_call(0.001)
                })
                .await
                .unwrap();
            assert!(!response.cache_hit);
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(gateway.cache().peek(Namespace::Search, &key).await.is_none());
    }
}
