use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agentmesh::agentmesh::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use agentmesh::{Completion, CompletionRequest, ModelProvider};

/// A provider whose every call fails with a network-classified error.
struct DownProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl ModelProvider for DownProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<Completion, Box<dyn Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("network is unreachable".into())
    }

    fn model_name(&self) -> &str {
        "down"
    }
}

#[tokio::test]
async fn circuit_opens_on_model_failures_and_probes_after_timeout() {
    let provider = Arc::new(DownProvider {
        calls: AtomicUsize::new(0),
    });
    let breaker = CircuitBreaker::new(
        "model-provider",
        CircuitBreakerConfig::default()
            .with_max_failures(5)
            .with_timeout(Duration::from_millis(50)),
    );

    // Five network-classified failures open the breaker.
    for _ in 0..5 {
        let result = breaker
            .execute(|| async {
                provider
                    .complete(CompletionRequest::new("sys", "plan this"))
                    .await
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 5);

    // The next call is rejected without reaching the provider.
    let err = breaker
        .execute(|| async {
            provider
                .complete(CompletionRequest::new("sys", "plan this"))
                .await
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("circuit breaker is open"));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    assert_eq!(breaker.metrics().rejected_calls, 1);

    // After the open period, the next call is admitted as a half-open
    // probe (and its failure reopens the breaker).
    tokio::time::sleep(Duration::from_millis(80)).await;
    let _ = breaker
        .execute(|| async {
            provider
                .complete(CompletionRequest::new("sys", "plan this"))
                .await
        })
        .await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn force_transitions_round_trip_through_metrics() {
    let breaker = CircuitBreaker::new("forced", CircuitBreakerConfig::default());
    let before = breaker.metrics().state_changes;

    breaker.force_open();
    breaker.force_close();

    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.state_changes, before + 2);
}
