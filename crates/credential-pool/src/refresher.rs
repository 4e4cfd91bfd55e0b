//! Token Refresher: per-`uuid` in-flight request deduplication over an
//! injected `Refresher` collaborator (invariant #5 — at most one in-flight
//! refresh per uuid per process; concurrent callers await the same
//! result).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::collab::{RefreshOutcome, Refresher};

pub struct TokenRefresher {
    collaborator: Arc<dyn Refresher>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<RefreshOutcome>>>>,
    provider_name: &'static str,
}

impl TokenRefresher {
    pub fn new(collaborator: Arc<dyn Refresher>, provider_name: &'static str) -> Self {
        Self {
            collaborator,
            in_flight: Mutex::new(HashMap::new()),
            provider_name,
        }
    }

    /// Refresh `uuid`'s token. Transport errors and empty input both yield
    /// `Err`; only empty input is permanent (§4.4).
    pub async fn refresh(&self, uuid: &str, refresh_token: &str) -> RefreshOutcome {
        if refresh_token.is_empty() {
            self.record_outcome("empty_token");
            return RefreshOutcome::Err {
                permanent: true,
                status: None,
            };
        }

        if let Some(outcome) = self.join_in_flight(uuid).await {
            return outcome;
        }

        let (tx, rx) = watch::channel(None);
        {
            let mut map = self.in_flight.lock().await;
            if let Some(existing) = map.get(uuid) {
                let existing = existing.clone();
                drop(map);
                return wait_for(existing).await;
            }
            map.insert(uuid.to_string(), rx);
        }

        let outcome = self.collaborator.refresh(refresh_token).await;
        self.record_outcome(match &outcome {
            RefreshOutcome::Ok(_) => "ok",
            RefreshOutcome::Err { permanent: true, .. } => "permanent_error",
            RefreshOutcome::Err { permanent: false, .. } => "transient_error",
        });
        let _ = tx.send(Some(outcome.clone()));
        self.in_flight.lock().await.remove(uuid);
        outcome
    }

    fn record_outcome(&self, outcome: &'static str) {
        metrics::counter!(
            "credential_pool_refresh_outcomes_total",
            "provider" => self.provider_name,
            "outcome" => outcome,
        )
        .increment(1);
    }

    async fn join_in_flight(&self, uuid: &str) -> Option<RefreshOutcome> {
        let rx = {
            let map = self.in_flight.lock().await;
            map.get(uuid).cloned()
        }?;
        Some(wait_for(rx).await)
    }
}

async fn wait_for(mut rx: watch::Receiver<Option<RefreshOutcome>>) -> RefreshOutcome {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without ever sending: treat as a transient
            // transport failure rather than panicking the waiter.
            return RefreshOutcome::Err {
                permanent: false,
                status: None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::RefreshPatch;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: Arc<AtomicUsize>,
        delay: tokio::time::Duration,
    }

    impl Refresher for CountingRefresher {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                RefreshOutcome::Ok(RefreshPatch {
                    access_token: "at".into(),
                    expires_at: 0,
                    ..Default::default()
                })
            })
        }
    }

    #[tokio::test]
    async fn empty_refresh_token_is_permanent_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collaborator = Arc::new(CountingRefresher {
            calls: calls.clone(),
            delay: tokio::time::Duration::ZERO,
        });
        let refresher = TokenRefresher::new(collaborator, "Test");

        let outcome = refresher.refresh("u1", "").await;
        assert_eq!(
            outcome,
            RefreshOutcome::Err {
                permanent: true,
                status: None
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_for_same_uuid_dedup_to_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collaborator = Arc::new(CountingRefresher {
            calls: calls.clone(),
            delay: tokio::time::Duration::from_millis(50),
        });
        let refresher = Arc::new(TokenRefresher::new(collaborator, "Test"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let refresher = refresher.clone();
            handles.push(tokio::spawn(
                async move { refresher.refresh("u1", "rt").await },
            ));
        }

        let mut outcomes = Vec::new();
        for h in handles {
            outcomes.push(h.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for outcome in &outcomes {
            assert_eq!(outcome, &outcomes[0]);
        }
    }

    #[tokio::test]
    async fn distinct_uuids_refresh_independently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collaborator = Arc::new(CountingRefresher {
            calls: calls.clone(),
            delay: tokio::time::Duration::ZERO,
        });
        let refresher = TokenRefresher::new(collaborator, "Test");

        refresher.refresh("u1", "rt1").await;
        refresher.refresh("u2", "rt2").await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_refreshes_for_same_uuid_each_call_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collaborator = Arc::new(CountingRefresher {
            calls: calls.clone(),
            delay: tokio::time::Duration::ZERO,
        });
        let refresher = TokenRefresher::new(collaborator, "Test");

        refresher.refresh("u1", "rt").await;
        refresher.refresh("u1", "rt").await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_records_outcome_metric() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let collaborator = Arc::new(CountingRefresher {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: tokio::time::Duration::ZERO,
        });
        let refresher = TokenRefresher::new(collaborator, "Test");

        refresher.refresh("u1", "rt").await;
        refresher.refresh("u2", "").await;

        let output = handle.render();
        assert!(output.contains("credential_pool_refresh_outcomes_total"));
        assert!(output.contains("provider=\"Test\""));
        assert!(output.contains("outcome=\"ok\""));
        assert!(output.contains("outcome=\"empty_token\""));
    }
}
