//! The long-lived worker that decides which targets are due and drives
//! the fetch pipeline for each of them, once per five-second quantum.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use tokio::sync::{Mutex, Notify};

use crate::broker::Broker;
use crate::gateway::GatewayPool;
use crate::pipeline;
use crate::storage::{Store, Target};

const SCHEDULING_QUANTUM: Duration = Duration::from_secs(5);

/// Returns `true` if `target` should be fetched this cycle: never fetched,
/// or its last fetch is at least `poll_interval_seconds` old. A malformed
/// `last_fetched_at` timestamp counts as due.
pub fn is_due(target: &Target, now: DateTime<Utc>) -> bool {
    let Some(last_fetched_at) = target.last_fetched_at.as_deref() else {
        return true;
    };
    if last_fetched_at.is_empty() {
        return true;
    }
    match DateTime::parse_from_rfc3339(last_fetched_at) {
        Ok(last) => {
            let elapsed = now.signed_duration_since(last.with_timezone(&Utc));
            elapsed.num_seconds() >= target.poll_interval_seconds
        }
        Err(_) => true,
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    gateway: Arc<GatewayPool>,
    broker: Option<Arc<Broker>>,
    http: Client,
    html_fallback_pattern: Regex,
    keep_only_last_n_per_target: Option<i64>,
    pub queue_size: Arc<AtomicUsize>,
    pub last_run: Arc<Mutex<Option<DateTime<Utc>>>>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<GatewayPool>,
        broker: Option<Arc<Broker>>,
        http: Client,
        html_fallback_pattern: Regex,
        keep_only_last_n_per_target: Option<i64>,
    ) -> Self {
        Scheduler {
            store,
            gateway,
            broker,
            http,
            html_fallback_pattern,
            keep_only_last_n_per_target,
            queue_size: Arc::new(AtomicUsize::new(0)),
            last_run: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs cycles until `shutdown` is notified. Each cycle is checked for
    /// the stop signal at its top boundary so an in-flight fetch always
    /// completes before exiting.
    pub async fn run(&self) {
        loop {
            let shutdown = self.shutdown.notified();
            tokio::select! {
                _ = shutdown => {
                    tracing::info!("scheduler received shutdown signal");
                    break;
                }
                _ = self.run_cycle() => {}
            }
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("scheduler received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(SCHEDULING_QUANTUM) => {}
            }
        }
    }

    async fn run_cycle(&self) {
        let targets = match self.store.get_targets().await {
            Ok(targets) => targets,
            Err(err) => {
                tracing::error!(error = %err, "scheduler failed to snapshot targets");
                if let Some(broker) = &self.broker {
                    broker
                        .publish("error", serde_json::json!({"message": err.to_string()}))
                        .await;
                }
                return;
            }
        };

        let now = Utc::now();
        for target in targets {
            if !is_due(&target, now) {
                continue;
            }

            self.queue_size.fetch_add(1, Ordering::SeqCst);
            if let Some(broker) = &self.broker {
                broker
                    .publish(
                        "tick",
                        serde_json::json!({
                            "target": format!("{}:{}", target.kind, target.value),
                            "target_id": target.id,
                            "scheduled_at": now.to_rfc3339(),
                        }),
                    )
                    .await;
            }

            let outcome = pipeline::fetch_target(
                &self.store,
                &self.gateway,
                self.broker.as_deref(),
                &self.http,
                &self.html_fallback_pattern,
                self.keep_only_last_n_per_target,
                target.id,
                &target.kind,
                &target.value,
                target.poll_interval_seconds,
            )
            .await;

            if let Some(error) = &outcome.error {
                tracing::warn!(target_id = target.id, error, "fetch failed this cycle");
            }

            self.queue_size.fetch_sub(1, Ordering::SeqCst);
        }

        *self.last_run.lock().await = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(poll_interval_seconds: i64, last_fetched_at: Option<&str>) -> Target {
        Target {
            id: 1,
            kind: "user".to_string(),
            value: "alice".to_string(),
            poll_interval_seconds,
            last_fetched_id: None,
            last_fetched_at: last_fetched_at.map(|s| s.to_string()),
        }
    }

    #[test]
    fn never_fetched_target_is_due() {
        assert!(is_due(&target(60, None), Utc::now()));
    }

    #[test]
    fn target_is_due_once_interval_elapses() {
        let last = Utc::now() - chrono::Duration::seconds(61);
        let t = target(60, Some(&last.to_rfc3339()));
        assert!(is_due(&t, Utc::now()));
    }

    #[test]
    fn target_is_not_due_before_interval_elapses() {
        let last = Utc::now() - chrono::Duration::seconds(10);
        let t = target(60, Some(&last.to_rfc3339()));
        assert!(!is_due(&t, Utc::now()));
    }

    #[test]
    fn malformed_timestamp_counts_as_due() {
        let t = target(60, Some("not-a-timestamp"));
        assert!(is_due(&t, Utc::now()));
    }
}
