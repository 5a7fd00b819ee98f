//! Drives one target through acquire → fetch → parse → dedupe-store →
//! release, and the on-demand variant that runs that sequence over every
//! registered target.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use reqwest::Client;

use crate::broker::Broker;
use crate::gateway::GatewayPool;
use crate::parser;
use crate::storage::{NewPost, Store};

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of driving the pipeline once for a single target.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FetchOutcome {
    pub target: i64,
    pub new: usize,
    pub error: Option<String>,
    pub instance: Option<String>,
}

/// Aggregate result of an on-demand fetch-all-now run.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAllOutcome {
    pub new_counts_by_target: HashMap<String, usize>,
    pub failed_instances: Vec<FailedInstance>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedInstance {
    pub instance: Option<String>,
    pub error: String,
    pub target: String,
}

fn construct_url(base_url: &str, kind: &str, value: &str) -> String {
    if kind == "user" {
        format!("{base_url}/{value}/rss")
    } else {
        format!("{base_url}/search/rss?f=tweets&q=%23{value}")
    }
}

/// Runs the fetch pipeline for one target row. Never returns an `Err`:
/// all failure modes are reported inside `FetchOutcome`, mirroring the
/// "fatal for this tick, not for the process" handling described for the
/// pipeline's callers.
pub async fn fetch_target(
    store: &Store,
    gateway: &GatewayPool,
    broker: Option<&Broker>,
    http: &Client,
    html_fallback_pattern: &Regex,
    keep_only_last_n_per_target: Option<i64>,
    target_id: i64,
    kind: &str,
    value: &str,
    poll_interval_seconds: i64,
) -> FetchOutcome {
    let lease = match gateway.acquire().await {
        Ok(lease) => lease,
        Err(_) => {
            return FetchOutcome {
                target: target_id,
                new: 0,
                error: Some("no instance available".to_string()),
                instance: None,
            };
        }
    };

    let url = construct_url(&lease.base_url, kind, value);
    let started = Instant::now();
    let response = http
        .get(&url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await;
    let rtt = started.elapsed();

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            gateway.release_error(&lease, &err.to_string()).await;
            return FetchOutcome {
                target: target_id,
                new: 0,
                error: Some(err.to_string()),
                instance: Some(lease.base_url),
            };
        }
    };

    if response.status().as_u16() >= 400 {
        let status = response.status().as_u16();
        gateway
            .release_error(&lease, &format!("HTTP {status}"))
            .await;
        return FetchOutcome {
            target: target_id,
            new: 0,
            error: Some(format!("HTTP {status}")),
            instance: Some(lease.base_url),
        };
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            gateway.release_error(&lease, &err.to_string()).await;
            return FetchOutcome {
                target: target_id,
                new: 0,
                error: Some(err.to_string()),
                instance: Some(lease.base_url),
            };
        }
    };

    let entries = parser::parse_response(&body, &content_type, html_fallback_pattern);

    let target_key = format!("{kind}:{value}");
    let now = Utc::now();
    let mut new_count = 0usize;

    for entry in &entries {
        let created_at = if entry.published.is_empty() {
            now.to_rfc3339()
        } else {
            entry.published.clone()
        };

        let inserted = match store
            .upsert_post(NewPost {
                id: entry.id.clone(),
                target: target_key.clone(),
                content: if !entry.title.is_empty() {
                    entry.title.clone()
                } else {
                    entry.summary.clone()
                },
                created_at: created_at.clone(),
                raw: entry.raw.to_string(),
                fetched_at: now.to_rfc3339(),
                instance: lease.base_url.clone(),
            })
            .await
        {
            Ok(inserted) => inserted,
            Err(err) => {
                tracing::error!(error = %err, target_id, "store failure during fetch");
                continue;
            }
        };

        if inserted {
            new_count += 1;
            if let Some(broker) = broker {
                broker
                    .publish(
                        "new_post",
                        serde_json::json!({
                            "target": target_key,
                            "target_id": target_id,
                            "post_id": entry.id,
                            "created_at": created_at,
                        }),
                    )
                    .await;
            }
        }
    }

    if let Some(max_per_target) = keep_only_last_n_per_target {
        if let Err(err) = store.prune(max_per_target).await {
            tracing::error!(error = %err, "prune failed after fetch");
        }
    }

    let last_fetched_id = entries.first().map(|e| e.id.as_str());
    if let Err(err) = store
        .update_target_fetch_state(target_id, last_fetched_id, now)
        .await
    {
        tracing::error!(error = %err, target_id, "failed to update target fetch state");
    }

    if let Some(broker) = broker {
        broker
            .publish(
                "cooldown",
                serde_json::json!({
                    "target": target_id,
                    "next_run_in": poll_interval_seconds,
                }),
            )
            .await;
    }

    gateway.release_success(&lease, rtt).await;

    FetchOutcome {
        target: target_id,
        new: new_count,
        error: None,
        instance: Some(lease.base_url),
    }
}

/// Drives every registered target through the pipeline once, sequentially,
/// sharing rate-limit and backoff state with the scheduler through the
/// same gateway pool.
pub async fn fetch_all_now(
    store: &Store,
    gateway: &GatewayPool,
    broker: Option<&Broker>,
    http: &Client,
    html_fallback_pattern: &Regex,
    keep_only_last_n_per_target: Option<i64>,
) -> Result<FetchAllOutcome, crate::error::StoreError> {
    let targets = store.get_targets().await?;
    let mut new_counts_by_target = HashMap::new();
    let mut failed_instances = Vec::new();

    for target in targets {
        let outcome = fetch_target(
            store,
            gateway,
            broker,
            http,
            html_fallback_pattern,
            keep_only_last_n_per_target,
            target.id,
            &target.kind,
            &target.value,
            target.poll_interval_seconds,
        )
        .await;

        let key = format!("{}:{}", target.kind, target.value);
        if let Some(error) = outcome.error {
            failed_instances.push(FailedInstance {
                instance: outcome.instance,
                error,
                target: key,
            });
        } else {
            new_counts_by_target.insert(key, outcome.new);
        }
    }

    Ok(FetchAllOutcome {
        new_counts_by_target,
        failed_instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_url_for_user_target() {
        assert_eq!(
            construct_url("https://a.example", "user", "alice"),
            "https://a.example/alice/rss"
        );
    }

    #[test]
    fn construct_url_for_hashtag_target() {
        assert_eq!(
            construct_url("https://a.example", "hashtag", "rustlang"),
            "https://a.example/search/rss?f=tweets&q=%23rustlang"
        );
    }

    async fn test_store() -> Store {
        let conn = common::open_sqlite_connection(":memory:").await.unwrap();
        Store::new(conn).await.unwrap()
    }

    #[tokio::test]
    async fn fetch_target_reports_no_instance_available_when_pool_exhausted() {
        let store = test_store().await;
        let gateway = GatewayPool::new(&["https://a.example".to_string()], 1, 30).unwrap();
        // Exhaust the single token.
        let _lease = gateway.acquire().await.unwrap();

        let http = Client::new();
        let pattern = Regex::new(r"/status/(\d+)").unwrap();

        let outcome = fetch_target(
            &store, &gateway, None, &http, &pattern, None, 1, "user", "alice", 60,
        )
        .await;

        assert_eq!(outcome.error.as_deref(), Some("no instance available"));
        assert_eq!(outcome.new, 0);
        assert!(outcome.instance.is_none());
    }
}
