use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// What the user is doing on their machine right now.
#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub app: String,
    pub title: String,
    /// Continuous duration. The monitor rewrites this with the cross-tick
    /// streak; `window_seconds` keeps the raw lookback-window figure.
    pub duration_seconds: f64,
    pub window_seconds: f64,
    pub last_seen: Option<String>,
}

/// Activity collaborator: window focus and AFK state.
///
/// The shipped implementation talks to an ActivityWatch server; tests and
/// headless deployments can plug in anything else.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Dominant continuous activity in the lookback window, or `None` when
    /// the watcher has nothing (machine off, watcher down, user away).
    async fn current_activity(&self, lookback_minutes: u64) -> Option<ActivitySnapshot>;

    /// Whether the user appears away from keyboard for the window.
    async fn is_afk(&self, lookback_minutes: u64) -> bool;
}

/// ActivityWatch REST client (default endpoint `http://localhost:5600`).
pub struct ActivityWatchClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct AwEvent {
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    data: Value,
}

impl ActivityWatchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn bucket_ids(&self) -> Vec<String> {
        let url = format!("{}/api/0/buckets/", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => match resp.json::<serde_json::Map<String, Value>>().await {
                Ok(buckets) => buckets.keys().cloned().collect(),
                Err(e) => {
                    debug!(error = %e, "failed to parse bucket list");
                    Vec::new()
                }
            },
            Err(e) => {
                debug!(error = %e, "activitywatch unreachable");
                Vec::new()
            }
        }
    }

    async fn events(&self, bucket: &str, lookback_minutes: u64) -> Vec<AwEvent> {
        let end = Utc::now();
        let start = end - Duration::minutes(lookback_minutes as i64);
        let url = format!(
            "{}/api/0/buckets/{}/events?start={}&end={}&limit=200",
            self.base_url,
            bucket,
            start.to_rfc3339(),
            end.to_rfc3339(),
        );
        match self.client.get(&url).send().await {
            Ok(resp) => resp.json::<Vec<AwEvent>>().await.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, bucket, "failed to fetch events");
                Vec::new()
            }
        }
    }

    async fn find_bucket(&self, prefix: &str) -> Option<String> {
        self.bucket_ids()
            .await
            .into_iter()
            .find(|id| id.starts_with(prefix))
    }
}

#[async_trait]
impl ActivitySource for ActivityWatchClient {
    async fn current_activity(&self, lookback_minutes: u64) -> Option<ActivitySnapshot> {
        let bucket = self.find_bucket("aw-watcher-window").await?;
        let events = self.events(&bucket, lookback_minutes).await;
        if events.is_empty() {
            return None;
        }

        // Accumulate per (app, title), keep the dominant one.
        let mut totals: std::collections::HashMap<(String, String), (f64, String)> =
            std::collections::HashMap::new();
        for event in &events {
            let app = event
                .data
                .get("app")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let title = event
                .data
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if app.is_empty() && title.is_empty() {
                continue;
            }
            let entry = totals
                .entry((app, title))
                .or_insert((0.0, event.timestamp.clone()));
            entry.0 += event.duration;
            if event.timestamp > entry.1 {
                entry.1 = event.timestamp.clone();
            }
        }

        totals
            .into_iter()
            .max_by(|a, b| a.1 .0.total_cmp(&b.1 .0))
            .map(|((app, title), (duration, last_seen))| ActivitySnapshot {
                app,
                title,
                duration_seconds: duration,
                window_seconds: duration,
                last_seen: Some(last_seen),
            })
    }

    async fn is_afk(&self, lookback_minutes: u64) -> bool {
        let Some(bucket) = self.find_bucket("aw-watcher-afk").await else {
            return false;
        };
        let events = self.events(&bucket, lookback_minutes).await;
        let Some(latest) = events.iter().max_by(|a, b| a.timestamp.cmp(&b.timestamp)) else {
            return false;
        };
        latest
            .data
            .get("status")
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == "afk")
    }
}
