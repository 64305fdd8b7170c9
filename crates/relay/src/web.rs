use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::signaling::{self, PairingRegistry};
use p2prd_protocol::{RelayRole, WelcomeMessage};

/// Sliding-window accept limiter keyed by remote IP: at most `max_accepts`
/// accepts per `window`. Adapted from the teacher's `LoginRateLimiter`
/// (`examples/frecar-beam/crates/server/src/web.rs`) — same periodic TTL
/// cleanup + hard key-count cap shape, re-keyed from username/IP pairs to
/// bare remote IPs and re-tuned to the relay's 10-per-1s budget (§4.8).
pub struct AcceptRateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_accepts: usize,
    window: Duration,
    max_keys: usize,
    call_count: AtomicU64,
    ttl_cleanup_interval: u64,
}

impl AcceptRateLimiter {
    pub fn new(max_accepts: usize, window: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_accepts,
            window,
            max_keys: 10_000,
            call_count: AtomicU64::new(0),
            ttl_cleanup_interval: 200,
        }
    }

    #[cfg(test)]
    fn with_cleanup_interval(max_accepts: usize, window: Duration, ttl_cleanup_interval: u64) -> Self {
        Self { ttl_cleanup_interval, ..Self::new(max_accepts, window) }
    }

    /// Returns `true` if this accept is allowed, recording it if so.
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().await;

        let calls = self.call_count.fetch_add(1, Ordering::Relaxed);
        if calls % self.ttl_cleanup_interval == 0 || attempts.len() > self.max_keys / 2 {
            let window = self.window;
            attempts.retain(|_, times| {
                times.retain(|t| now.duration_since(*t) < window);
                !times.is_empty()
            });
        }

        if !attempts.contains_key(key) && attempts.len() >= self.max_keys {
            tracing::warn!(key, "rate limiter key cap reached, rejecting defensively");
            return false;
        }

        let times = attempts.entry(key.to_string()).or_default();
        times.retain(|t| now.duration_since(*t) < self.window);

        if times.len() >= self.max_accepts {
            false
        } else {
            times.push(now);
            true
        }
    }

    #[cfg(test)]
    async fn key_count(&self) -> usize {
        self.attempts.lock().await.len()
    }
}

pub struct AppState {
    pub registry: PairingRegistry,
    pub rate_limiter: AcceptRateLimiter,
    pub started_at: Instant,
    pub metrics_accepts: AtomicU64,
    pub metrics_rate_limited: AtomicU64,
}

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub role: RoleParam,
    #[serde(rename = "hostId")]
    pub host_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleParam {
    Host,
    Operator,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RelayQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = addr.ip().to_string();
    if !state.rate_limiter.check(&ip).await {
        state.metrics_rate_limited.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%ip, "rejected: accept rate limit exceeded");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    match query.role {
        RoleParam::Host => {
            state.metrics_accepts.fetch_add(1, Ordering::Relaxed);
            let registry = Arc::clone(&state.registry);
            ws.on_upgrade(move |mut socket| async move {
                let welcome = serde_json::to_string(&WelcomeMessage::new(RelayRole::Host)).unwrap();
                if socket.send(axum::extract::ws::Message::Text(welcome.into())).await.is_err() {
                    return;
                }
                signaling::handle_host_ws(socket, registry).await;
            })
        }
        RoleParam::Operator => {
            let Some(host_id) = query.host_id else {
                return (StatusCode::BAD_REQUEST, "hostId is required for role=operator").into_response();
            };
            state.metrics_accepts.fetch_add(1, Ordering::Relaxed);
            let registry = Arc::clone(&state.registry);
            ws.on_upgrade(move |mut socket| async move {
                let welcome = serde_json::to_string(&WelcomeMessage::new(RelayRole::Operator)).unwrap();
                if socket.send(axum::extract::ws::Message::Text(welcome.into())).await.is_err() {
                    return;
                }
                signaling::handle_operator_ws(socket, host_id, registry).await;
            })
        }
    }
    .into_response()
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let hosts_registered = state.registry.read().await.len();
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "hosts_registered": hosts_registered,
        "accepts_total": state.metrics_accepts.load(Ordering::Relaxed),
        "rate_limited_total": state.metrics_rate_limited.load(Ordering::Relaxed),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_accepts_within_window() {
        let limiter = AcceptRateLimiter::new(10, Duration::from_secs(1));
        for _ in 0..10 {
            assert!(limiter.check("1.2.3.4").await);
        }
    }

    #[tokio::test]
    async fn rejects_the_eleventh_accept_within_the_window() {
        let limiter = AcceptRateLimiter::new(10, Duration::from_secs(1));
        for _ in 0..10 {
            assert!(limiter.check("1.2.3.4").await);
        }
        assert!(!limiter.check("1.2.3.4").await);
    }

    #[tokio::test]
    async fn distinct_ips_do_not_share_a_budget() {
        let limiter = AcceptRateLimiter::new(10, Duration::from_secs(1));
        for _ in 0..10 {
            assert!(limiter.check("1.2.3.4").await);
        }
        assert!(limiter.check("5.6.7.8").await);
    }

    #[tokio::test]
    async fn accepts_resume_after_the_window_elapses() {
        let limiter = AcceptRateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.check("1.2.3.4").await);
        assert!(limiter.check("1.2.3.4").await);
        assert!(!limiter.check("1.2.3.4").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check("1.2.3.4").await);
    }

    #[tokio::test]
    async fn periodic_cleanup_evicts_expired_keys() {
        let limiter = AcceptRateLimiter::with_cleanup_interval(10, Duration::from_millis(10), 1);
        limiter.check("1.2.3.4").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.check("5.6.7.8").await;
        assert_eq!(limiter.key_count().await, 1);
    }

    #[test]
    fn relay_query_parses_operator_role_with_host_id() {
        let host_id = Uuid::new_v4();
        let query = format!("role=operator&hostId={host_id}");
        let parsed: RelayQuery = serde_urlencoded::from_str(&query).unwrap();
        assert_eq!(parsed.role, RoleParam::Operator);
        assert_eq!(parsed.host_id, Some(host_id));
    }

    #[test]
    fn relay_query_parses_host_role_without_host_id() {
        let parsed: RelayQuery = serde_urlencoded::from_str("role=host").unwrap();
        assert_eq!(parsed.role, RoleParam::Host);
        assert_eq!(parsed.host_id, None);
    }
}
