//! Resolver Loop (§4.7). Grounded on the teacher's `run_signaling` reconnect
//! shape for the backoff mechanics, generalized to the spec's own numbers
//! (5 min default interval, 5 s initial failure backoff doubling to 5 min —
//! `DESIGN.md`'s Open Question resolution #6, which are given directly by
//! the spec rather than inherited). `reqwest` is the teacher-pack's outbound
//! HTTP client of choice (grounded on `zortos293-GFNClient`'s
//! `reqwest`+`rustls-tls` stack, noted in the root `Cargo.toml`).
//!
//! Pushes the resolved endpoint into a `watch` channel consumed by the
//! Signaling Client; a `send_if_modified` means the watch only wakes that
//! consumer when the endpoint actually changes, while this loop's own
//! periodic re-fetch and failure backoff are independent of that.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

const SUCCESS_INTERVAL: Duration = Duration::from_secs(5 * 60);
const INITIAL_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Deserialize)]
struct ResolverResponse {
    url: String,
}

pub async fn run_resolver_loop(
    resolver_url: String,
    target_tx: watch::Sender<String>,
    client: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_FAILURE_BACKOFF;

    while !*shutdown.borrow() {
        let resolved = if resolver_url.starts_with("ws://") || resolver_url.starts_with("wss://") {
            Ok(resolver_url.clone())
        } else {
            fetch(&client, &resolver_url).await
        };

        let wait = match resolved {
            Ok(url) => {
                if target_tx.send_if_modified(|current| {
                    if *current != url {
                        *current = url.clone();
                        true
                    } else {
                        false
                    }
                }) {
                    info!(url, "resolver selected signaling endpoint");
                }
                backoff = INITIAL_FAILURE_BACKOFF;
                SUCCESS_INTERVAL
            }
            Err(e) => {
                warn!(error = %e, resolver_url, backoff = ?backoff, "resolver fetch failed, retrying after backoff");
                let wait = backoff;
                backoff = (backoff * 2).min(MAX_FAILURE_BACKOFF);
                wait
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = client.get(url).send().await?.error_for_status()?;
    let body: ResolverResponse = response.json().await?;
    Ok(body.url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_backoff_sequence_is_non_decreasing_and_bounded() {
        let mut backoff = INITIAL_FAILURE_BACKOFF;
        let mut sequence = vec![backoff];
        for _ in 0..10 {
            backoff = (backoff * 2).min(MAX_FAILURE_BACKOFF);
            sequence.push(backoff);
        }
        assert!(sequence.windows(2).all(|w| w[1] >= w[0]));
        assert!(sequence.iter().all(|d| *d <= MAX_FAILURE_BACKOFF));
    }

    #[test]
    fn ws_scheme_resolver_url_bypasses_http() {
        let url = "wss://relay.example/ws".to_string();
        assert!(url.starts_with("ws://") || url.starts_with("wss://"));
    }
}
