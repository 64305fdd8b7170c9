//! Signaling Client (§4.7). Grounded on
//! `examples/frecar-beam/crates/agent/src/signaling.rs::run_signaling`'s
//! outer reconnect loop — same exponential backoff shape (2s initial,
//! doubling, capped at 60s per `DESIGN.md`'s Open Question resolution #5).
//! Simplified relative to the teacher in one way: the teacher's
//! `build_tls_connector` pins an optional operator-supplied certificate via
//! `rustls_pemfile`; that crate isn't part of this workspace's dependency
//! set, so TLS here relies solely on `tokio-tungstenite`'s
//! `rustls-tls-native-roots` feature (native root store only, no pinning).
//!
//! The target URL is a `watch` channel rather than a single `connect(uri)`
//! call so the Resolver Loop can push a new endpoint at any time; a change
//! or a dropped socket both drive the same reconnect path.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Runs until `shutdown` observes `true`. `target_rx` carries the current
/// signaling endpoint (empty string = "no endpoint yet", sleep without
/// connecting). `inbound_tx` receives each complete text message as raw
/// bytes; `outbound_rx` drains messages to send. `disconnected_tx` is
/// notified once per connection loss (including a graceful remote close).
pub async fn run_signaling_client(
    mut target_rx: watch::Receiver<String>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    disconnected_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    while !*shutdown.borrow() {
        let uri = target_rx.borrow().clone();
        if uri.is_empty() {
            tokio::select! {
                _ = target_rx.changed() => continue,
                _ = shutdown.changed() => break,
            }
        }

        match connect_and_handle(&uri, &mut outbound_rx, &inbound_tx, &mut target_rx, &mut shutdown).await {
            Ok(()) => {
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!(error = %e, uri, "signaling connection failed");
            }
        }

        let _ = disconnected_tx.send(()).await;
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect_and_handle(
    uri: &str,
    outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
    inbound_tx: &mpsc::Sender<Vec<u8>>,
    target_rx: &mut watch::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(uri, "connecting to signaling relay");
    let (ws_stream, _) = tokio_tungstenite::connect_async(uri).await?;
    let (mut ws_tx, mut ws_rx) = futures_util::StreamExt::split(ws_stream);
    use futures_util::{SinkExt, StreamExt};

    info!(uri, "signaling connection established");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound_tx.send(text.as_bytes().to_vec()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = inbound_tx.send(data.to_vec()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("signaling socket closed by peer");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            return Err(e.into());
                        }
                    }
                    None => return Ok(()),
                }
            }
            _ = target_rx.changed() => {
                info!("resolver selected a new endpoint, reconnecting");
                return Ok(());
            }
            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        let mut backoff = INITIAL_BACKOFF;
        let mut sequence = vec![backoff];
        for _ in 0..8 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
            sequence.push(backoff);
        }
        assert_eq!(sequence.first(), Some(&Duration::from_secs(2)));
        assert!(sequence.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*sequence.last().unwrap(), MAX_BACKOFF);
    }
}
