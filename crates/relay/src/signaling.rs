//! Pairs exactly one host connection with any number of operator
//! connections under a shared `host_id`, per spec §4.8.
//!
//! - operator → host: fanned to the single host connection for the
//!   operator's `hostId`; dropped silently if no host is registered.
//! - host → operators: fanned to every operator registered under `host_id`.
//!
//! Single-operator enforcement ("host busy") is NOT done here — the relay is
//! permissive and forwards to every registered operator; the host decides
//! who holds the lease and emits `host_busy` itself (§4.8, §9 Open Question).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

/// Capacity of the operator fan-out broadcast channel. Generous enough to
/// absorb a burst of control/video messages without an operator lagging out
/// under normal conditions; a lagging operator just misses old frames.
const FANOUT_CAPACITY: usize = 64;
/// Capacity of the operator→host forwarding channel.
const TO_HOST_CAPACITY: usize = 64;

struct HostRegistration {
    /// Operator messages queue here; whichever host connection is currently
    /// active drains this. Swapped out whenever a new host connection
    /// installs itself, so operators always look this up fresh rather than
    /// caching a sender.
    to_host: RwLock<mpsc::Sender<Message>>,
    /// Host messages are broadcast here; every operator task subscribes.
    to_operators: broadcast::Sender<Message>,
}

/// Registry of active host pairings, keyed by `host_id`.
pub type PairingRegistry = Arc<RwLock<HashMap<Uuid, Arc<HostRegistration>>>>;

pub fn new_registry() -> PairingRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

async fn get_or_create(registry: &PairingRegistry, host_id: Uuid) -> Arc<HostRegistration> {
    {
        let map = registry.read().await;
        if let Some(reg) = map.get(&host_id) {
            return Arc::clone(reg);
        }
    }
    let mut map = registry.write().await;
    map.entry(host_id)
        .or_insert_with(|| {
            let (placeholder_tx, _placeholder_rx) = mpsc::channel(1);
            let (to_operators, _) = broadcast::channel(FANOUT_CAPACITY);
            Arc::new(HostRegistration { to_host: RwLock::new(placeholder_tx), to_operators })
        })
        .clone()
}

fn extract_host_id(text: &str) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let raw = value.get("host_id")?.as_str()?;
    Uuid::parse_str(raw).ok()
}

/// Handle a `role=host` WebSocket connection. The `host_id` is not known
/// until the first message is parsed (per §4.8), so the connection is only
/// installed into the registry once that message arrives.
pub async fn handle_host_ws(mut socket: WebSocket, registry: PairingRegistry) {
    let Some(Ok(Message::Text(first))) = socket.recv().await else {
        tracing::debug!("host socket closed before sending a message");
        return;
    };

    let Some(host_id) = extract_host_id(&first) else {
        tracing::warn!("host socket's first message did not contain a valid host_id, closing");
        return;
    };

    tracing::info!(%host_id, "host registered");
    let registration = get_or_create(&registry, host_id).await;

    // Install a fresh (sender, receiver) pair and claim the receiver half
    // for this connection. Any previously-active host connection's old
    // sender becomes a dangling channel whose sends simply fail, which is
    // fine: at most one outbound host connection is expected at a time.
    let mut to_host_rx = {
        let (tx, rx) = mpsc::channel(TO_HOST_CAPACITY);
        *registration.to_host.write().await = tx;
        rx
    };

    // Relay the first message to operators, same as any subsequent host
    // message.
    let _ = registration.to_operators.send(Message::Text(first));

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        let _ = registration.to_operators.send(msg);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(%host_id, "host disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%host_id, "host socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            forwarded = to_host_rx.recv() => {
                match forwarded {
                    Some(msg) => {
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

/// Handle a `role=operator&hostId=...` WebSocket connection.
pub async fn handle_operator_ws(mut socket: WebSocket, host_id: Uuid, registry: PairingRegistry) {
    tracing::info!(%host_id, "operator connected");
    let registration = get_or_create(&registry, host_id).await;
    let mut from_host = registration.to_operators.subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        let sender = registration.to_host.read().await.clone();
                        if sender.send(msg).await.is_err() {
                            tracing::debug!(%host_id, "no host listening, dropping operator message");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(%host_id, "operator disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%host_id, "operator socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            result = from_host.recv() => {
                match result {
                    Ok(msg) => {
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(%host_id, skipped = n, "operator lagged behind host fanout");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_host_id_parses_valid_uuid_field() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"type":"host_hello","host_id":"{id}"}}"#);
        assert_eq!(extract_host_id(&text), Some(id));
    }

    #[test]
    fn extract_host_id_rejects_missing_field() {
        assert_eq!(extract_host_id(r#"{"type":"host_hello"}"#), None);
    }

    #[test]
    fn extract_host_id_rejects_non_uuid_string() {
        assert_eq!(extract_host_id(r#"{"host_id":"not-a-uuid"}"#), None);
    }

    #[test]
    fn extract_host_id_rejects_malformed_json() {
        assert_eq!(extract_host_id("not json"), None);
    }

    #[tokio::test]
    async fn get_or_create_returns_same_registration_for_repeated_calls() {
        let registry = new_registry();
        let host_id = Uuid::new_v4();
        let a = get_or_create(&registry, host_id).await;
        let b = get_or_create(&registry, host_id).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_host_ids_get_distinct_registrations() {
        let registry = new_registry();
        let a = get_or_create(&registry, Uuid::new_v4()).await;
        let b = get_or_create(&registry, Uuid::new_v4()).await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn host_to_operator_fanout_reaches_multiple_subscribers() {
        let registry = new_registry();
        let host_id = Uuid::new_v4();
        let registration = get_or_create(&registry, host_id).await;
        let mut sub_a = registration.to_operators.subscribe();
        let mut sub_b = registration.to_operators.subscribe();
        registration.to_operators.send(Message::Text("hello".into())).unwrap();
        assert_eq!(sub_a.recv().await.unwrap(), Message::Text("hello".into()));
        assert_eq!(sub_b.recv().await.unwrap(), Message::Text("hello".into()));
    }

    #[tokio::test]
    async fn operator_to_host_forwarding_drops_silently_with_no_host() {
        let registry = new_registry();
        let host_id = Uuid::new_v4();
        let registration = get_or_create(&registry, host_id).await;
        let sender = registration.to_host.read().await.clone();
        // No receiver was ever installed (no host connected), so the send
        // fails — callers must treat this as a silent drop, not a panic.
        assert!(sender.send(Message::Text("input".into())).await.is_err());
    }
}
