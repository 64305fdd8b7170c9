//! Session Orchestrator (§4.1), the heart of the host process. Per §9's
//! "re-architect as explicit message passing": the teacher's equivalent
//! wiring in `examples/frecar-beam/crates/agent/main.rs` dispatches via
//! per-event callback closures that call back into the WebRTC peer and the
//! signaling outbox directly, forming a cycle between the two. Here, every
//! `on_*` handler is a pure state transition that returns a list of
//! [`Effect`]s; the caller (the binary's top-level `select!` loop) is the
//! only thing that actually touches WebRTC/signaling/capture, so the
//! orchestrator itself has no I/O and is fully unit-testable.

use p2prd_protocol::{AuthStatus, InputEvent, MonitorDescriptor, Rect, SignalingMessage};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::verify_password;
use crate::config_store::{ConfigStore, LockoutEngine};
use crate::monitor::MonitorRegistry;
use crate::webrtc::{DataChannelKind, IceConnState};

const REOFFER_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(5);
/// Used only if a lease's `monitor_id` no longer resolves in the registry
/// (e.g. a display was unplugged mid-session); keeps the frame loop fed
/// rather than stalling it entirely.
const FALLBACK_BOUNDS: Rect = Rect { left: 0, top: 0, width: 1920, height: 1080 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    NoSession,
    Unauthenticated,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: Uuid,
    pub authenticated: bool,
    pub monitor_id: String,
}

/// A side effect the orchestrator wants performed. None of these touch I/O
/// themselves — the binary's wiring loop applies them to the real WebRTC
/// core, signaling client, and input backend.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send on the WebRTC control channel if open, else fall back to the
    /// signaling WebSocket (§4.1's transport-selection rule).
    Reply(SignalingMessage),
    StartOffer,
    ResetTransport,
    StartFrameLoop { bounds: Rect },
    StopFrameLoop,
    /// The authenticated lease switched monitors; the frame loop should
    /// re-target `bounds` and emit a fresh keyframe.
    FrameLoopMonitorChanged { bounds: Rect },
    ApplyInput { event: InputEvent, monitor_id: String },
}

struct Internal {
    state: OrchestratorState,
    lease: Option<SessionLease>,
    last_offer_at: Option<Instant>,
}

pub struct Orchestrator {
    host_id: Uuid,
    config: std::sync::Arc<ConfigStore>,
    lockout: std::sync::Arc<LockoutEngine>,
    monitors: Mutex<MonitorRegistry>,
    internal: Mutex<Internal>,
}

impl Orchestrator {
    pub fn new(host_id: Uuid, config: std::sync::Arc<ConfigStore>, lockout: std::sync::Arc<LockoutEngine>, monitors: MonitorRegistry) -> Self {
        Self {
            host_id,
            config,
            lockout,
            monitors: Mutex::new(monitors),
            internal: Mutex::new(Internal { state: OrchestratorState::NoSession, lease: None, last_offer_at: None }),
        }
    }

    pub async fn state(&self) -> OrchestratorState {
        self.internal.lock().await.state
    }

    pub async fn lease(&self) -> Option<SessionLease> {
        self.internal.lock().await.lease.clone()
    }

    /// Entry point for messages arriving over the signaling WebSocket.
    pub async fn on_signaling_message(&self, raw: &[u8]) -> Vec<Effect> {
        self.handle_raw(raw).await
    }

    /// Entry point for messages arriving over the WebRTC control channel.
    /// Same wire format, same dispatch — only the transport differs.
    pub async fn on_control_channel_message(&self, raw: &[u8]) -> Vec<Effect> {
        self.handle_raw(raw).await
    }

    async fn handle_raw(&self, raw: &[u8]) -> Vec<Effect> {
        match serde_json::from_slice::<SignalingMessage>(raw) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                warn!(error = %e, "dropping malformed signaling message");
                Vec::new()
            }
        }
    }

    async fn handle(&self, msg: SignalingMessage) -> Vec<Effect> {
        match msg {
            SignalingMessage::OperatorHello { session_id } => self.on_operator_hello(session_id).await,
            SignalingMessage::Auth { password } => self.on_auth(&password).await,
            SignalingMessage::MonitorListRequest { .. } => self.on_monitor_list_request().await,
            SignalingMessage::MonitorSwitch { id } => self.on_monitor_switch(&id).await,
            SignalingMessage::Input { event } => self.on_input(event).await,
            other => {
                debug!(?other, "message has no orchestrator-side handler (operator-originated reply type or unsupported)");
                Vec::new()
            }
        }
    }

    async fn on_operator_hello(&self, session_id: Uuid) -> Vec<Effect> {
        let mut internal = self.internal.lock().await;
        match &internal.lease {
            None => {
                let monitor_id = self.monitors.lock().await.active_id().to_string();
                internal.lease = Some(SessionLease { session_id, authenticated: false, monitor_id });
                internal.state = OrchestratorState::Unauthenticated;
                drop(internal);
                info!(%session_id, "lease acquired");
                let mut effects = self.hello_effects().await;
                effects.push(Effect::StartOffer);
                effects
            }
            Some(lease) if lease.session_id == session_id => {
                drop(internal);
                self.hello_effects().await
            }
            Some(_) => {
                drop(internal);
                warn!(%session_id, "rejecting operator_hello: a session is already active");
                vec![Effect::Reply(SignalingMessage::HostBusy { reason: "active_session".to_string() })]
            }
        }
    }

    async fn hello_effects(&self) -> Vec<Effect> {
        let registry = self.monitors.lock().await;
        let monitors = registry.monitors().to_vec();
        let active_monitor_id = registry.active_id().to_string();
        vec![
            Effect::Reply(SignalingMessage::HostHello { host_id: self.host_id, monitors: monitors.clone(), active_monitor_id: active_monitor_id.clone() }),
            Effect::Reply(SignalingMessage::MonitorList { monitors, active_monitor_id }),
        ]
    }

    async fn on_auth(&self, password: &str) -> Vec<Effect> {
        {
            let internal = self.internal.lock().await;
            if internal.lease.is_none() {
                debug!("dropping auth with no active lease");
                return Vec::new();
            }
        }

        match self.lockout.is_locked().await {
            Ok(Some(retry_after_ms)) => {
                return vec![Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Locked, retry_after_ms: Some(retry_after_ms) })];
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "lockout check failed");
                return vec![Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Invalid, retry_after_ms: None })];
            }
        }

        let stored_hash = self.config.snapshot().await.password_hash;
        let verified = !stored_hash.is_empty() && verify_password(password, &stored_hash).unwrap_or(false);

        if verified {
            if let Err(e) = self.lockout.register_success().await {
                warn!(error = %e, "failed to persist lockout reset");
            }
            let monitor_id = {
                let mut internal = self.internal.lock().await;
                if let Some(lease) = internal.lease.as_mut() {
                    lease.authenticated = true;
                }
                internal.state = OrchestratorState::Authenticated;
                internal.lease.as_ref().map(|l| l.monitor_id.clone()).unwrap_or_default()
            };
            info!("authentication succeeded");
            let bounds = self.monitor_bounds(&monitor_id).await.unwrap_or(FALLBACK_BOUNDS);
            vec![
                Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Ok, retry_after_ms: None }),
                Effect::StartFrameLoop { bounds },
            ]
        } else {
            if let Err(e) = self.lockout.register_failure().await {
                warn!(error = %e, "failed to persist lockout failure");
            }
            info!("authentication failed");
            vec![Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Invalid, retry_after_ms: None })]
        }
    }

    async fn on_monitor_list_request(&self) -> Vec<Effect> {
        if self.state().await != OrchestratorState::Authenticated {
            return Vec::new();
        }
        let registry = self.monitors.lock().await;
        vec![Effect::Reply(SignalingMessage::MonitorList { monitors: registry.monitors().to_vec(), active_monitor_id: registry.active_id().to_string() })]
    }

    async fn on_monitor_switch(&self, id: &str) -> Vec<Effect> {
        if self.state().await != OrchestratorState::Authenticated {
            return Vec::new();
        }
        let (active_monitor_id, bounds) = {
            let mut registry = self.monitors.lock().await;
            registry.switch(id);
            let active_monitor_id = registry.active_id().to_string();
            let bounds = registry.active().map(|m| m.bounds).unwrap_or(FALLBACK_BOUNDS);
            (active_monitor_id, bounds)
        };
        {
            let mut internal = self.internal.lock().await;
            if let Some(lease) = internal.lease.as_mut() {
                lease.monitor_id = active_monitor_id.clone();
            }
        }
        vec![
            Effect::Reply(SignalingMessage::MonitorSwitchResult { active_monitor_id }),
            Effect::FrameLoopMonitorChanged { bounds },
        ]
    }

    /// Resolve a monitor id to its current bounds, for handing off to the
    /// frame loop without exposing the registry itself to the caller.
    async fn monitor_bounds(&self, id: &str) -> Option<Rect> {
        self.monitors.lock().await.monitors().iter().find(|m| m.id == id).map(|m| m.bounds)
    }

    /// Resolve a monitor id to its full descriptor (bounds + DPI scale), for
    /// the wiring loop to map `Effect::ApplyInput`'s normalized coordinates
    /// against without duplicating the monitor registry outside this type.
    pub async fn monitor_descriptor(&self, id: &str) -> Option<MonitorDescriptor> {
        self.monitors.lock().await.monitors().iter().find(|m| m.id == id).cloned()
    }

    /// Forward WebRTC negotiation replies (`sdp_answer`, `ice_candidate`)
    /// from the operator straight to the transport. These never touch
    /// session state, so they bypass `handle()`'s dispatch entirely; the
    /// wiring loop calls this after peeling them off the inbound stream.
    pub fn is_webrtc_negotiation(msg: &SignalingMessage) -> bool {
        matches!(msg, SignalingMessage::SdpAnswer { .. } | SignalingMessage::IceCandidate { .. })
    }

    async fn on_input(&self, event: InputEvent) -> Vec<Effect> {
        let internal = self.internal.lock().await;
        if internal.state != OrchestratorState::Authenticated {
            debug!("dropping input received while not authenticated");
            return Vec::new();
        }
        let monitor_id = internal.lease.as_ref().map(|l| l.monitor_id.clone()).unwrap_or_default();
        vec![Effect::ApplyInput { event, monitor_id }]
    }

    /// §4.1 "Any state → on signaling socket drop": release the lease, stop
    /// the frame loop, reset WebRTC, return to `NoSession`. Per the lease
    /// safety testable property, no input/monitor_switch is honored again
    /// until a fresh `operator_hello` re-establishes the lease.
    pub async fn on_signaling_drop(&self) -> Vec<Effect> {
        let mut internal = self.internal.lock().await;
        internal.lease = None;
        internal.state = OrchestratorState::NoSession;
        internal.last_offer_at = None;
        info!("signaling socket dropped, lease released");
        vec![Effect::StopFrameLoop, Effect::ResetTransport]
    }

    pub async fn on_channel_open(&self, kind: DataChannelKind) -> Vec<Effect> {
        info!(?kind, "data channel opened");
        Vec::new()
    }

    pub async fn on_channel_close(&self, kind: DataChannelKind) -> Vec<Effect> {
        info!(?kind, "data channel closed");
        Vec::new()
    }

    /// §4.1's re-offer policy: only while a lease is held, only on a
    /// recoverable ICE state, and at most once per [`REOFFER_DEBOUNCE`].
    pub async fn on_ice_state_change(&self, state: IceConnState) -> Vec<Effect> {
        let recoverable = matches!(state, IceConnState::Failed | IceConnState::Disconnected | IceConnState::Closed);
        if !recoverable {
            return vec![Effect::Reply(SignalingMessage::IceState { state: ice_state_label(state).to_string() })];
        }

        let mut internal = self.internal.lock().await;
        if internal.lease.is_none() {
            return Vec::new();
        }

        let now = Instant::now();
        let should_reoffer = match internal.last_offer_at {
            None => true,
            Some(last) => now.duration_since(last) >= REOFFER_DEBOUNCE,
        };

        if should_reoffer {
            internal.last_offer_at = Some(now);
            drop(internal);
            warn!(?state, "ICE recoverable state observed, re-offering");
            vec![Effect::Reply(SignalingMessage::IceState { state: ice_state_label(state).to_string() }), Effect::StartOffer]
        } else {
            vec![Effect::Reply(SignalingMessage::IceState { state: ice_state_label(state).to_string() })]
        }
    }
}

fn ice_state_label(state: IceConnState) -> &'static str {
    match state {
        IceConnState::New => "new",
        IceConnState::Checking => "checking",
        IceConnState::Connected => "connected",
        IceConnState::Completed => "completed",
        IceConnState::Failed => "failed",
        IceConnState::Disconnected => "disconnected",
        IceConnState::Closed => "closed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;

    struct TempDir(std::path::PathBuf);
    impl TempDir {
        fn new(label: &str) -> Self {
            let path = std::env::temp_dir().join(format!("p2prd-orch-test-{label}-{}", std::process::id()));
            let _ = std::fs::remove_dir_all(&path);
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    async fn fresh(label: &str, password: Option<&str>) -> Orchestrator {
        let dir = TempDir::new(label);
        let config = std::sync::Arc::new(ConfigStore::open(&dir.0).await.unwrap());
        if let Some(password) = password {
            let hash = hash_password(password).unwrap();
            config.update(|c| c.password_hash = hash.clone()).await.unwrap();
        }
        let lockout = std::sync::Arc::new(LockoutEngine::new(std::sync::Arc::clone(&config)));
        std::mem::forget(dir); // keep the directory alive for the test's duration
        Orchestrator::new(Uuid::new_v4(), config, lockout, MonitorRegistry::enumerate())
    }

    fn hello(session: Uuid) -> Vec<u8> {
        serde_json::to_vec(&SignalingMessage::OperatorHello { session_id: session }).unwrap()
    }

    fn auth(password: &str) -> Vec<u8> {
        serde_json::to_vec(&SignalingMessage::Auth { password: password.to_string() }).unwrap()
    }

    #[tokio::test]
    async fn operator_hello_acquires_lease_and_starts_offer() {
        let orch = fresh("hello", None).await;
        let session = Uuid::new_v4();
        let effects = orch.on_signaling_message(&hello(session)).await;
        assert!(matches!(orch.state().await, OrchestratorState::Unauthenticated));
        assert!(effects.iter().any(|e| matches!(e, Effect::StartOffer)));
        assert!(effects.iter().any(|e| matches!(e, Effect::Reply(SignalingMessage::HostHello { .. }))));
    }

    #[tokio::test]
    async fn second_distinct_session_is_rejected_as_busy() {
        let orch = fresh("busy", None).await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        orch.on_signaling_message(&hello(a)).await;
        let effects = orch.on_signaling_message(&hello(b)).await;
        assert!(matches!(effects.as_slice(), [Effect::Reply(SignalingMessage::HostBusy { .. })]));
        // A's lease is unaffected.
        assert_eq!(orch.lease().await.unwrap().session_id, a);
    }

    #[tokio::test]
    async fn successful_auth_transitions_to_authenticated_and_starts_frame_loop() {
        let orch = fresh("auth-ok", Some("secret")).await;
        orch.on_signaling_message(&hello(Uuid::new_v4())).await;
        let effects = orch.on_signaling_message(&auth("secret")).await;
        assert!(matches!(orch.state().await, OrchestratorState::Authenticated));
        assert!(effects.iter().any(|e| matches!(e, Effect::StartFrameLoop { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Ok, .. }))));
    }

    #[tokio::test]
    async fn wrong_password_stays_unauthenticated() {
        let orch = fresh("auth-bad", Some("secret")).await;
        orch.on_signaling_message(&hello(Uuid::new_v4())).await;
        let effects = orch.on_signaling_message(&auth("wrong")).await;
        assert!(matches!(orch.state().await, OrchestratorState::Unauthenticated));
        assert!(effects.iter().any(|e| matches!(e, Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Invalid, .. }))));
    }

    #[tokio::test]
    async fn fifth_consecutive_failure_locks_and_sixth_reports_locked() {
        let orch = fresh("lockout", Some("secret")).await;
        orch.on_signaling_message(&hello(Uuid::new_v4())).await;
        for _ in 0..4 {
            let effects = orch.on_signaling_message(&auth("wrong")).await;
            assert!(effects.iter().any(|e| matches!(e, Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Invalid, .. }))));
        }
        let fifth = orch.on_signaling_message(&auth("wrong")).await;
        assert!(fifth.iter().any(|e| matches!(e, Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Invalid, .. }))));

        let sixth = orch.on_signaling_message(&auth("secret")).await;
        assert!(matches!(sixth.as_slice(), [Effect::Reply(SignalingMessage::AuthResult { status: AuthStatus::Locked, retry_after_ms: Some(_) })]));
    }

    #[tokio::test]
    async fn input_is_dropped_before_authentication() {
        let orch = fresh("input-drop", Some("secret")).await;
        orch.on_signaling_message(&hello(Uuid::new_v4())).await;
        let event = SignalingMessage::Input { event: InputEvent::default() };
        let effects = orch.on_signaling_message(&serde_json::to_vec(&event).unwrap()).await;
        assert!(effects.is_empty());
    }

    #[tokio::test]
    async fn input_is_applied_once_authenticated() {
        let orch = fresh("input-ok", Some("secret")).await;
        orch.on_signaling_message(&hello(Uuid::new_v4())).await;
        orch.on_signaling_message(&auth("secret")).await;
        let event = SignalingMessage::Input { event: InputEvent::default() };
        let effects = orch.on_signaling_message(&serde_json::to_vec(&event).unwrap()).await;
        assert!(matches!(effects.as_slice(), [Effect::ApplyInput { .. }]));
    }

    #[tokio::test]
    async fn signaling_drop_releases_lease_and_blocks_further_input() {
        let orch = fresh("drop", Some("secret")).await;
        orch.on_signaling_message(&hello(Uuid::new_v4())).await;
        orch.on_signaling_message(&auth("secret")).await;
        let effects = orch.on_signaling_drop().await;
        assert!(effects.iter().any(|e| matches!(e, Effect::StopFrameLoop)));
        assert!(orch.lease().await.is_none());
        assert!(matches!(orch.state().await, OrchestratorState::NoSession));

        let event = SignalingMessage::Input { event: InputEvent::default() };
        let rejected = orch.on_signaling_message(&serde_json::to_vec(&event).unwrap()).await;
        assert!(rejected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ice_reoffer_is_debounced_within_five_seconds() {
        let orch = fresh("debounce", Some("secret")).await;
        orch.on_signaling_message(&hello(Uuid::new_v4())).await;

        let first = orch.on_ice_state_change(IceConnState::Failed).await;
        assert!(first.iter().any(|e| matches!(e, Effect::StartOffer)));

        let second = orch.on_ice_state_change(IceConnState::Disconnected).await;
        assert!(!second.iter().any(|e| matches!(e, Effect::StartOffer)));

        tokio::time::advance(REOFFER_DEBOUNCE + std::time::Duration::from_millis(1)).await;
        let third = orch.on_ice_state_change(IceConnState::Failed).await;
        assert!(third.iter().any(|e| matches!(e, Effect::StartOffer)));
    }

    #[tokio::test]
    async fn ice_state_with_no_lease_never_reoffers() {
        let orch = fresh("no-lease", Some("secret")).await;
        let effects = orch.on_ice_state_change(IceConnState::Failed).await;
        assert!(!effects.iter().any(|e| matches!(e, Effect::StartOffer)));
    }
}
