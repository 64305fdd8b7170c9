//! Host process entry point. Wires the Config Store, Lockout Engine, Monitor
//! Registry, and Session Orchestrator to the Signaling Client, Resolver
//! Loop, WebRTC Core, IPC Surface, Session-0 Watcher, and capture/encode
//! frame loop. Grounded on the relay's `main.rs` for the ambient shape
//! (hand-rolled arg parsing, `tracing_subscriber::fmt` with an `EnvFilter`,
//! ctrl_c/SIGTERM graceful shutdown) and on
//! `examples/frecar-beam/crates/agent/main.rs` for the single top-level
//! `select!` loop that owns the WebRTC peer directly rather than sharing it
//! behind a lock — every orchestrator `Effect` is applied right here, the
//! one place allowed to touch I/O.

mod auth;
mod capture;
mod config_store;
mod desktop;
mod encoder;
mod input;
mod ipc;
mod monitor;
mod orchestrator;
mod resolver;
mod session0;
mod signaling_client;
mod webrtc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use p2prd_protocol::{Rect, SignalingMessage};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::capture::CaptureBackend;
use crate::config_store::{ConfigStore, LockoutEngine};
use crate::desktop::DesktopSwitcher;
use crate::encoder::{EncodedFragment, TARGET_FPS, VideoEncoder, Vp8Encoder};
use crate::input::InputBackend;
use crate::monitor::MonitorRegistry;
use crate::orchestrator::{Effect, Orchestrator};
use crate::session0::ConsoleSessionSource;
use crate::webrtc::{DataChannelKind, WebRtcCore, WebRtcEvent};

fn parse_config_dir() -> Option<std::path::PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config-dir" && i + 1 < args.len() {
            return Some(std::path::PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls default crypto provider already installed"))?;

    let config_dir = parse_config_dir().unwrap_or_else(ConfigStore::default_dir);
    let config = Arc::new(ConfigStore::open(&config_dir).await.context("opening config store")?);
    let lockout = Arc::new(LockoutEngine::new(Arc::clone(&config)));
    let snapshot = config.snapshot().await;
    let monitors = MonitorRegistry::enumerate();
    let orchestrator = Arc::new(Orchestrator::new(snapshot.host_id, Arc::clone(&config), lockout, monitors));

    info!(host_id = %snapshot.host_id, "P2PRD host starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (resolver_target_tx, resolver_target_rx) = watch::channel(String::new());
    let (signaling_outbound_tx, signaling_outbound_rx) = mpsc::channel::<Vec<u8>>(64);
    let (signaling_inbound_tx, mut signaling_inbound_rx) = mpsc::channel::<Vec<u8>>(64);
    let (signaling_disconnected_tx, mut signaling_disconnected_rx) = mpsc::channel::<()>(8);
    let (webrtc_event_tx, mut webrtc_event_rx) = mpsc::channel::<WebRtcEvent>(128);
    let (session0_tx, mut session0_rx) = mpsc::channel::<session0::SessionTransition>(8);
    let (fragments_tx, mut fragments_rx) = mpsc::unbounded_channel::<EncodedFragment>();
    let (frame_cmd_tx, frame_cmd_rx) = std::sync::mpsc::channel::<FrameLoopCommand>();

    if resolver_target_tx.send(snapshot.signaling_resolver_url.clone()).is_err() {
        warn!("resolver target channel closed before startup could seed it");
    }

    let http_client = reqwest::Client::new();
    tokio::spawn(resolver::run_resolver_loop(
        snapshot.signaling_resolver_url.clone(),
        resolver_target_tx,
        http_client,
        shutdown_rx.clone(),
    ));
    tokio::spawn(signaling_client::run_signaling_client(
        resolver_target_rx,
        signaling_outbound_rx,
        signaling_inbound_tx,
        signaling_disconnected_tx,
        shutdown_rx.clone(),
    ));
    {
        let config = Arc::clone(&config);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc::run_ipc_server(config, shutdown_rx).await {
                warn!(error = %e, "IPC server exited with an error");
            }
        });
    }
    tokio::spawn(session0::run_session0_watcher(make_session_source(), session0_tx, shutdown_rx.clone()));

    let switcher: Arc<dyn DesktopSwitcher> = Arc::new(make_desktop_switcher());
    let _frame_thread = std::thread::spawn({
        let switcher = Arc::clone(&switcher);
        move || run_frame_loop(switcher, frame_cmd_rx, fragments_tx)
    });

    let mut webrtc_core = WebRtcCore::new(webrtc_event_tx);
    let mut input_backend = input::PlatformInputBackend::default();
    let mut current_monitor_bounds = Rect { left: 0, top: 0, width: 1920, height: 1080 };

    loop {
        tokio::select! {
            Some(raw) = signaling_inbound_rx.recv() => {
                if let Some(msg) = webrtc_negotiation_message(&raw) {
                    apply_webrtc_negotiation(msg, &mut webrtc_core).await;
                } else {
                    let effects = orchestrator.on_signaling_message(&raw).await;
                    apply_effects(effects, &orchestrator, &mut webrtc_core, &mut input_backend,
                        &signaling_outbound_tx, &frame_cmd_tx, &snapshot, &mut current_monitor_bounds).await;
                }
            }
            Some(()) = signaling_disconnected_rx.recv() => {
                let effects = orchestrator.on_signaling_drop().await;
                apply_effects(effects, &orchestrator, &mut webrtc_core, &mut input_backend,
                    &signaling_outbound_tx, &frame_cmd_tx, &snapshot, &mut current_monitor_bounds).await;
            }
            Some(event) = webrtc_event_rx.recv() => {
                handle_webrtc_event(event, &orchestrator, &mut webrtc_core, &mut input_backend,
                    &signaling_outbound_tx, &frame_cmd_tx, &snapshot, &mut current_monitor_bounds).await;
            }
            Some(transition) = session0_rx.recv() => {
                info!(?transition, "active console session changed, forcing a keyframe");
                let _ = frame_cmd_tx.send(FrameLoopCommand::ForceKeyframe);
            }
            Some(fragment) = fragments_rx.recv() => {
                deliver_fragment(&fragment, current_monitor_bounds, &webrtc_core, &signaling_outbound_tx).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = sigterm() => {
                info!("received SIGTERM, shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    info!("P2PRD host shut down cleanly");
    Ok(())
}

#[cfg(windows)]
fn make_desktop_switcher() -> desktop::PlatformDesktopSwitcher {
    desktop::WindowsDesktopSwitcher
}

#[cfg(not(windows))]
fn make_desktop_switcher() -> desktop::PlatformDesktopSwitcher {
    desktop::FakeDesktopSwitcher::default()
}

#[cfg(windows)]
fn make_session_source() -> session0::PlatformConsoleSessionSource {
    session0::WindowsConsoleSessionSource
}

#[cfg(not(windows))]
fn make_session_source() -> session0::PlatformConsoleSessionSource {
    session0::FakeConsoleSessionSource::new(0)
}

/// Peel a `sdp_answer`/`ice_candidate` reply off the raw inbound signaling
/// stream before it reaches the orchestrator — these never touch session
/// state and go straight to the WebRTC core instead.
fn webrtc_negotiation_message(raw: &[u8]) -> Option<SignalingMessage> {
    let msg: SignalingMessage = serde_json::from_slice(raw).ok()?;
    Orchestrator::is_webrtc_negotiation(&msg).then_some(msg)
}

async fn apply_webrtc_negotiation(msg: SignalingMessage, webrtc_core: &mut WebRtcCore) {
    match msg {
        SignalingMessage::SdpAnswer { sdp, .. } => {
            if let Err(e) = webrtc_core.accept_answer(&sdp).await {
                warn!(error = %e, "failed to accept SDP answer");
            }
        }
        SignalingMessage::IceCandidate { candidate, sdp_mid, sdp_mline_index } => {
            let sdp_mline_index = sdp_mline_index.map(|v| v as u16);
            if let Err(e) = webrtc_core.add_remote_candidate(&candidate, sdp_mid.as_deref(), sdp_mline_index).await {
                warn!(error = %e, "failed to add remote ICE candidate");
            }
        }
        _ => {}
    }
}

async fn sigterm() {
    #[cfg(unix)]
    {
        let mut stream = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        stream.recv().await;
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

async fn handle_webrtc_event(
    event: WebRtcEvent,
    orchestrator: &Arc<Orchestrator>,
    webrtc_core: &mut WebRtcCore,
    input_backend: &mut dyn InputBackend,
    outbound_tx: &mpsc::Sender<Vec<u8>>,
    frame_cmd_tx: &std::sync::mpsc::Sender<FrameLoopCommand>,
    snapshot: &p2prd_protocol::HostConfig,
    current_monitor_bounds: &mut Rect,
) {
    match event {
        WebRtcEvent::OfferReady { sdp } => {
            send_signaling(outbound_tx, SignalingMessage::SdpOffer { sdp, sdp_type: "offer".to_string() }).await;
        }
        WebRtcEvent::LocalIceCandidate { candidate, sdp_mid, sdp_mline_index } => {
            send_signaling(
                outbound_tx,
                SignalingMessage::IceCandidate { candidate, sdp_mid, sdp_mline_index: sdp_mline_index.map(u32::from) },
            )
            .await;
        }
        WebRtcEvent::IceStateChanged(state) => {
            let effects = orchestrator.on_ice_state_change(state).await;
            apply_effects(effects, orchestrator, webrtc_core, input_backend, outbound_tx, frame_cmd_tx, snapshot, current_monitor_bounds).await;
        }
        WebRtcEvent::ChannelOpened(kind) => {
            if kind == DataChannelKind::Frames {
                let _ = frame_cmd_tx.send(FrameLoopCommand::ForceKeyframe);
            }
            let effects = orchestrator.on_channel_open(kind).await;
            apply_effects(effects, orchestrator, webrtc_core, input_backend, outbound_tx, frame_cmd_tx, snapshot, current_monitor_bounds).await;
        }
        WebRtcEvent::ChannelClosed(kind) => {
            let effects = orchestrator.on_channel_close(kind).await;
            apply_effects(effects, orchestrator, webrtc_core, input_backend, outbound_tx, frame_cmd_tx, snapshot, current_monitor_bounds).await;
        }
        WebRtcEvent::ControlMessageReceived(bytes) => {
            let effects = orchestrator.on_control_channel_message(&bytes).await;
            apply_effects(effects, orchestrator, webrtc_core, input_backend, outbound_tx, frame_cmd_tx, snapshot, current_monitor_bounds).await;
        }
    }
}

async fn apply_effects(
    effects: Vec<Effect>,
    orchestrator: &Arc<Orchestrator>,
    webrtc_core: &mut WebRtcCore,
    input_backend: &mut dyn InputBackend,
    outbound_tx: &mpsc::Sender<Vec<u8>>,
    frame_cmd_tx: &std::sync::mpsc::Sender<FrameLoopCommand>,
    snapshot: &p2prd_protocol::HostConfig,
    current_monitor_bounds: &mut Rect,
) {
    for effect in effects {
        match effect {
            Effect::Reply(msg) => reply(webrtc_core, outbound_tx, msg).await,
            Effect::StartOffer => {
                if let Err(e) = webrtc_core.start_offer(&snapshot.stun, Some(&snapshot.turn)).await {
                    warn!(error = %e, "failed to start WebRTC offer");
                }
            }
            Effect::ResetTransport => webrtc_core.reset(),
            Effect::StartFrameLoop { bounds } => {
                *current_monitor_bounds = bounds;
                let _ = frame_cmd_tx.send(FrameLoopCommand::SetMonitor(bounds));
                let _ = frame_cmd_tx.send(FrameLoopCommand::SetActive(true));
                let _ = frame_cmd_tx.send(FrameLoopCommand::ForceKeyframe);
            }
            Effect::StopFrameLoop => {
                let _ = frame_cmd_tx.send(FrameLoopCommand::SetActive(false));
            }
            Effect::FrameLoopMonitorChanged { bounds } => {
                *current_monitor_bounds = bounds;
                let _ = frame_cmd_tx.send(FrameLoopCommand::SetMonitor(bounds));
                let _ = frame_cmd_tx.send(FrameLoopCommand::ForceKeyframe);
            }
            Effect::ApplyInput { event, monitor_id } => {
                let Some(monitor) = orchestrator_active_monitor(orchestrator, &monitor_id).await else {
                    continue;
                };
                if let Some(mouse) = &event.mouse {
                    input::apply_mouse(input_backend, mouse, &monitor);
                }
                if let Some(keyboard) = &event.keyboard {
                    input::apply_keyboard(input_backend, keyboard);
                }
                if let Some(special) = event.special {
                    input_backend.special(special);
                }
            }
        }
    }
}

/// `Effect::ApplyInput` only carries a monitor id; resolve it back to a
/// descriptor so `to_physical_pixels` has bounds/DPI to map against.
async fn orchestrator_active_monitor(orchestrator: &Arc<Orchestrator>, monitor_id: &str) -> Option<p2prd_protocol::MonitorDescriptor> {
    // The orchestrator owns the only monitor registry; ask it directly
    // rather than duplicating the registry in `main`.
    orchestrator.monitor_descriptor(monitor_id).await
}

/// Send a [`SignalingMessage`] over the control data channel if it's open,
/// else fall back to the signaling WebSocket (§4.1's transport-selection
/// rule). WebRTC negotiation messages (`SdpOffer`/`IceCandidate`) never go
/// through here — they always use the signaling socket directly, since it's
/// the channel that establishes the one this function prefers.
async fn reply(webrtc_core: &WebRtcCore, outbound_tx: &mpsc::Sender<Vec<u8>>, msg: SignalingMessage) {
    let Ok(bytes) = serde_json::to_vec(&msg) else { return };
    if webrtc_core.try_send_control(&bytes).await {
        return;
    }
    send_signaling(outbound_tx, msg).await;
}

async fn send_signaling(outbound_tx: &mpsc::Sender<Vec<u8>>, msg: SignalingMessage) {
    if let Ok(bytes) = serde_json::to_vec(&msg) {
        let _ = outbound_tx.send(bytes).await;
    }
}

/// Tiered frame delivery per §4.1: the negotiated video track first, then
/// the `frames` data channel, then a base64 fallback over whatever signaling
/// transport `reply` would pick.
async fn deliver_fragment(fragment: &EncodedFragment, bounds: Rect, webrtc_core: &WebRtcCore, outbound_tx: &mpsc::Sender<Vec<u8>>) {
    if webrtc_core.try_send_video(fragment).await {
        return;
    }

    let header = serde_json::json!({
        "width": bounds.width,
        "height": bounds.height,
        "format": "vp8",
        "is_keyframe": fragment.is_keyframe,
    });
    if let Ok(header_bytes) = serde_json::to_vec(&header) {
        if webrtc_core.try_send_frame(&header_bytes, &fragment.data).await {
            return;
        }
    }

    let msg = SignalingMessage::Frame {
        width: bounds.width,
        height: bounds.height,
        format: "vp8".to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(&fragment.data),
    };
    reply(webrtc_core, outbound_tx, msg).await;
}

enum FrameLoopCommand {
    SetActive(bool),
    SetMonitor(Rect),
    ForceKeyframe,
}

/// Runs on its own OS thread rather than as a tokio task: `CaptureBackend`
/// and `VideoEncoder` are synchronous, CPU/GPU-bound calls (DXGI duplication,
/// GDI `BitBlt`, libvpx), and blocking a tokio worker with them would stall
/// every other select branch in `main`'s event loop.
fn run_frame_loop(switcher: Arc<dyn DesktopSwitcher>, commands_rx: std::sync::mpsc::Receiver<FrameLoopCommand>, fragments_tx: mpsc::UnboundedSender<EncodedFragment>) {
    let mut capture = make_capture_backend(switcher);
    let mut encoder = Vp8Encoder::new();
    let mut active = false;
    let mut bounds = Rect { left: 0, top: 0, width: 1920, height: 1080 };
    let frame_interval = Duration::from_millis(1000 / TARGET_FPS as u64);

    loop {
        while let Ok(cmd) = commands_rx.try_recv() {
            apply_frame_cmd(cmd, &mut active, &mut bounds, &mut encoder);
        }

        if !active {
            match commands_rx.recv() {
                Ok(cmd) => apply_frame_cmd(cmd, &mut active, &mut bounds, &mut encoder),
                Err(_) => return,
            }
            continue;
        }

        let started = std::time::Instant::now();
        match capture.capture(bounds) {
            Ok(frame) => match encoder.encode(frame.as_bytes(), frame.width, frame.height) {
                Ok(fragment) => {
                    if fragments_tx.send(fragment).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "video encode failed"),
            },
            Err(e) => warn!(error = %e, "frame capture failed"),
        }

        let elapsed = started.elapsed();
        if elapsed < frame_interval {
            std::thread::sleep(frame_interval - elapsed);
        }
    }
}

fn apply_frame_cmd(cmd: FrameLoopCommand, active: &mut bool, bounds: &mut Rect, encoder: &mut Vp8Encoder) {
    match cmd {
        FrameLoopCommand::SetActive(a) => *active = a,
        FrameLoopCommand::SetMonitor(b) => *bounds = b,
        FrameLoopCommand::ForceKeyframe => encoder.force_keyframe(),
    }
}

#[cfg(windows)]
fn make_capture_backend(switcher: Arc<dyn DesktopSwitcher>) -> capture::PlatformCaptureBackend {
    capture::WindowsCaptureBackend::new(switcher)
}

#[cfg(not(windows))]
fn make_capture_backend(_switcher: Arc<dyn DesktopSwitcher>) -> capture::PlatformCaptureBackend {
    capture::FakeCaptureBackend::new()
}
