use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Host↔operator signaling messages, carried over the relay WebSocket and,
/// once negotiated, over the WebRTC control data channel. Tagged by `type`
/// exactly as the wire format table specifies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    OperatorHello {
        session_id: Uuid,
    },
    HostHello {
        host_id: Uuid,
        monitors: Vec<MonitorDescriptor>,
        active_monitor_id: String,
    },
    MonitorListRequest {
        session_id: Uuid,
    },
    MonitorList {
        monitors: Vec<MonitorDescriptor>,
        active_monitor_id: String,
    },
    MonitorSwitch {
        id: String,
    },
    MonitorSwitchResult {
        active_monitor_id: String,
    },
    Auth {
        password: String,
    },
    AuthResult {
        status: AuthStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    Input {
        #[serde(flatten)]
        event: InputEvent,
    },
    HostBusy {
        reason: String,
    },
    IceState {
        state: String,
    },
    SdpOffer {
        sdp: String,
        sdp_type: String,
    },
    SdpAnswer {
        sdp: String,
        sdp_type: String,
    },
    IceCandidate {
        candidate: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u32>,
    },
    /// Fallback path used when neither the video track nor the frames data
    /// channel is available yet.
    Frame {
        width: u32,
        height: u32,
        format: String,
        data: String,
    },
}

/// Standalone deserialization target for the `auth` message body; kept
/// separate from [`SignalingMessage::Auth`] so handlers that only care about
/// the password don't have to match the whole enum, and so a derived `Debug`
/// impl never leaks the plaintext password into logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub password: String,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest").field("password", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Ok,
    Invalid,
    Locked,
}

/// One mouse/keyboard/special-action sample. All three top-level fields are
/// optional so a single event can carry just the part that changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mouse: Option<MouseInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<KeyboardInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special: Option<SpecialAction>,
}

/// Normalized pointer position (`x`, `y` in `[0,1]`, clamped by the injector)
/// plus tri-state buttons: `Some(true)` press, `Some(false)` release, `None`
/// unchanged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MouseInput {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x1: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x2: Option<bool>,
    /// Vertical wheel delta in notches (fractional); the injector multiplies
    /// by 120 to reach the native wheel unit.
    #[serde(default)]
    pub wheel_delta_y: f64,
    #[serde(default)]
    pub wheel_delta_x: f64,
}

/// Scancode-path keyboard event. Scancodes (not virtual keys) are used so
/// the host's keyboard layout doesn't have to match the operator's.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyboardInput {
    pub scancode: u16,
    #[serde(default)]
    pub extended: bool,
    pub down: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpecialAction {
    CtrlAltDel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorDescriptor {
    pub id: String,
    pub name: String,
    pub bounds: Rect,
    /// Rational ≥ 1.0, e.g. 1.0, 1.25, 1.5, 2.0.
    pub effective_dpi_scale: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Sent by the relay immediately on connect, before any pairing has
/// happened; not part of [`SignalingMessage`] since it never reaches the
/// host/operator application layer — the relay originates and terminates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WelcomeMessage {
    #[serde(rename = "type")]
    pub kind: WelcomeKind,
    pub role: RelayRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WelcomeKind {
    Welcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelayRole {
    Host,
    Operator,
}

impl WelcomeMessage {
    pub fn new(role: RelayRole) -> Self {
        Self { kind: WelcomeKind::Welcome, role }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_hello_round_trips() {
        let session_id = Uuid::new_v4();
        let msg = SignalingMessage::OperatorHello { session_id };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            serde_json::from_str::<SignalingMessage>(&json).unwrap(),
            msg
        );
    }

    #[test]
    fn operator_hello_wire_shape() {
        let session_id = Uuid::nil();
        let msg = SignalingMessage::OperatorHello { session_id };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "operator_hello");
        assert_eq!(json["session_id"], session_id.to_string());
    }

    #[test]
    fn auth_result_omits_retry_after_when_none() {
        let msg = SignalingMessage::AuthResult { status: AuthStatus::Ok, retry_after_ms: None };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("retry_after_ms").is_none());
    }

    #[test]
    fn auth_result_locked_carries_retry_after() {
        let msg = SignalingMessage::AuthResult { status: AuthStatus::Locked, retry_after_ms: Some(300_000) };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "locked");
        assert_eq!(json["retry_after_ms"], 300_000);
    }

    #[test]
    fn input_event_mouse_only_omits_keyboard_and_special() {
        let event = InputEvent {
            mouse: Some(MouseInput { x: 0.5, y: 0.5, left: Some(true), ..Default::default() }),
            keyboard: None,
            special: None,
        };
        let msg = SignalingMessage::Input { event };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("keyboard").is_none());
        assert!(json.get("special").is_none());
        assert_eq!(json["mouse"]["left"], true);
    }

    #[test]
    fn mouse_unset_buttons_are_omitted_not_null() {
        let mouse = MouseInput { x: 0.1, y: 0.2, ..Default::default() };
        let json = serde_json::to_value(mouse).unwrap();
        assert!(json.get("left").is_none());
        assert!(json.get("right").is_none());
    }

    #[test]
    fn special_action_ctrl_alt_del_tag() {
        let json = serde_json::to_value(SpecialAction::CtrlAltDel).unwrap();
        assert_eq!(json, "ctrl_alt_del");
    }

    #[test]
    fn sdp_offer_and_answer_are_distinct_types() {
        let offer = SignalingMessage::SdpOffer { sdp: "v=0".into(), sdp_type: "offer".into() };
        let answer = SignalingMessage::SdpAnswer { sdp: "v=0".into(), sdp_type: "answer".into() };
        let offer_json = serde_json::to_value(&offer).unwrap();
        let answer_json = serde_json::to_value(&answer).unwrap();
        assert_eq!(offer_json["type"], "sdp_offer");
        assert_eq!(answer_json["type"], "sdp_answer");
    }

    #[test]
    fn ice_candidate_optional_fields_round_trip_when_present() {
        let msg = SignalingMessage::IceCandidate {
            candidate: "candidate:1 1 UDP 1 0.0.0.0 1 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<SignalingMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn host_busy_reason_field() {
        let msg = SignalingMessage::HostBusy { reason: "active_session".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["reason"], "active_session");
    }

    #[test]
    fn auth_request_debug_redacts_password() {
        let req = AuthRequest { password: "hunter2".into() };
        let debug = format!("{req:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn welcome_message_shape() {
        let msg = WelcomeMessage::new(RelayRole::Operator);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["role"], "operator");
    }

    #[test]
    fn frame_fallback_message_round_trips() {
        let msg = SignalingMessage::Frame {
            width: 1920,
            height: 1080,
            format: "image/png".into(),
            data: "AAAA".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<SignalingMessage>(&json).unwrap(), msg);
    }
}
