//! `InputBackend` capability trait (§9, §4.5): maps normalized pointer
//! coordinates to physical pixels and injects mouse/keyboard/secure-attention
//! input. The scroll-notch accumulation and clamp-to-`[0,1]` helpers are
//! carried over from the teacher's uinput `InputInjector` (same fractional
//! accumulator shape), reworked around `SendInput` instead of uinput
//! `input_event`s and scancodes instead of the teacher's browser-button
//! indices.

use p2prd_protocol::{KeyboardInput, MonitorDescriptor, MouseInput, SpecialAction};
use tracing::{debug, warn};

pub trait InputBackend: Send + Sync {
    fn mouse_move(&mut self, x_px: i32, y_px: i32);
    fn mouse_button(&mut self, button: MouseButton, pressed: bool);
    fn scroll(&mut self, notches_x: f64, notches_y: f64);
    fn key(&mut self, scancode: u16, extended: bool, down: bool);
    fn special(&mut self, action: SpecialAction);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    X1,
    X2,
}

/// Map a normalized `[0,1]` (x, y) plus a monitor descriptor into physical
/// pixel coordinates, per §4.5: `(B.left*s + clamp01(x)*B.width*s, ...)`.
pub fn to_physical_pixels(x: f64, y: f64, monitor: &MonitorDescriptor) -> (i32, i32) {
    let s = monitor.effective_dpi_scale;
    let b = &monitor.bounds;
    let cx = x.clamp(0.0, 1.0);
    let cy = y.clamp(0.0, 1.0);
    let px = (b.left as f64 * s) + cx * (b.width as f64 * s);
    let py = (b.top as f64 * s) + cy * (b.height as f64 * s);
    (px.round() as i32, py.round() as i32)
}

/// Apply one [`p2prd_protocol::InputEvent`]'s sub-parts to `backend`,
/// resolving normalized mouse coordinates against `monitor`.
pub fn apply_mouse(backend: &mut dyn InputBackend, mouse: &MouseInput, monitor: &MonitorDescriptor) {
    let (px, py) = to_physical_pixels(mouse.x, mouse.y, monitor);
    backend.mouse_move(px, py);

    if let Some(pressed) = mouse.left {
        backend.mouse_button(MouseButton::Left, pressed);
    }
    if let Some(pressed) = mouse.right {
        backend.mouse_button(MouseButton::Right, pressed);
    }
    if let Some(pressed) = mouse.middle {
        backend.mouse_button(MouseButton::Middle, pressed);
    }
    if let Some(pressed) = mouse.x1 {
        backend.mouse_button(MouseButton::X1, pressed);
    }
    if let Some(pressed) = mouse.x2 {
        backend.mouse_button(MouseButton::X2, pressed);
    }

    if mouse.wheel_delta_x != 0.0 || mouse.wheel_delta_y != 0.0 {
        backend.scroll(mouse.wheel_delta_x, mouse.wheel_delta_y);
    }
}

pub fn apply_keyboard(backend: &mut dyn InputBackend, keyboard: &KeyboardInput) {
    backend.key(keyboard.scancode, keyboard.extended, keyboard.down);
}

#[cfg(windows)]
pub struct WindowsInputBackend;

#[cfg(windows)]
impl WindowsInputBackend {
    pub fn new() -> Self {
        Self
    }

    fn send(&self, inputs: &[windows::Win32::UI::Input::KeyboardAndMouse::INPUT]) {
        use windows::Win32::UI::Input::KeyboardAndMouse::SendInput;
        let sent = unsafe { SendInput(inputs, std::mem::size_of_val(&inputs[0]) as i32) };
        if sent as usize != inputs.len() {
            warn!(sent, expected = inputs.len(), "SendInput delivered fewer events than requested");
        }
    }
}

#[cfg(windows)]
impl Default for WindowsInputBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
impl InputBackend for WindowsInputBackend {
    fn mouse_move(&mut self, x_px: i32, y_px: i32) {
        use windows::Win32::UI::Input::KeyboardAndMouse::{
            INPUT, INPUT_0, INPUT_MOUSE, MOUSEEVENTF_ABSOLUTE, MOUSEEVENTF_MOVE, MOUSEINPUT,
        };
        use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXVIRTUALSCREEN, SM_CYVIRTUALSCREEN};

        let screen_w = unsafe { GetSystemMetrics(SM_CXVIRTUALSCREEN) }.max(1);
        let screen_h = unsafe { GetSystemMetrics(SM_CYVIRTUALSCREEN) }.max(1);
        // SendInput absolute coordinates are normalized to 0..65535 across
        // the full virtual screen, independent of the per-monitor mapping
        // done in `to_physical_pixels`.
        let norm_x = (x_px * 65535) / screen_w;
        let norm_y = (y_px * 65535) / screen_h;

        let input = INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT {
                    dx: norm_x,
                    dy: norm_y,
                    mouseData: 0,
                    dwFlags: MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        self.send(&[input]);
    }

    fn mouse_button(&mut self, button: MouseButton, pressed: bool) {
        use windows::Win32::UI::Input::KeyboardAndMouse::{
            INPUT, INPUT_0, INPUT_MOUSE, MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP,
            MOUSEEVENTF_MIDDLEDOWN, MOUSEEVENTF_MIDDLEUP, MOUSEEVENTF_RIGHTDOWN,
            MOUSEEVENTF_RIGHTUP, MOUSEEVENTF_XDOWN, MOUSEEVENTF_XUP, MOUSEINPUT, XBUTTON1, XBUTTON2,
        };

        let (flags, mouse_data) = match (button, pressed) {
            (MouseButton::Left, true) => (MOUSEEVENTF_LEFTDOWN, 0),
            (MouseButton::Left, false) => (MOUSEEVENTF_LEFTUP, 0),
            (MouseButton::Right, true) => (MOUSEEVENTF_RIGHTDOWN, 0),
            (MouseButton::Right, false) => (MOUSEEVENTF_RIGHTUP, 0),
            (MouseButton::Middle, true) => (MOUSEEVENTF_MIDDLEDOWN, 0),
            (MouseButton::Middle, false) => (MOUSEEVENTF_MIDDLEUP, 0),
            (MouseButton::X1, true) => (MOUSEEVENTF_XDOWN, XBUTTON1.0 as u32),
            (MouseButton::X1, false) => (MOUSEEVENTF_XUP, XBUTTON1.0 as u32),
            (MouseButton::X2, true) => (MOUSEEVENTF_XDOWN, XBUTTON2.0 as u32),
            (MouseButton::X2, false) => (MOUSEEVENTF_XUP, XBUTTON2.0 as u32),
        };

        let input = INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT { dx: 0, dy: 0, mouseData: mouse_data, dwFlags: flags, time: 0, dwExtraInfo: 0 },
            },
        };
        self.send(&[input]);
    }

    fn scroll(&mut self, notches_x: f64, notches_y: f64) {
        use windows::Win32::UI::Input::KeyboardAndMouse::{
            INPUT, INPUT_0, INPUT_MOUSE, MOUSEEVENTF_HWHEEL, MOUSEEVENTF_WHEEL, MOUSEINPUT,
        };

        const WHEEL_DELTA: f64 = 120.0;
        let mut inputs = Vec::with_capacity(2);
        if notches_y != 0.0 {
            inputs.push(INPUT {
                r#type: INPUT_MOUSE,
                Anonymous: INPUT_0 {
                    mi: MOUSEINPUT {
                        dx: 0,
                        dy: 0,
                        mouseData: (notches_y * WHEEL_DELTA).round() as i32 as u32,
                        dwFlags: MOUSEEVENTF_WHEEL,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            });
        }
        if notches_x != 0.0 {
            inputs.push(INPUT {
                r#type: INPUT_MOUSE,
                Anonymous: INPUT_0 {
                    mi: MOUSEINPUT {
                        dx: 0,
                        dy: 0,
                        mouseData: (notches_x * WHEEL_DELTA).round() as i32 as u32,
                        dwFlags: MOUSEEVENTF_HWHEEL,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            });
        }
        if !inputs.is_empty() {
            self.send(&inputs);
        }
    }

    fn key(&mut self, scancode: u16, extended: bool, down: bool) {
        use windows::Win32::UI::Input::KeyboardAndMouse::{
            INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYEVENTF_EXTENDEDKEY, KEYEVENTF_KEYUP,
            KEYEVENTF_SCANCODE,
        };

        let mut flags = KEYEVENTF_SCANCODE;
        if extended {
            flags |= KEYEVENTF_EXTENDEDKEY;
        }
        if !down {
            flags |= KEYEVENTF_KEYUP;
        }

        let input = INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT { wVk: Default::default(), wScan: scancode, dwFlags: flags, time: 0, dwExtraInfo: 0 },
            },
        };
        self.send(&[input]);
    }

    fn special(&mut self, action: SpecialAction) {
        match action {
            SpecialAction::CtrlAltDel => {
                // SendInput cannot synthesize the secure-attention sequence
                // (Windows blocks exactly that); the platform primitive is
                // SendSAS, exported alongside the other winlogon/Terminal
                // Services desktop-switching APIs this crate already links
                // against via `Win32_System_RemoteDesktop`. It's a void FFI
                // call with no error channel of its own, so "non-fatal" here
                // just means a panic at the boundary can't take the process
                // down with it.
                use windows::Win32::System::RemoteDesktop::SendSAS;
                let result = std::panic::catch_unwind(|| unsafe { SendSAS(true.into()) });
                if result.is_err() {
                    warn!("SendSAS panicked while injecting ctrl_alt_del");
                } else {
                    debug!("issued secure-attention sequence via SendSAS");
                }
            }
        }
    }
}

/// In-memory fake for tests: records every call instead of touching the OS.
#[derive(Default)]
pub struct FakeInputBackend {
    pub moves: Vec<(i32, i32)>,
    pub buttons: Vec<(MouseButton, bool)>,
    pub scrolls: Vec<(f64, f64)>,
    pub keys: Vec<(u16, bool, bool)>,
    pub specials: Vec<SpecialAction>,
}

impl InputBackend for FakeInputBackend {
    fn mouse_move(&mut self, x_px: i32, y_px: i32) {
        self.moves.push((x_px, y_px));
    }

    fn mouse_button(&mut self, button: MouseButton, pressed: bool) {
        self.buttons.push((button, pressed));
    }

    fn scroll(&mut self, notches_x: f64, notches_y: f64) {
        self.scrolls.push((notches_x, notches_y));
    }

    fn key(&mut self, scancode: u16, extended: bool, down: bool) {
        self.keys.push((scancode, extended, down));
    }

    fn special(&mut self, action: SpecialAction) {
        debug!(?action, "fake backend: special action");
        self.specials.push(action);
    }
}

#[cfg(not(windows))]
pub type PlatformInputBackend = FakeInputBackend;
#[cfg(windows)]
pub type PlatformInputBackend = WindowsInputBackend;

#[cfg(test)]
mod tests {
    use super::*;
    use p2prd_protocol::Rect;

    fn monitor() -> MonitorDescriptor {
        MonitorDescriptor {
            id: "m0".into(),
            name: "Primary".into(),
            bounds: Rect { left: 0, top: 0, width: 1000, height: 500 },
            effective_dpi_scale: 1.0,
        }
    }

    #[test]
    fn origin_maps_to_top_left() {
        assert_eq!(to_physical_pixels(0.0, 0.0, &monitor()), (0, 0));
    }

    #[test]
    fn one_maps_to_bottom_right() {
        assert_eq!(to_physical_pixels(1.0, 1.0, &monitor()), (1000, 500));
    }

    #[test]
    fn center_maps_to_midpoint() {
        let (x, y) = to_physical_pixels(0.5, 0.5, &monitor());
        assert_eq!(x, 500);
        assert_eq!(y, 250);
    }

    #[test]
    fn out_of_range_coordinates_are_clamped() {
        assert_eq!(to_physical_pixels(-1.0, 2.0, &monitor()), (0, 500));
    }

    #[test]
    fn dpi_scale_multiplies_bounds_and_offset() {
        let mut m = monitor();
        m.bounds.left = 1000;
        m.effective_dpi_scale = 2.0;
        let (x, _) = to_physical_pixels(0.0, 0.0, &m);
        assert_eq!(x, 2000);
    }

    #[test]
    fn coordinate_mapping_is_idempotent_up_to_one_pixel() {
        let m = monitor();
        for &(x, y) in &[(0.0, 0.0), (0.25, 0.75), (0.5, 0.5), (1.0, 1.0)] {
            let (px, py) = to_physical_pixels(x, y, &m);
            let back_x = (px - m.bounds.left) as f64 / m.bounds.width as f64;
            let back_y = (py - m.bounds.top) as f64 / m.bounds.height as f64;
            assert!((back_x - x).abs() <= 1.0 / m.bounds.width as f64 + 1e-9);
            assert!((back_y - y).abs() <= 1.0 / m.bounds.height as f64 + 1e-9);
        }
    }

    #[test]
    fn apply_mouse_forwards_move_and_buttons() {
        let mut backend = FakeInputBackend::default();
        let mouse = MouseInput { x: 0.5, y: 0.5, left: Some(true), ..Default::default() };
        apply_mouse(&mut backend, &mouse, &monitor());
        assert_eq!(backend.moves, vec![(500, 250)]);
        assert_eq!(backend.buttons, vec![(MouseButton::Left, true)]);
    }

    #[test]
    fn apply_mouse_skips_scroll_when_zero() {
        let mut backend = FakeInputBackend::default();
        let mouse = MouseInput { x: 0.1, y: 0.1, ..Default::default() };
        apply_mouse(&mut backend, &mouse, &monitor());
        assert!(backend.scrolls.is_empty());
    }

    #[test]
    fn apply_mouse_forwards_nonzero_scroll() {
        let mut backend = FakeInputBackend::default();
        let mouse = MouseInput { x: 0.1, y: 0.1, wheel_delta_y: 1.5, ..Default::default() };
        apply_mouse(&mut backend, &mouse, &monitor());
        assert_eq!(backend.scrolls, vec![(0.0, 1.5)]);
    }

    #[test]
    fn apply_keyboard_forwards_scancode_and_state() {
        let mut backend = FakeInputBackend::default();
        apply_keyboard(&mut backend, &KeyboardInput { scancode: 0x1e, extended: false, down: true });
        assert_eq!(backend.keys, vec![(0x1e, false, true)]);
    }

    #[test]
    fn fake_backend_records_special_action() {
        let mut backend = FakeInputBackend::default();
        backend.special(SpecialAction::CtrlAltDel);
        assert_eq!(backend.specials, vec![SpecialAction::CtrlAltDel]);
    }
}
