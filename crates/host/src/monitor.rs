//! Enumerates displays and tracks the active monitor id (§2 Monitor
//! Registry). Bounds and DPI are platform-sourced on Windows
//! (`EnumDisplayMonitors` + `GetDpiForMonitor`-equivalent); elsewhere a
//! single synthetic monitor stands in so the rest of the pipeline has
//! something to address.

use p2prd_protocol::{MonitorDescriptor, Rect};

pub struct MonitorRegistry {
    monitors: Vec<MonitorDescriptor>,
    active_id: String,
}

impl MonitorRegistry {
    /// Enumerate the current display set. Always yields at least one
    /// monitor, falling back to a synthetic `"virtual-0"` entry if
    /// enumeration itself fails (keeps the rest of the orchestrator from
    /// having to special-case "no displays").
    pub fn enumerate() -> Self {
        let monitors = platform_enumerate().unwrap_or_else(|| vec![synthetic_monitor()]);
        let active_id = monitors.first().map(|m| m.id.clone()).unwrap_or_default();
        Self { monitors, active_id }
    }

    pub fn monitors(&self) -> &[MonitorDescriptor] {
        &self.monitors
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    pub fn active(&self) -> Option<&MonitorDescriptor> {
        self.monitors.iter().find(|m| m.id == self.active_id)
    }

    /// Switch to `id`. Per §4.3's "handle monitor_id misses by falling back
    /// to the primary monitor rather than erroring", an unknown id is not
    /// an error here either — it's silently ignored, leaving the active
    /// monitor unchanged; the capture pipeline performs the actual primary
    /// fallback at capture time.
    pub fn switch(&mut self, id: &str) {
        if self.monitors.iter().any(|m| m.id == id) {
            self.active_id = id.to_string();
        }
    }

    /// Re-enumerate in place, preserving the active id if it still exists,
    /// otherwise falling back to the first available monitor.
    pub fn refresh(&mut self) {
        let monitors = platform_enumerate().unwrap_or_else(|| vec![synthetic_monitor()]);
        let keep_active = monitors.iter().any(|m| m.id == self.active_id);
        self.monitors = monitors;
        if !keep_active {
            self.active_id = self.monitors.first().map(|m| m.id.clone()).unwrap_or_default();
        }
    }
}

fn synthetic_monitor() -> MonitorDescriptor {
    MonitorDescriptor {
        id: "virtual-0".to_string(),
        name: "Virtual Display".to_string(),
        bounds: Rect { left: 0, top: 0, width: 1920, height: 1080 },
        effective_dpi_scale: 1.0,
    }
}

#[cfg(windows)]
fn platform_enumerate() -> Option<Vec<MonitorDescriptor>> {
    use windows::Win32::Foundation::{BOOL, LPARAM, RECT};
    use windows::Win32::Graphics::Gdi::{
        EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFOEXW,
    };

    unsafe extern "system" fn callback(
        monitor: HMONITOR,
        _hdc: HDC,
        _rect: *mut RECT,
        lparam: LPARAM,
    ) -> BOOL {
        let out = &mut *(lparam.0 as *mut Vec<MonitorDescriptor>);
        let mut info = MONITORINFOEXW::default();
        info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;
        if unsafe { GetMonitorInfoW(monitor, &mut info.monitorInfo as *mut _) }.as_bool() {
            let rc = info.monitorInfo.rcMonitor;
            let name_len = info.szDevice.iter().position(|&c| c == 0).unwrap_or(info.szDevice.len());
            let name = String::from_utf16_lossy(&info.szDevice[..name_len]);
            out.push(MonitorDescriptor {
                id: format!("{:?}", monitor.0),
                name,
                bounds: Rect {
                    left: rc.left,
                    top: rc.top,
                    width: (rc.right - rc.left).max(0) as u32,
                    height: (rc.bottom - rc.top).max(0) as u32,
                },
                effective_dpi_scale: monitor_dpi_scale(monitor),
            });
        }
        BOOL(1)
    }

    let mut monitors: Vec<MonitorDescriptor> = Vec::new();
    let lparam = LPARAM(&mut monitors as *mut _ as isize);
    let ok = unsafe { EnumDisplayMonitors(None, None, Some(callback), lparam) }.as_bool();
    if ok && !monitors.is_empty() { Some(monitors) } else { None }
}

#[cfg(windows)]
fn monitor_dpi_scale(monitor: windows::Win32::Graphics::Gdi::HMONITOR) -> f64 {
    use windows::Win32::UI::HiDpi::{GetDpiForMonitor, MDT_EFFECTIVE_DPI};
    let mut dpi_x = 96u32;
    let mut dpi_y = 96u32;
    let result = unsafe { GetDpiForMonitor(monitor, MDT_EFFECTIVE_DPI, &mut dpi_x, &mut dpi_y) };
    if result.is_ok() { dpi_x as f64 / 96.0 } else { 1.0 }
}

#[cfg(not(windows))]
fn platform_enumerate() -> Option<Vec<MonitorDescriptor>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_always_yields_at_least_one_monitor() {
        let registry = MonitorRegistry::enumerate();
        assert!(!registry.monitors().is_empty());
        assert!(!registry.active_id().is_empty());
    }

    #[test]
    fn switch_to_known_id_updates_active() {
        let mut registry = MonitorRegistry {
            monitors: vec![
                MonitorDescriptor {
                    id: "a".into(),
                    name: "A".into(),
                    bounds: Rect { left: 0, top: 0, width: 1920, height: 1080 },
                    effective_dpi_scale: 1.0,
                },
                MonitorDescriptor {
                    id: "b".into(),
                    name: "B".into(),
                    bounds: Rect { left: 1920, top: 0, width: 1920, height: 1080 },
                    effective_dpi_scale: 1.5,
                },
            ],
            active_id: "a".into(),
        };
        registry.switch("b");
        assert_eq!(registry.active_id(), "b");
        assert_eq!(registry.active().unwrap().effective_dpi_scale, 1.5);
    }

    #[test]
    fn switch_to_unknown_id_is_ignored() {
        let mut registry = MonitorRegistry {
            monitors: vec![synthetic_monitor()],
            active_id: "virtual-0".into(),
        };
        registry.switch("does-not-exist");
        assert_eq!(registry.active_id(), "virtual-0");
    }
}
