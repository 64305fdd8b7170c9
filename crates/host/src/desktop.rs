//! `DesktopSwitcher` capability trait (§9 redesign notes): isolates the
//! "scoped switch onto the active input desktop" primitive behind a trait so
//! production code drives real Win32 desktop-station calls while tests drive
//! an in-memory fake. The returned guard's `Drop` restores the prior desktop
//! on every exit path, including panics — per §9's "a missed restore
//! corrupts the service thread's desktop affinity."

use tracing::debug;

/// RAII guard returned by [`DesktopSwitcher::enter_active_desktop`]. Holding
/// it keeps the calling thread attached to the active input desktop; it is
/// released (and the prior desktop restored) when the guard drops.
pub trait DesktopGuard: Send {}

pub trait DesktopSwitcher: Send + Sync {
    fn enter_active_desktop(&self) -> anyhow::Result<Box<dyn DesktopGuard>>;
}

#[cfg(windows)]
pub struct WindowsDesktopSwitcher;

#[cfg(windows)]
impl DesktopSwitcher for WindowsDesktopSwitcher {
    fn enter_active_desktop(&self) -> anyhow::Result<Box<dyn DesktopGuard>> {
        use windows::Win32::System::StationsAndDesktops::{
            DESKTOP_SWITCHDESKTOP, GetThreadDesktop, OpenInputDesktop, SetThreadDesktop,
        };
        use windows::Win32::System::Threading::GetCurrentThreadId;

        unsafe {
            let prior = GetThreadDesktop(GetCurrentThreadId())
                .map_err(|e| anyhow::anyhow!("GetThreadDesktop failed: {e}"))?;

            let input_desktop = OpenInputDesktop(Default::default(), false, DESKTOP_SWITCHDESKTOP.0 as u32)
                .map_err(|e| anyhow::anyhow!("OpenInputDesktop failed: {e}"))?;

            SetThreadDesktop(input_desktop)
                .map_err(|e| anyhow::anyhow!("SetThreadDesktop failed: {e}"))?;

            Ok(Box::new(WindowsDesktopGuard { prior, entered: input_desktop }))
        }
    }
}

#[cfg(windows)]
struct WindowsDesktopGuard {
    prior: windows::Win32::System::StationsAndDesktops::HDESK,
    entered: windows::Win32::System::StationsAndDesktops::HDESK,
}

#[cfg(windows)]
impl DesktopGuard for WindowsDesktopGuard {}

#[cfg(windows)]
impl Drop for WindowsDesktopGuard {
    fn drop(&mut self) {
        use windows::Win32::System::StationsAndDesktops::{CloseDesktop, SetThreadDesktop};
        unsafe {
            let _ = SetThreadDesktop(self.prior);
            let _ = CloseDesktop(self.entered);
        }
    }
}

/// In-memory fake for tests: records enter/exit counts, never touches any
/// OS desktop. Also usable on non-Windows builds as the only implementation.
pub struct FakeDesktopSwitcher {
    pub entries: std::sync::atomic::AtomicU64,
    pub exits: std::sync::atomic::AtomicU64,
}

impl Default for FakeDesktopSwitcher {
    fn default() -> Self {
        Self { entries: std::sync::atomic::AtomicU64::new(0), exits: std::sync::atomic::AtomicU64::new(0) }
    }
}

impl DesktopSwitcher for FakeDesktopSwitcher {
    fn enter_active_desktop(&self) -> anyhow::Result<Box<dyn DesktopGuard>> {
        self.entries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!("fake desktop switcher: entered");
        Ok(Box::new(FakeGuard))
    }
}

struct FakeGuard;
impl DesktopGuard for FakeGuard {}
impl Drop for FakeGuard {
    fn drop(&mut self) {
        debug!("fake desktop switcher: exited");
    }
}

#[cfg(not(windows))]
pub type PlatformDesktopSwitcher = FakeDesktopSwitcher;
#[cfg(windows)]
pub type PlatformDesktopSwitcher = WindowsDesktopSwitcher;
