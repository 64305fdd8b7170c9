//! Owns the single on-disk copy of [`HostConfig`] and serializes every
//! load/save/update-in-place behind one mutex, per §5's "Config Store:
//! protected by a single mutex; all load/save/update-in-place serialize
//! here" rule. The Lockout Engine shares this same mutex rather than
//! keeping its own, since every lockout transition is persisted alongside
//! a config save.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use p2prd_protocol::{HostConfig, LOCKOUT_WINDOW, MAX_ATTEMPTS};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Directory name under the platform's common-app-data root, per §6.
const CONFIG_DIR_NAME: &str = "P2PRD";
const CONFIG_FILE_NAME: &str = "config.json";

pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<HostConfig>,
}

impl ConfigStore {
    /// Load the config at `dir/config.json`, creating a fresh default config
    /// (with a freshly generated `host_id`) if the file is absent. The
    /// directory is created and ACL-hardened (SYSTEM + Administrators only,
    /// see [`harden_acl`]) before the first write.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating config directory {}", dir.display()))?;
        harden_acl(dir)?;

        let path = dir.join(CONFIG_FILE_NAME);
        let config = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no existing config at {}, creating default", path.display());
                HostConfig::default()
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        if let Err(issues) = config.validate() {
            for issue in &issues {
                warn!("{issue}");
            }
        }

        let store = Self { path, inner: Mutex::new(config) };
        store.save_locked(&store.inner.lock().await).await?;
        Ok(store)
    }

    /// Default config directory per §6: `<CommonAppData>/P2PRD`.
    pub fn default_dir() -> PathBuf {
        #[cfg(windows)]
        {
            std::env::var_os("ProgramData")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
                .join(CONFIG_DIR_NAME)
        }
        #[cfg(not(windows))]
        {
            PathBuf::from("/etc").join(CONFIG_DIR_NAME.to_lowercase())
        }
    }

    pub async fn snapshot(&self) -> HostConfig {
        self.inner.lock().await.clone()
    }

    /// Apply `mutate` to the in-memory config and persist the result,
    /// holding the lock for the whole read-modify-write.
    pub async fn update(&self, mutate: impl FnOnce(&mut HostConfig)) -> Result<()> {
        let mut guard = self.inner.lock().await;
        mutate(&mut guard);
        self.save_locked(&guard).await
    }

    async fn save_locked(&self, config: &HostConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config).context("serializing config")?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming into place {}", self.path.display()))?;
        Ok(())
    }
}

/// Restrict the config directory to SYSTEM and Administrators. Best-effort:
/// a failure here is logged, not fatal — the process still runs, just with
/// weaker protection on the persisted TURN credentials (§9 Open Question:
/// ACL is the only at-rest protection for TURN credentials). Shells out to
/// `icacls` rather than driving `SetNamedSecurityInfoW`/`SetEntriesInAclW`
/// directly: the SID/ACL builder plumbing those APIs need is sizable for a
/// one-time directory grant, and `icacls` is what the service installer
/// (out of scope per §1) already uses to lock down the same tree.
#[cfg(windows)]
fn harden_acl(dir: &Path) -> Result<()> {
    let status = std::process::Command::new("icacls")
        .arg(dir)
        .args(["/inheritance:r"])
        .args(["/grant:r", "SYSTEM:(OI)(CI)F"])
        .args(["/grant:r", "*S-1-5-32-544:(OI)(CI)F"]) // BUILTIN\Administrators
        .status();

    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => {
            warn!("icacls exited with {s}, config directory ACL may be unhardened");
            Ok(())
        }
        Err(e) => {
            warn!("failed to invoke icacls: {e}, config directory ACL may be unhardened");
            Ok(())
        }
    }
}

#[cfg(not(windows))]
fn harden_acl(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o700);
    std::fs::set_permissions(dir, perms)
        .with_context(|| format!("restricting permissions on {}", dir.display()))
}

/// Consecutive-failure counter and time-bounded lockout, persisted through
/// the same [`ConfigStore`] mutex it shares (§4.2, §5).
pub struct LockoutEngine {
    store: Arc<ConfigStore>,
}

impl LockoutEngine {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Record a failed authentication attempt. On the `MAX_ATTEMPTS`th
    /// consecutive failure, triggers a lockout and resets the counter.
    pub async fn register_failure(&self) -> Result<()> {
        self.store
            .update(|config| {
                config.lockout.failed_attempts += 1;
                if config.lockout.failed_attempts >= MAX_ATTEMPTS {
                    config.lockout.locked_until = Some(Utc::now() + LOCKOUT_WINDOW);
                    config.lockout.failed_attempts = 0;
                }
            })
            .await
    }

    pub async fn register_success(&self) -> Result<()> {
        self.store
            .update(|config| {
                config.lockout.failed_attempts = 0;
                config.lockout.locked_until = None;
            })
            .await
    }

    /// Returns `Some(retry_after_ms)` while locked, opportunistically
    /// clearing an expired lockout (self-healing per §4.2).
    pub async fn is_locked(&self) -> Result<Option<u64>> {
        let snapshot = self.store.snapshot().await;
        let Some(locked_until) = snapshot.lockout.locked_until else {
            return Ok(None);
        };

        let now = Utc::now();
        if now >= locked_until {
            self.store
                .update(|config| {
                    config.lockout.locked_until = None;
                    config.lockout.failed_attempts = 0;
                })
                .await?;
            return Ok(None);
        }

        let retry_after_ms = (locked_until - now).num_milliseconds().max(0) as u64;
        Ok(Some(retry_after_ms))
    }
}
