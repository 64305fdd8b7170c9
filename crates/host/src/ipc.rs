//! IPC Surface (§4.9). No file in the teacher or example pack implements a
//! local authenticated control-plane pipe, so this module is net-new code —
//! grounded on this crate's own `capture.rs`/`desktop.rs` style of raw Win32
//! FFI behind a small platform split, rather than on any teacher file.
//! Request parsing/dispatch is pure and platform-independent (`handle_line`)
//! so it's fully testable without a real pipe; only the transport loop is
//! platform-specific.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::hash_password;
use crate::config_store::ConfigStore;

pub const PIPE_NAME: &str = "P2PRD.Config";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcRequest {
    Status,
    SetPassword { password: String },
    SetResolver { resolver_url: String },
    SetIce { #[serde(default)] stun: Vec<String>, turn_url: String, turn_username: String, turn_credential: String },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcError {
    MissingType,
    UnknownType,
    EmptyPassword,
    EmptyResolver,
    EmptyIce,
    Exception,
}

/// Parse and dispatch one request line against the shared config. Returns
/// the serialized JSON response line (no trailing newline).
pub async fn handle_line(line: &str, config: &Arc<ConfigStore>) -> String {
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return error_response(IpcError::Exception),
    };
    if raw.get("type").is_none() {
        return error_response(IpcError::MissingType);
    }

    let request: IpcRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(_) => return error_response(IpcError::UnknownType),
    };

    match request {
        IpcRequest::Status => {
            let snapshot = config.snapshot().await;
            serde_json::json!({
                "host_id": snapshot.host_id,
                "has_password": !snapshot.password_hash.is_empty(),
                "signaling_resolver_url": snapshot.signaling_resolver_url,
                "stun": snapshot.stun,
                "turn": snapshot.turn,
            })
            .to_string()
        }
        IpcRequest::SetPassword { password } => {
            if password.is_empty() {
                return error_response(IpcError::EmptyPassword);
            }
            match hash_password(&password) {
                Ok(hash) => {
                    let result = config
                        .update(|c| {
                            c.password_hash = hash.clone();
                            c.lockout.failed_attempts = 0;
                            c.lockout.locked_until = None;
                        })
                        .await;
                    match result {
                        Ok(()) => serde_json::json!({"status": "ok"}).to_string(),
                        Err(_) => error_response(IpcError::Exception),
                    }
                }
                Err(_) => error_response(IpcError::Exception),
            }
        }
        IpcRequest::SetResolver { resolver_url } => {
            if resolver_url.is_empty() {
                return error_response(IpcError::EmptyResolver);
            }
            match config.update(|c| c.signaling_resolver_url = resolver_url.clone()).await {
                Ok(()) => serde_json::json!({"status": "ok"}).to_string(),
                Err(_) => error_response(IpcError::Exception),
            }
        }
        IpcRequest::SetIce { stun, turn_url, turn_username, turn_credential } => {
            if stun.is_empty() && turn_url.is_empty() {
                return error_response(IpcError::EmptyIce);
            }
            let result = config
                .update(|c| {
                    c.stun = stun.clone();
                    c.turn.url = turn_url.clone();
                    c.turn.username = turn_username.clone();
                    c.turn.credential = turn_credential.clone();
                })
                .await;
            match result {
                Ok(()) => serde_json::json!({"status": "ok"}).to_string(),
                Err(_) => error_response(IpcError::Exception),
            }
        }
    }
}

fn error_response(error: IpcError) -> String {
    serde_json::json!({"status": "error", "error": error}).to_string()
}

#[cfg(windows)]
pub async fn run_ipc_server(config: Arc<ConfigStore>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let server = match windows_pipe::create_instance() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to create IPC pipe instance");
                return Err(e);
            }
        };

        tokio::select! {
            connected = server.connect() => {
                if let Err(e) = connected {
                    warn!(error = %e, "IPC pipe connect failed");
                    continue;
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }

        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(server);
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let response = handle_line(&line, &config).await;
                        if writer.write_all(format!("{response}\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "IPC pipe read error");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(windows)]
mod windows_pipe {
    //! Raw named-pipe construction with an explicit DACL (SYSTEM +
    //! Administrators only), since neither tokio's `named_pipe::ServerOptions`
    //! nor the `windows` crate's safe wrappers expose a security-descriptor
    //! parameter — the same "drop to raw Win32 for the one primitive the safe
    //! wrapper doesn't cover" shape as `config_store.rs`'s `icacls` call and
    //! `capture.rs`'s DXGI duplication setup.

    use std::os::windows::io::FromRawHandle;

    use tokio::net::windows::named_pipe::NamedPipeServer;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Security::Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW;
    use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES, SDDL_REVISION_1};
    use windows::Win32::Storage::FileSystem::FILE_FLAG_OVERLAPPED;
    use windows::Win32::System::Pipes::{
        CreateNamedPipeW, PIPE_ACCESS_DUPLEX, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
    };
    use windows::core::PCWSTR;

    // SYSTEM (SY) and BUILTIN\Administrators (BA) get full access; nobody else.
    const SDDL: &str = "D:(A;;GA;;;SY)(A;;GA;;;BA)";

    pub fn create_instance() -> anyhow::Result<NamedPipeServer> {
        let name: Vec<u16> = format!(r"\\.\pipe\{}", super::PIPE_NAME).encode_utf16().chain(std::iter::once(0)).collect();
        let sddl: Vec<u16> = SDDL.encode_utf16().chain(std::iter::once(0)).collect();

        unsafe {
            let mut descriptor = PSECURITY_DESCRIPTOR::default();
            ConvertStringSecurityDescriptorToSecurityDescriptorW(PCWSTR(sddl.as_ptr()), SDDL_REVISION_1, &mut descriptor, None)
                .map_err(|e| anyhow::anyhow!("ConvertStringSecurityDescriptorToSecurityDescriptorW failed: {e}"))?;

            let attributes = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor.0,
                bInheritHandle: false.into(),
            };

            let handle = CreateNamedPipeW(
                PCWSTR(name.as_ptr()),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                4096,
                4096,
                0,
                Some(&attributes),
            );

            if handle == HANDLE::default() || handle.is_invalid() {
                anyhow::bail!("CreateNamedPipeW failed: {:?}", windows::core::Error::from_win32());
            }

            Ok(NamedPipeServer::from_raw_handle(handle.0 as *mut _)?)
        }
    }
}

#[cfg(not(windows))]
pub async fn run_ipc_server(config: Arc<ConfigStore>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
    // Non-Windows builds have no production deployment target (§1 scope is
    // Windows-only) but still need something to exercise in tests: a
    // best-effort Unix domain socket under the config directory, restricted
    // to owner (0700), stands in for the ACL-restricted pipe.
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    let path = std::env::temp_dir().join(format!("{}.sock", PIPE_NAME));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::os::unix::fs::PermissionsExt::from_mode(0o700))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let response = handle_line(&line, &config).await;
                        if writer.write_all(format!("{response}\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;

    struct TempDir(std::path::PathBuf);
    impl TempDir {
        fn new(label: &str) -> Self {
            let path = std::env::temp_dir().join(format!("p2prd-ipc-test-{label}-{}", std::process::id()));
            let _ = std::fs::remove_dir_all(&path);
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }
        fn path(&self) -> &std::path::Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    async fn config_in(label: &str) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::open(TempDir::new(label).path()).await.unwrap())
    }

    #[tokio::test]
    async fn missing_type_is_structured_error() {
        let response = handle_line("{}", &config_in("a").await).await;
        assert!(response.contains("missing_type"));
    }

    #[tokio::test]
    async fn unknown_type_is_structured_error() {
        let config = config_in("b").await;
        let response = handle_line(r#"{"type":"nonsense"}"#, &config).await;
        assert!(response.contains("unknown_type"));
    }

    #[tokio::test]
    async fn malformed_json_is_structured_error() {
        let config = config_in("c").await;
        let response = handle_line("not json", &config).await;
        assert!(response.contains("exception"));
    }

    #[tokio::test]
    async fn empty_password_is_rejected() {
        let config = config_in("d").await;
        let response = handle_line(r#"{"type":"set_password","password":""}"#, &config).await;
        assert!(response.contains("empty_password"));
    }

    #[tokio::test]
    async fn set_password_persists_a_hash() {
        let config = config_in("e").await;
        let response = handle_line(r#"{"type":"set_password","password":"secret"}"#, &config).await;
        assert!(response.contains("\"ok\""));
        assert!(!config.snapshot().await.password_hash.is_empty());
    }

    #[tokio::test]
    async fn empty_resolver_is_rejected() {
        let config = config_in("f").await;
        let response = handle_line(r#"{"type":"set_resolver","resolver_url":""}"#, &config).await;
        assert!(response.contains("empty_resolver"));
    }

    #[tokio::test]
    async fn set_resolver_persists_the_url() {
        let config = config_in("g").await;
        let response = handle_line(r#"{"type":"set_resolver","resolver_url":"wss://relay.example/ws"}"#, &config).await;
        assert!(response.contains("\"ok\""));
        assert_eq!(config.snapshot().await.signaling_resolver_url, "wss://relay.example/ws");
    }

    #[tokio::test]
    async fn set_ice_with_no_stun_and_no_turn_is_rejected() {
        let config = config_in("h").await;
        let response = handle_line(r#"{"type":"set_ice","stun":[],"turn_url":"","turn_username":"","turn_credential":""}"#, &config).await;
        assert!(response.contains("empty_ice"));
    }

    #[tokio::test]
    async fn set_ice_with_stun_only_is_accepted() {
        let config = config_in("i").await;
        let response = handle_line(
            r#"{"type":"set_ice","stun":["stun:stun.example:3478"],"turn_url":"","turn_username":"","turn_credential":""}"#,
            &config,
        )
        .await;
        assert!(response.contains("\"ok\""));
    }

    #[tokio::test]
    async fn status_reports_password_presence() {
        let config = config_in("j").await;
        let before = handle_line(r#"{"type":"status"}"#, &config).await;
        assert!(before.contains("\"has_password\":false"));
        handle_line(r#"{"type":"set_password","password":"secret"}"#, &config).await;
        let after = handle_line(r#"{"type":"status"}"#, &config).await;
        assert!(after.contains("\"has_password\":true"));
    }
}
