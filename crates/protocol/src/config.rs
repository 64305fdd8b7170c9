use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level persisted configuration, `<CommonAppData>/P2PRD/config.json`.
/// Every field has a default so a missing or partial file loads without
/// error; [`HostConfig::validate`] then reports semantic problems the
/// defaults can't catch (malformed URLs, an already-exhausted lockout
/// counter, and so on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "Uuid::new_v4")]
    pub host_id: Uuid,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub signaling_resolver_url: String,
    #[serde(default)]
    pub stun: Vec<String>,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub lockout: LockoutConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: Uuid::new_v4(),
            password_hash: String::new(),
            signaling_resolver_url: String::new(),
            stun: Vec::new(),
            turn: TurnConfig::default(),
            logging: LoggingConfig::default(),
            lockout: LockoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl TurnConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_log_files")]
    pub files: u32,
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_log_files() -> u32 {
    5
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { max_bytes: default_max_bytes(), files: default_log_files() }
    }
}

/// Consecutive-failure counter plus an optional lockout expiry, mirrored in
/// memory by the Lockout Engine and persisted here so a restart doesn't
/// reset an in-progress lockout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockoutConfig {
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
}

/// After this many consecutive authentication failures, the account locks.
pub const MAX_ATTEMPTS: u32 = 5;
/// Duration of a triggered lockout.
pub const LOCKOUT_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

impl HostConfig {
    /// Validate semantic constraints beyond what serde's field defaults
    /// catch. Returns `Ok(())` when there are no `ERROR:`-prefixed issues;
    /// `WARNING:`-prefixed issues are advisory and never fail validation.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.signaling_resolver_url.is_empty() {
            issues.push(
                "WARNING: signaling_resolver_url is empty; the host will not connect to any relay"
                    .to_string(),
            );
        } else if !is_http_url(&self.signaling_resolver_url)
            && !is_ws_url(&self.signaling_resolver_url)
        {
            issues.push(format!(
                "ERROR: signaling_resolver_url '{}' must start with http://, https://, ws://, or wss://",
                self.signaling_resolver_url
            ));
        }

        for url in &self.stun {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!("ERROR: stun URL '{url}' must start with stun: or stuns:"));
            }
        }

        if self.stun.is_empty() && !self.turn.is_configured() {
            issues.push(
                "WARNING: no STUN servers and no TURN server configured; ICE may fail across NATs"
                    .to_string(),
            );
        }

        if self.turn.is_configured() {
            if !self.turn.url.starts_with("turn:") && !self.turn.url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: turn.url '{}' must start with turn: or turns:",
                    self.turn.url
                ));
            }
            if self.turn.username.is_empty() || self.turn.credential.is_empty() {
                issues.push(
                    "ERROR: turn.url is set but turn.username or turn.credential is empty"
                        .to_string(),
                );
            }
        }

        if self.logging.max_bytes == 0 {
            issues.push("ERROR: logging.max_bytes must be greater than 0".to_string());
        }
        if self.logging.files == 0 {
            issues.push("ERROR: logging.files must be at least 1".to_string());
        }

        if self.lockout.failed_attempts >= MAX_ATTEMPTS {
            issues.push(format!(
                "ERROR: lockout.failed_attempts ({}) must be less than MAX_ATTEMPTS ({MAX_ATTEMPTS}); a persisted lockout should reset failed_attempts to 0",
                self.lockout.failed_attempts
            ));
        }

        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        if has_errors { Err(issues) } else { Ok(()) }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_json_object() {
        let config: HostConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.password_hash, "");
        assert_eq!(config.signaling_resolver_url, "");
        assert!(config.stun.is_empty());
        assert_eq!(config.logging.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.logging.files, 5);
        assert_eq!(config.lockout.failed_attempts, 0);
        assert!(config.lockout.locked_until.is_none());
    }

    #[test]
    fn default_trait_and_empty_json_agree_on_everything_but_host_id() {
        let from_default = HostConfig::default();
        let from_json: HostConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(from_default.password_hash, from_json.password_hash);
        assert_eq!(from_default.logging.max_bytes, from_json.logging.max_bytes);
    }

    #[test]
    fn partial_config_only_stun_section() {
        let json = r#"{"stun": ["stun:stun.l.google.com:19302"]}"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.stun, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert_eq!(config.logging.files, 5);
    }

    #[test]
    fn default_config_has_only_warnings_not_errors() {
        let config = HostConfig::default();
        let result = config.validate();
        assert!(result.is_ok(), "default config should validate with at most warnings");
    }

    #[test]
    fn empty_resolver_url_is_warning_not_error() {
        let config = HostConfig::default();
        let result = config.validate();
        assert!(result.is_ok());
    }

    #[test]
    fn malformed_resolver_url_is_error() {
        let mut config = HostConfig::default();
        config.signaling_resolver_url = "ftp://example.com".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("signaling_resolver_url")));
    }

    #[test]
    fn https_resolver_url_is_accepted() {
        let mut config = HostConfig::default();
        config.signaling_resolver_url = "https://resolver.example/endpoint".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn wss_resolver_url_is_accepted() {
        let mut config = HostConfig::default();
        config.signaling_resolver_url = "wss://signaling.example/ws".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_stun_prefix_is_error() {
        let mut config = HostConfig::default();
        config.stun = vec!["udp://stun.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("stun")));
    }

    #[test]
    fn turn_without_credentials_is_error() {
        let mut config = HostConfig::default();
        config.turn = TurnConfig {
            url: "turn:turn.example.com:3478".to_string(),
            username: String::new(),
            credential: String::new(),
        };
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("turn.username") || i.contains("turn.credential")));
    }

    #[test]
    fn fully_specified_turn_is_valid() {
        let mut config = HostConfig::default();
        config.stun = vec!["stun:stun.l.google.com:19302".to_string()];
        config.turn = TurnConfig {
            url: "turn:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "secret".to_string(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_max_bytes_is_error() {
        let mut config = HostConfig::default();
        config.logging.max_bytes = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("max_bytes")));
    }

    #[test]
    fn zero_log_files_is_error() {
        let mut config = HostConfig::default();
        config.logging.files = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("logging.files")));
    }

    #[test]
    fn failed_attempts_at_max_is_error() {
        let mut config = HostConfig::default();
        config.lockout.failed_attempts = MAX_ATTEMPTS;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("MAX_ATTEMPTS")));
    }

    #[test]
    fn failed_attempts_below_max_is_fine() {
        let mut config = HostConfig::default();
        config.lockout.failed_attempts = MAX_ATTEMPTS - 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn host_id_persists_through_round_trip() {
        let config = HostConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: HostConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.host_id, parsed.host_id);
    }

    #[test]
    fn lockout_locked_until_serializes_as_iso8601_when_present() {
        let mut config = HostConfig::default();
        let expiry = Utc::now() + chrono::Duration::minutes(5);
        config.lockout.locked_until = Some(expiry);
        let json = serde_json::to_value(&config).unwrap();
        let rendered = json["lockout"]["locked_until"].as_str().unwrap();
        assert!(rendered.contains('T'), "expected ISO-8601 timestamp, got {rendered}");
    }

    #[test]
    fn lockout_locked_until_is_null_when_absent() {
        let config = HostConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["lockout"]["locked_until"].is_null());
    }
}
