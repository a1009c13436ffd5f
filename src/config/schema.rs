use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub filters: FilterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Accept backlog. The historical default of 1 lets only a single
    /// unaccepted connection queue; raise it for busier services.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_fd_limit")]
    pub fd_limit: u64,
    /// Optional per-connection idle timeout in seconds. Disabled by
    /// default: a hung peer then holds its two descriptors until the
    /// fd limit is hit.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default = "default_alpn")]
    pub alpn_protocols: Vec<String>,
    /// Dial the upstream over TLS as well, verifying against `ca_path`.
    #[serde(default)]
    pub upstream_tls: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_capture_dir")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: CaptureFormat,
    #[serde(default = "default_rotate_secs")]
    pub rotate_secs: u64,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    #[default]
    Pcap,
    Pcapng,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default = "default_flag_pattern")]
    pub flag_pattern: String,
    #[serde(default = "default_flag_replacement")]
    pub flag_replacement: String,
    /// Instead of substituting flags in place, discard suspicious
    /// traffic outright (canned 500 for HTTP, force-close for raw TCP).
    #[serde(default)]
    pub block_suspicious: bool,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Reassemble HTTP/1.x messages before filtering.
    #[serde(default)]
    pub http_reframing: bool,
    /// Byte regexes matched against requests and request history; a hit
    /// marks the session compromised and redacts the response.
    #[serde(default)]
    pub suspicious_patterns: Vec<String>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub guards: GuardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_session_limit")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfig {
    /// Empty list disables the method allow-list.
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub max_parameter_count: Option<usize>,
    #[serde(default)]
    pub max_parameter_length: Option<usize>,
    #[serde(default)]
    pub reject_nonprintable_params: bool,
    #[serde(default)]
    pub user_agent_allowlist: Vec<String>,
    #[serde(default)]
    pub user_agent_denylist: Vec<String>,
    /// Accepted content codings for the Accept-Encoding request header;
    /// empty list disables the check.
    #[serde(default)]
    pub allowed_encodings: Vec<String>,
    /// Redact responses carrying more than one flag.
    #[serde(default)]
    pub detect_duplicate_flags: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_capture_dir(),
            format: CaptureFormat::default(),
            rotate_secs: default_rotate_secs(),
            service_name: default_service_name(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            flag_pattern: default_flag_pattern(),
            flag_replacement: default_flag_replacement(),
            block_suspicious: false,
            history_cap: default_history_cap(),
            http_reframing: false,
            suspicious_patterns: Vec::new(),
            session: SessionConfig::default(),
            guards: GuardConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_session_cookie(),
            ttl_secs: default_session_ttl(),
            max_entries: default_session_limit(),
        }
    }
}

// Default value functions
fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    1
}

fn default_fd_limit() -> u64 {
    16384
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_alpn() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("/tmp/pcaps")
}

fn default_rotate_secs() -> u64 {
    60
}

fn default_service_name() -> String {
    "service".to_string()
}

fn default_flag_pattern() -> String {
    "[A-Z0-9]{31}=".to_string()
}

fn default_flag_replacement() -> String {
    "FLAG_REDACTED".to_string()
}

fn default_history_cap() -> usize {
    1024 * 1024
}

fn default_session_cookie() -> String {
    "session".to_string()
}

fn default_session_ttl() -> u64 {
    30
}

fn default_session_limit() -> usize {
    4000
}
