use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;
use std::time::SystemTime;

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("flagwall.toml"))
        .merge(Json::file("flagwall.json"))
        .merge(Yaml::file("flagwall.yaml"))
        .merge(Yaml::file("flagwall.yml"))
        .merge(Env::prefixed("FLAGWALL_").split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLAGWALL_").split("_"))
            .extract(),
        Some("json") => Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("FLAGWALL_").split("_"))
            .extract(),
        Some("yaml") | Some("yml") => Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("FLAGWALL_").split("_"))
            .extract(),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = config.map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.proxy.upstream_host.is_empty() {
        return Err(ConfigError::Validation("Upstream host must not be empty".into()).into());
    }

    if config.proxy.listen_port == config.proxy.upstream_port
        && config.proxy.listen_host == config.proxy.upstream_host
    {
        return Err(ConfigError::Validation(
            "Listen and upstream endpoints must differ or the proxy relays to itself".into(),
        )
        .into());
    }

    if let Some(tls) = &config.tls {
        if tls.alpn_protocols.is_empty() {
            return Err(
                ConfigError::Validation("TLS requires at least one ALPN protocol".into()).into(),
            );
        }
        if tls.upstream_tls && tls.ca_path.is_none() {
            return Err(ConfigError::Validation(
                "Upstream TLS verification requires a trusted CA path".into(),
            )
            .into());
        }
    }

    if config.capture.enabled && config.capture.rotate_secs == 0 {
        return Err(
            ConfigError::Validation("Capture rotation interval must be non-zero".into()).into(),
        );
    }

    // Fail early on patterns the filter context would reject anyway.
    compile_pattern(&config.filters.flag_pattern)?;
    for pattern in &config.filters.suspicious_patterns {
        compile_pattern(pattern)?;
    }
    for pattern in config
        .filters
        .guards
        .user_agent_allowlist
        .iter()
        .chain(&config.filters.guards.user_agent_denylist)
    {
        compile_pattern(pattern)?;
    }

    Ok(())
}

pub fn compile_pattern(pattern: &str) -> Result<regex::bytes::Regex> {
    regex::bytes::Regex::new(pattern).map_err(|e| {
        ConfigError::Pattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Modification time of the config file, used by the hot-reload poller.
pub fn file_mtime<P: AsRef<Path>>(path: P) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// First default config file present in `dir`, in the same precedence
/// order the figment stack merges them. Lets the mtime poller watch a
/// config that was picked up implicitly rather than via --config.
pub fn default_config_file_in(dir: &Path) -> Option<std::path::PathBuf> {
    ["flagwall.toml", "flagwall.json", "flagwall.yaml", "flagwall.yml"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}
