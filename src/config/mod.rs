mod loader;
mod schema;

pub use loader::{
    compile_pattern, default_config_file_in, file_mtime, load_from_env_or_file, load_from_path,
    validate,
};
pub use schema::{
    CaptureConfig, CaptureFormat, Config, FilterConfig, GuardConfig, ProxyConfig, SessionConfig,
    TlsConfig,
};
