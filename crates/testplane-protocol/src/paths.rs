use std::path::PathBuf;

/// Directory holding controller-side sockets for spawned test hosts.
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("testplane")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/testplane-{uid}"))
    }
}

/// Returns the config directory path for testplane.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("testplane")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("testplane")
    } else {
        PathBuf::from("/tmp/testplane")
    }
}

/// Returns the config file path.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
