//! Runtime configuration.
//!
//! Loaded from an optional `tdm.toml` (user config dir, then `/etc/tdm/`),
//! with environment variables taking precedence. The environment is the
//! interface the platform actually uses; the file exists for development
//! setups.

use std::os::fd::RawFd;
use std::path::PathBuf;

use serde::Deserialize;

/// Default directory scanned for backend modules.
pub const DEFAULT_MODULE_DIR: &str = "/usr/lib/tdm";

/// Default backend module name tried before scanning.
pub const DEFAULT_MODULE: &str = "libtdm-default.so";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend module file name (`TDM_MODULE`).
    pub module: Option<String>,

    /// Directory holding backend modules.
    pub module_dir: PathBuf,

    /// Run the event loop on a worker thread (`TDM_THREAD`, default on).
    pub thread: bool,

    /// Route logs to a file instead of stdout (`TDM_DLOG`).
    pub dlog: bool,

    /// Comma-separated debug modules (`TDM_DEBUG`), e.g. "buffer,thread".
    pub debug: Option<String>,

    /// Dump spec (`TDM_DEBUG_DUMP`), e.g. "layer,pp@/tmp/dump".
    pub dump: Option<String>,

    /// Log a warning when the global lock takes longer than this to
    /// acquire (`TDM_MUTEX_TIMEOUT_MS`). Off when absent.
    pub mutex_timeout_ms: Option<u64>,

    /// Where the wire socket lives; defaults to `XDG_RUNTIME_DIR`.
    pub socket_dir: Option<PathBuf>,

    /// Master DRM fd inherited from the session manager
    /// (`TDM_DRM_MASTER_FD`).
    #[serde(skip)]
    pub drm_master_fd: Option<RawFd>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            module: None,
            module_dir: PathBuf::from(DEFAULT_MODULE_DIR),
            thread: true,
            dlog: false,
            debug: None,
            dump: None,
            mutex_timeout_ms: None,
            socket_dir: None,
            drm_master_fd: None,
        }
    }
}

impl Config {
    /// Load configuration from file, then apply environment overrides.
    pub fn load() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tdm/tdm.toml")),
            Some(PathBuf::from("/etc/tdm/tdm.toml")),
        ];

        let mut config = Config::default();
        for path in config_paths.into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match toml::from_str::<Config>(&content) {
                    Ok(parsed) => {
                        tracing::info!(?path, "loaded configuration");
                        config = parsed;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "failed to parse config");
                    }
                },
                Err(e) => {
                    tracing::warn!(?path, error = %e, "failed to read config");
                }
            }
        }

        config.apply_env();
        config
    }

    /// Fold the `TDM_*` environment on top of whatever the file provided.
    pub fn apply_env(&mut self) {
        if let Ok(module) = std::env::var("TDM_MODULE") {
            if !module.is_empty() {
                self.module = Some(module);
            }
        }
        if let Ok(thread) = std::env::var("TDM_THREAD") {
            self.thread = thread.trim() != "0";
        }
        if std::env::var_os("TDM_DLOG").is_some() {
            self.dlog = true;
        }
        if let Ok(debug) = std::env::var("TDM_DEBUG") {
            self.debug = Some(debug);
        }
        for (var, module) in [
            ("TDM_DEBUG_BUFFER", "buffer"),
            ("TDM_DEBUG_THREAD", "thread"),
            ("TDM_DEBUG_MUTEX", "mutex"),
        ] {
            if matches!(std::env::var(var), Ok(v) if v.contains('1')) {
                match &mut self.debug {
                    Some(modules) => {
                        modules.push(',');
                        modules.push_str(module);
                    }
                    None => self.debug = Some(module.to_string()),
                }
            }
        }
        if let Ok(dump) = std::env::var("TDM_DEBUG_DUMP") {
            self.dump = Some(dump);
        }
        if let Ok(timeout) = std::env::var("TDM_MUTEX_TIMEOUT_MS") {
            self.mutex_timeout_ms = timeout.trim().parse().ok();
        }
        if let Ok(fd) = std::env::var("TDM_DRM_MASTER_FD") {
            self.drm_master_fd = fd.trim().parse().ok();
        }
    }

    /// Directory the wire socket is created in.
    pub fn runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.socket_dir {
            return dir.clone();
        }
        std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }
}

/// Just enough XDG base-directory lookup for the config search.
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(dir));
        }
        let home = std::env::var_os("HOME")?;
        Some(PathBuf::from(home).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_threaded() {
        let config = Config::default();
        assert!(config.thread);
        assert_eq!(config.module_dir, PathBuf::from(DEFAULT_MODULE_DIR));
    }

    #[test]
    fn file_fields_parse() {
        let config: Config = toml::from_str(
            r#"
            module = "libtdm-drm.so"
            thread = false
            mutex_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.module.as_deref(), Some("libtdm-drm.so"));
        assert!(!config.thread);
        assert_eq!(config.mutex_timeout_ms, Some(500));
    }
}
