//! Vendor backend module loading.
//!
//! Candidate order: the configured module name, the default name, then an
//! alphabetical scan of the module directory. A candidate is accepted once
//! its exported descriptor passes the ABI check.

use std::path::{Path, PathBuf};

use crate::backend::{self, BackendModule};
use crate::config::{Config, DEFAULT_MODULE};
use crate::error::{Error, Result};

/// A dlopened backend module. The descriptor pointer stays valid for as
/// long as the library handle lives; keep them together.
pub(crate) struct LoadedModule {
    descriptor: *const BackendModule,
    _library: libloading::Library,
    pub path: PathBuf,
}

// The library (and with it the descriptor's static data) is not unloaded
// until drop, and the descriptor itself is immutable.
unsafe impl Send for LoadedModule {}

impl LoadedModule {
    pub fn descriptor(&self) -> &BackendModule {
        unsafe { &*self.descriptor }
    }
}

/// Load the first acceptable backend module.
pub(crate) fn load(config: &Config) -> Result<LoadedModule> {
    let name = config.module.clone().unwrap_or_else(|| DEFAULT_MODULE.to_string());

    match load_file(&config.module_dir.join(&name)) {
        Ok(module) => return Ok(module),
        Err(e) => {
            tracing::warn!(module = %name, error = %e, "module failed to load, scanning");
        }
    }

    let mut candidates: Vec<PathBuf> = match std::fs::read_dir(&config.module_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "so"))
            .collect(),
        Err(e) => {
            tracing::error!(dir = %config.module_dir.display(), error = %e, "no module directory");
            return Err(Error::BadModule);
        }
    };
    candidates.sort();

    for path in candidates {
        match load_file(&path) {
            Ok(module) => return Ok(module),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "module rejected"),
        }
    }

    tracing::error!(dir = %config.module_dir.display(), "no usable backend module");
    Err(Error::BadModule)
}

fn load_file(path: &Path) -> Result<LoadedModule> {
    let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
        tracing::debug!(path = %path.display(), error = %e, "dlopen failed");
        Error::BadModule
    })?;

    let descriptor: *const BackendModule = unsafe {
        match library.get::<*const BackendModule>(backend::MODULE_DATA_SYMBOL) {
            Ok(symbol) => *symbol,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "module has no descriptor");
                return Err(Error::BadModule);
            }
        }
    };
    if descriptor.is_null() {
        tracing::error!(path = %path.display(), "module descriptor is null");
        return Err(Error::BadModule);
    }

    backend::check_module(unsafe { &*descriptor })?;

    tracing::info!(path = %path.display(), "loaded backend module");
    Ok(LoadedModule {
        descriptor,
        _library: library,
        path: path.to_path_buf(),
    })
}
