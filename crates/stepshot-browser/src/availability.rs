use std::path::{Path, PathBuf};

use crate::playwright_cli::{DriverConfig, RealDriverHandle};

/// Outcome of probing the environment for the real driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAvailability {
    Available(RealDriverHandle),
    Unavailable(String),
}

impl BackendAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Checks whether the configured driver executable exists.
pub fn probe_real_driver(config: &DriverConfig) -> BackendAvailability {
    let Some(configured) = config.playwright_cli.as_ref() else {
        return BackendAvailability::Unavailable("no playwright driver configured".to_string());
    };

    match resolve_executable(configured) {
        Some(path) => BackendAvailability::Available(RealDriverHandle::new(path, config.clone())),
        None => BackendAvailability::Unavailable(format!(
            "playwright driver '{}' was not found or is not executable",
            configured.display()
        )),
    }
}

fn resolve_executable(candidate: &Path) -> Option<PathBuf> {
    if candidate.as_os_str().is_empty() {
        return None;
    }
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return is_executable_file(candidate).then(|| candidate.to_path_buf());
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(candidate))
        .find(|path| is_executable_file(path))
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
