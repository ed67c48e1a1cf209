//! Where to look for the OpenCL driver library.

use std::path::PathBuf;

/// Environment variable naming an explicit driver library to try first.
pub const LIBRARY_ENV: &str = "CLMATH_OPENCL_LIBRARY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Library names or paths handed to the dynamic loader, tried in order.
    pub library_candidates: Vec<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            library_candidates: default_candidates()
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl BackendConfig {
    /// Platform defaults, preceded by `CLMATH_OPENCL_LIBRARY` when it is set.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(LIBRARY_ENV) {
            Ok(path) if !path.trim().is_empty() => config.with_library(path.trim()),
            _ => config,
        }
    }

    /// Puts `path` in front of the current candidates.
    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.library_candidates.retain(|p| *p != path);
        self.library_candidates.insert(0, path);
        self
    }

    pub(crate) fn describe_candidates(&self) -> String {
        self.library_candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(target_os = "windows")]
fn default_candidates() -> &'static [&'static str] {
    &["OpenCL.dll"]
}

#[cfg(target_os = "macos")]
fn default_candidates() -> &'static [&'static str] {
    &["/System/Library/Frameworks/OpenCL.framework/OpenCL"]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn default_candidates() -> &'static [&'static str] {
    &["libOpenCL.so.1", "libOpenCL.so"]
}
