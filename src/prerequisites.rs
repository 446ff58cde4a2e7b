//! Required-tool lookup.
//!
//! Runs before anything touches a cluster, so a missing binary is reported
//! with zero side effects.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Resolves tool names against a search path.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    search_path: Option<OsString>,
}

impl Default for ToolLocator {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ToolLocator {
    /// Uses the process `PATH`.
    pub fn from_env() -> Self {
        Self {
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Uses an explicit search path (same syntax as `PATH`).
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }

    /// Returns the resolved location of `tool`, if present.
    ///
    /// Names containing a path separator are checked as paths directly.
    pub fn locate(&self, tool: &str) -> Option<PathBuf> {
        let direct = Path::new(tool);
        if direct.components().count() > 1 {
            return is_executable(direct).then(|| direct.to_path_buf());
        }

        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(tool))
            .find(|candidate| is_executable(candidate))
    }

    /// Checks every tool, reporting all missing ones at once.
    pub fn check<'a>(&self, tools: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let mut missing = Vec::new();

        for tool in tools {
            match self.locate(tool) {
                Some(path) => tracing::debug!(tool, path = %path.display(), "found tool"),
                None => missing.push(tool.to_string()),
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingTools(missing))
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
