//! Chrome/Chromium executable discovery.
//!
//! Resolution order: an explicitly configured path, the
//! `REPORT_HARVEST_CHROME` or `CHROME` environment variables, well-known
//! command names in `PATH`, then well-known install locations.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{HarvestError, Result};

/// Environment variables consulted for an executable path, in order.
const ENV_VARS: &[&str] = &["REPORT_HARVEST_CHROME", "CHROME"];

#[cfg(target_os = "macos")]
const KNOWN_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
];

#[cfg(all(unix, not(target_os = "macos")))]
const KNOWN_PATHS: &[&str] = &[
    "/opt/google/chrome/chrome",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
];

#[cfg(windows)]
const KNOWN_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
];

const KNOWN_COMMANDS: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

/// Looks for an installed Chrome/Chromium.
pub fn detect_chrome() -> Option<PathBuf> {
    for var in ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            let path = PathBuf::from(&value);
            if path.exists() {
                debug!("Chrome found via {}: {}", var, value);
                return Some(path);
            }
        }
    }

    for cmd in KNOWN_COMMANDS {
        if let Ok(path) = which::which(cmd) {
            debug!("Chrome found in PATH: {}", path.display());
            return Some(path);
        }
    }

    KNOWN_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(|p| {
            debug!("Chrome found at known path: {}", p.display());
            p.to_path_buf()
        })
}

/// Resolves the executable to launch, preferring `explicit` when given.
pub fn resolve_chrome(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        return Err(HarvestError::Browser(format!(
            "Configured Chrome executable does not exist: {}",
            path.display()
        )));
    }

    detect_chrome().ok_or_else(|| {
        HarvestError::Browser(
            "No Chrome/Chromium installation found; install one or set REPORT_HARVEST_CHROME"
                .to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_lists_not_empty() {
        assert!(!KNOWN_PATHS.is_empty());
        assert!(!KNOWN_COMMANDS.is_empty());
        assert_eq!(ENV_VARS[0], "REPORT_HARVEST_CHROME");
    }

    #[test]
    fn test_detect_chrome_prefers_env_var() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var(ENV_VARS[0], file.path());
        let detected = detect_chrome();
        std::env::remove_var(ENV_VARS[0]);
        assert_eq!(detected.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_resolve_explicit_missing_path() {
        let err = resolve_chrome(Some("/definitely/not/here/chrome")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_explicit_existing_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(resolve_chrome(Some(path)).unwrap(), file.path());
    }
}
