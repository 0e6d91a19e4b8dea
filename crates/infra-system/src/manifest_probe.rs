// Browser native-messaging manifest probe (read-only startup diagnostic)
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_HOST_NAME: &str = "org.hellyes.hellyes";

/// A browser whose manifest names our host with a non-empty `path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredBrowser {
    pub browser: &'static str,
    pub manifest: PathBuf,
}

pub struct ManifestProbe {
    home: PathBuf,
    host_name: String,
}

impl ManifestProbe {
    pub fn new(home: impl Into<PathBuf>, host_name: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            host_name: host_name.into(),
        }
    }

    /// Manifest directories relative to the home directory, per browser
    #[cfg(target_os = "macos")]
    fn locations() -> &'static [(&'static str, &'static str)] {
        &[
            ("Chrome", "Library/Application Support/Google/Chrome/NativeMessagingHosts"),
            ("Chromium", "Library/Application Support/Chromium/NativeMessagingHosts"),
            ("Firefox", "Library/Application Support/Mozilla/NativeMessagingHosts"),
            (
                "Brave",
                "Library/Application Support/BraveSoftware/Brave-Browser/NativeMessagingHosts",
            ),
        ]
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn locations() -> &'static [(&'static str, &'static str)] {
        &[
            ("Chrome", ".config/google-chrome/NativeMessagingHosts"),
            ("Chromium", ".config/chromium/NativeMessagingHosts"),
            ("Firefox", ".mozilla/native-messaging-hosts"),
            ("Brave", ".config/BraveSoftware/Brave-Browser/NativeMessagingHosts"),
        ]
    }

    // manifests are registered in the registry there, which we do not read
    #[cfg(not(unix))]
    fn locations() -> &'static [(&'static str, &'static str)] {
        &[]
    }

    pub fn manifest_path(&self, relative_dir: &str) -> PathBuf {
        self.home
            .join(relative_dir)
            .join(format!("{}.json", self.host_name))
    }

    fn names_host(&self, manifest: &Path) -> bool {
        let Ok(bytes) = std::fs::read(manifest) else {
            return false;
        };
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(data) => {
                data.get("name").and_then(|n| n.as_str()) == Some(self.host_name.as_str())
                    && data
                        .get("path")
                        .and_then(|p| p.as_str())
                        .is_some_and(|p| !p.is_empty())
            }
            Err(e) => {
                debug!(manifest = %manifest.display(), error = %e, "Unreadable manifest");
                false
            }
        }
    }

    pub fn configured_browsers(&self) -> Vec<ConfiguredBrowser> {
        Self::locations()
            .iter()
            .map(|(browser, dir)| (*browser, self.manifest_path(dir)))
            .filter(|(_, manifest)| self.names_host(manifest))
            .map(|(browser, manifest)| ConfiguredBrowser { browser, manifest })
            .collect()
    }

    /// Log the result; never fails
    pub fn report(&self) -> Vec<ConfiguredBrowser> {
        if Self::locations().is_empty() {
            debug!("Browser manifest check not supported on this platform");
            return Vec::new();
        }
        let found = self.configured_browsers();
        if found.is_empty() {
            warn!(
                host = %self.host_name,
                "Browser manifest not configured; the extension cannot hand off jobs"
            );
        } else {
            let browsers: Vec<&str> = found.iter().map(|b| b.browser).collect();
            info!(host = %self.host_name, browsers = ?browsers, "Browser manifest configured");
        }
        found
    }
}
