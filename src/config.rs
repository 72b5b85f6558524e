use crate::errors::*;
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const LOCAL_CONFIG_FILE: &str = ".urpm.local";

pub const PROD_BASE_DIR: &str = "/var/lib/urpm";
pub const DEV_BASE_DIR: &str = "/var/lib/urpm-dev";

pub const PROD_DAEMON_PORT: u16 = 9876;
pub const DEV_DAEMON_PORT: u16 = 9877;
// Distinct discovery ports so a prod and a dev daemon can coexist on one LAN
pub const PROD_DISCOVERY_PORT: u16 = 9878;
pub const DEV_DISCOVERY_PORT: u16 = 9879;

pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(60);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEV_BROADCAST_INTERVAL: Duration = Duration::from_secs(15);
pub const DEV_PEER_TIMEOUT: Duration = Duration::from_secs(45);

/// Process-wide startup context, resolved once in main() and passed
/// explicitly to every subsystem. Never mutated after startup.
#[derive(Debug, Clone)]
pub struct Context {
    pub base_dir: PathBuf,
    pub dev_mode: bool,
    pub daemon_port: u16,
    pub discovery_port: u16,
    pub broadcast_interval: Duration,
    pub peer_timeout: Duration,
    pub color: bool,
}

impl Context {
    pub fn detect() -> Context {
        let (base_dir, dev_mode) = detect_base_dir();
        Context::with_base_dir(base_dir, dev_mode)
    }

    pub fn with_base_dir(base_dir: PathBuf, dev_mode: bool) -> Context {
        let (daemon_port, discovery_port, broadcast_interval, peer_timeout) = if dev_mode {
            (
                DEV_DAEMON_PORT,
                DEV_DISCOVERY_PORT,
                DEV_BROADCAST_INTERVAL,
                DEV_PEER_TIMEOUT,
            )
        } else {
            (
                PROD_DAEMON_PORT,
                PROD_DISCOVERY_PORT,
                BROADCAST_INTERVAL,
                PEER_TIMEOUT,
            )
        };
        Context {
            base_dir,
            dev_mode,
            daemon_port,
            discovery_port,
            broadcast_interval,
            peer_timeout,
            color: env::var_os("NO_COLOR").is_none(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join("packages.db")
    }

    pub fn medias_dir(&self) -> PathBuf {
        self.base_dir.join("medias")
    }

    /// `<base>/medias/<hostname>/<media_name>/`
    pub fn media_dir(&self, hostname: &str, media_name: &str) -> PathBuf {
        self.medias_dir().join(hostname).join(media_name)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        if let Some(tmp) = env::var_os("TMPDIR") {
            PathBuf::from(tmp)
        } else if let Some(cache) = env::var_os("XDG_CACHE_HOME") {
            PathBuf::from(cache).join("urpm")
        } else {
            env::temp_dir()
        }
    }
}

fn detect_base_dir() -> (PathBuf, bool) {
    // Running from a dev tree is signalled by a .urpm.local marker next to
    // the binary's parent directory; it may override base_dir.
    if let Some(root) = project_root() {
        let marker = root.join(LOCAL_CONFIG_FILE);
        if marker.exists() {
            if let Some(base) = read_local_config(&marker) {
                return (base, true);
            }
            return (PathBuf::from(DEV_BASE_DIR), true);
        }
    }

    if Path::new("/usr/bin/urpm").exists() {
        return (PathBuf::from(PROD_BASE_DIR), false);
    }

    (PathBuf::from(DEV_BASE_DIR), true)
}

fn project_root() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let parent = exe.parent()?;
    parent.parent().map(Path::to_path_buf)
}

fn read_local_config(path: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "base_dir" {
                return Some(PathBuf::from(value.trim()));
            }
        }
    }
    None
}

/// Read the distro version tag from /etc/os-release, honoring a chroot.
pub fn system_version(root: Option<&Path>) -> Option<String> {
    let path = match root {
        Some(root) => root.join("etc/os-release"),
        None => PathBuf::from("/etc/os-release"),
    };
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("VERSION_ID=") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Which media version tags the resolver may load.
///
/// Mixing the system release with cauldron is refused unless the user picked
/// a side with the `version-mode` config key.
pub fn accepted_versions(
    system: &str,
    enabled_media_versions: &BTreeSet<String>,
    version_mode: Option<&str>,
) -> Result<BTreeSet<String>> {
    let has_system = enabled_media_versions.contains(system);
    let has_cauldron = enabled_media_versions.contains("cauldron");

    if has_system && has_cauldron && system != "cauldron" {
        match version_mode {
            Some("system") => Ok(BTreeSet::from([system.to_string()])),
            Some("cauldron") => Ok(BTreeSet::from(["cauldron".to_string()])),
            _ => Err(Error::VersionConflict {
                system: system.to_string(),
            }),
        }
    } else if has_cauldron && !has_system {
        Ok(BTreeSet::from(["cauldron".to_string()]))
    } else {
        Ok(BTreeSet::from([system.to_string()]))
    }
}

pub fn hostname_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "local".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_versions_plain() {
        let enabled = BTreeSet::from(["9".to_string()]);
        let accepted = accepted_versions("9", &enabled, None).unwrap();
        assert_eq!(accepted, BTreeSet::from(["9".to_string()]));
    }

    #[test]
    fn test_accepted_versions_cauldron_only() {
        let enabled = BTreeSet::from(["cauldron".to_string()]);
        let accepted = accepted_versions("9", &enabled, None).unwrap();
        assert_eq!(accepted, BTreeSet::from(["cauldron".to_string()]));
    }

    #[test]
    fn test_accepted_versions_conflict() {
        let enabled = BTreeSet::from(["9".to_string(), "cauldron".to_string()]);
        assert!(accepted_versions("9", &enabled, None).is_err());
        let accepted = accepted_versions("9", &enabled, Some("system")).unwrap();
        assert_eq!(accepted, BTreeSet::from(["9".to_string()]));
        let accepted = accepted_versions("9", &enabled, Some("cauldron")).unwrap();
        assert_eq!(accepted, BTreeSet::from(["cauldron".to_string()]));
    }

    #[test]
    fn test_hostname_from_url() {
        assert_eq!(
            hostname_from_url("http://mirror.example.org/mageia/"),
            "mirror.example.org"
        );
        assert_eq!(hostname_from_url("file:///srv/mirror"), "local");
    }
}
