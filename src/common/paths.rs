//! Cross-platform configuration, log and socket paths
//!
//! Unix/macOS: adapter sockets live under $XDG_RUNTIME_DIR or /tmp
//! Windows: adapter sockets are named pipes \\.\pipe\dapsession-<username>-<tag>

use std::io;
use std::path::PathBuf;

/// Application name used for directories and socket names
const APP_NAME: &str = "dapsession";

/// Directory holding per-session adapter sockets
#[cfg(unix)]
pub fn socket_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME);
    }

    // Fallback to /tmp with uid for security
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
}

/// Socket name for one adapter connection, suitable for `interprocess`
///
/// `tag` distinguishes concurrent sessions (usually the session id).
#[cfg(unix)]
pub fn adapter_socket_name(tag: &str) -> String {
    socket_dir()
        .join(format!("adapter-{}.sock", tag))
        .to_string_lossy()
        .into_owned()
}

#[cfg(windows)]
pub fn adapter_socket_name(tag: &str) -> String {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    format!("{}-{}-{}", APP_NAME, username, tag)
}

/// Ensure the socket directory exists with proper permissions
///
/// On Unix, creates the directory with mode 0700
#[cfg(unix)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    let dir = socket_dir();

    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(dir)
}

#[cfg(windows)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    // Named pipes don't need a directory on Windows
    Ok(PathBuf::new())
}

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/dapsession/`
/// - macOS: `~/Library/Application Support/dapsession/`
/// - Windows: `%APPDATA%\dapsession\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

/// Default location of the persisted breakpoint store for a project root
pub fn breakpoint_store(project_root: &std::path::Path) -> PathBuf {
    project_root.join(format!(".{}", APP_NAME)).join("breakpoints.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_socket_name_is_tagged() {
        let a = adapter_socket_name("1");
        let b = adapter_socket_name("2");
        assert_ne!(a, b);
        assert!(a.contains(APP_NAME));
    }

    #[test]
    fn test_config_dir_is_valid() {
        let dir = config_dir();
        assert!(dir.is_some());
    }

    #[test]
    fn test_breakpoint_store_under_project() {
        let path = breakpoint_store(std::path::Path::new("/work/proj"));
        assert_eq!(path, PathBuf::from("/work/proj/.dapsession/breakpoints.json"));
    }
}
