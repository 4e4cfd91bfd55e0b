//! Resolution of the shared configuration directory.
//!
//! All on-disk state (accounts file, claims file, config file) lives under
//! one directory, chosen in priority order: `$OPENCODE_CONFIG_DIR`, then
//! `$XDG_CONFIG_HOME/opencode`, then `~/.config/opencode`.

use std::path::PathBuf;

/// Resolve the config directory per the documented priority order.
///
/// Does not create the directory; callers create it lazily on first write.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OPENCODE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("opencode");
    }
    home_dir().join(".config").join("opencode")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn prefers_opencode_config_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        // SAFETY: serialized by ENV_LOCK; no other thread reads these vars concurrently.
        unsafe {
            std::env::set_var("OPENCODE_CONFIG_DIR", "/tmp/oc-test-1");
            std::env::remove_var("XDG_CONFIG_HOME");
        }
        assert_eq!(config_dir(), PathBuf::from("/tmp/oc-test-1"));
        unsafe {
            std::env::remove_var("OPENCODE_CONFIG_DIR");
        }
    }

    #[test]
    fn falls_back_to_xdg_config_home() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("OPENCODE_CONFIG_DIR");
            std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-test");
        }
        assert_eq!(config_dir(), PathBuf::from("/tmp/xdg-test/opencode"));
        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }
}
