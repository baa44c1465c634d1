//! Helpers shared by unit and integration tests.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Serializes tests that read or change `ODEON_*` variables or the API-key
/// variable named by `session.api_key_env`.
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Take the environment lock, even if a previous holder panicked.
#[must_use]
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One environment variable changed for the life of the value, restored on
/// drop. Hold [`lock_env`] while any of these exist.
#[derive(Debug)]
pub struct ScopedVar {
    key: String,
    previous: Option<OsString>,
}

impl ScopedVar {
    #[must_use]
    pub fn set(key: &str, value: impl AsRef<OsStr>) -> Self {
        Self::replace(key, Some(value.as_ref()))
    }

    #[must_use]
    pub fn unset(key: &str) -> Self {
        Self::replace(key, None)
    }

    fn replace(key: &str, value: Option<&OsStr>) -> Self {
        let previous = std::env::var_os(key);
        write_var(key, value);
        Self {
            key: key.to_string(),
            previous,
        }
    }
}

impl Drop for ScopedVar {
    fn drop(&mut self) {
        write_var(&self.key, self.previous.as_deref());
    }
}

fn write_var(key: &str, value: Option<&OsStr>) {
    // SAFETY: every caller holds the lock returned by `lock_env`.
    unsafe {
        match value {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }
}

/// `path` as the body of a TOML basic string.
#[must_use]
pub fn toml_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "\\\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_vars_restore_what_was_there() {
        let _env = lock_env();
        let key = "ODEON_SCOPED_VAR_TEST";
        {
            let _outer = ScopedVar::set(key, "first");
            {
                let _inner = ScopedVar::unset(key);
                assert_eq!(std::env::var_os(key), None);
            }
            assert_eq!(std::env::var(key).as_deref(), Ok("first"));
        }
        assert_eq!(std::env::var_os(key), None);
    }

    #[test]
    fn windows_separators_are_escaped() {
        assert_eq!(toml_path(Path::new(r"C:\runs\history.db")), r"C:\\runs\\history.db");
        assert_eq!(toml_path(Path::new("/tmp/history.db")), "/tmp/history.db");
    }
}
