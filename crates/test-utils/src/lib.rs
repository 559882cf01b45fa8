//! Shared test utilities for quarry crates.
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`CrashInjector`] - Commit hook that simulates a crash at a [`CrashPoint`]
//! - [`strategies`] - Proptest generators for terms and keys
//! - [`init_tracing`] - Routes store logs to the test output

#![deny(unsafe_code)]

mod test_dir;
pub use test_dir::TestDir;

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint};

pub mod strategies;

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to warnings. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_creates_temp_directory() {
        let dir = TestDir::new();
        assert!(dir.path().is_dir());
    }

    #[test]
    fn test_dir_store_path_is_inside() {
        let dir = TestDir::new();
        let location = dir.location("db");
        assert!(location.path().unwrap().starts_with(dir.path()));
    }

    #[test]
    fn test_dir_cleanup_on_drop() {
        let path = {
            let dir = TestDir::new();
            let p = dir.path().to_path_buf();
            std::fs::write(p.join("file.txt"), "data").expect("write file");
            p
        };
        assert!(!path.exists(), "temp directory should be cleaned up on drop");
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }
}
