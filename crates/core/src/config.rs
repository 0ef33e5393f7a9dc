//! Global configuration with thread-local scoped overrides.
//!
//! The process-wide default configuration is immutable after startup unless
//! explicitly replaced with [`set_global_config`]. A thread may push scoped
//! overrides with [`ConfigScope::enter`] (or the [`config_context`]
//! convenience); the innermost scope is active for that thread only, and
//! pop-on-scope-exit is guaranteed by the guard's `Drop` even on panic.

use std::cell::RefCell;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::constants::DEFAULT_VERSION;
use crate::error::{AsdfError, Result};
use crate::types::BlockStorage;

/// Container for ASDF configuration options.
#[derive(Debug, Clone)]
pub struct AsdfConfig {
    /// Run schema validation when opening a file.
    pub validate_on_read: bool,
    /// ASDF Standard version used for new files.
    pub default_version: String,
    /// Arrays with at most this many elements serialize inline.
    pub array_inline_threshold: Option<u64>,
    /// Storage class override applied to every block on write.
    pub all_array_storage: Option<BlockStorage>,
    /// Compression label applied to every block on write.
    pub all_array_compression: Option<String>,
    /// Round block allocations up to the filesystem block size.
    pub pad_blocks: bool,
    /// Do not fail when a file declares an extension that is not installed.
    pub ignore_missing_extensions: bool,
    /// Escalate unknown tags and missing extensions to hard errors.
    pub strict_extension_check: bool,
    /// Silently pass through unrecognized tags without a diagnostic.
    pub ignore_unrecognized_tag: bool,
    /// Do not warn when a file was written with a different standard version.
    pub ignore_version_mismatch: bool,
}

impl Default for AsdfConfig {
    fn default() -> Self {
        AsdfConfig {
            validate_on_read: true,
            default_version: DEFAULT_VERSION.to_string(),
            array_inline_threshold: None,
            all_array_storage: None,
            all_array_compression: None,
            pad_blocks: false,
            ignore_missing_extensions: false,
            strict_extension_check: false,
            ignore_unrecognized_tag: false,
            ignore_version_mismatch: false,
        }
    }
}

impl AsdfConfig {
    /// Reject option combinations that contradict each other.
    pub fn check_consistent(&self) -> Result<()> {
        if self.strict_extension_check && self.ignore_missing_extensions {
            return Err(AsdfError::Value(
                "'strict_extension_check' and 'ignore_missing_extensions' are incompatible options"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

static GLOBAL_CONFIG: Lazy<RwLock<AsdfConfig>> = Lazy::new(|| RwLock::new(AsdfConfig::default()));

thread_local! {
    static CONFIG_STACK: RefCell<Vec<AsdfConfig>> = const { RefCell::new(Vec::new()) };
}

/// Get a snapshot of the active configuration for this thread.
pub fn get_config() -> AsdfConfig {
    CONFIG_STACK.with(|stack| {
        let stack = stack.borrow();
        match stack.last() {
            Some(top) => top.clone(),
            None => GLOBAL_CONFIG.read().clone(),
        }
    })
}

/// Replace the process-wide default configuration.
pub fn set_global_config(config: AsdfConfig) {
    *GLOBAL_CONFIG.write() = config;
}

/// Mutate the active configuration: the innermost scope on this thread, or
/// the process-wide default when no scope is active.
pub fn update_config<F>(f: F)
where
    F: FnOnce(&mut AsdfConfig),
{
    CONFIG_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last_mut() {
            Some(top) => f(top),
            None => f(&mut GLOBAL_CONFIG.write()),
        }
    })
}

/// RAII guard for a scoped configuration override.
///
/// Entering pushes a copy of the current configuration onto this thread's
/// stack; dropping pops it.
pub struct ConfigScope {
    _private: (),
}

impl ConfigScope {
    /// Push a copy of the active configuration for this thread.
    pub fn enter() -> Self {
        let current = get_config();
        CONFIG_STACK.with(|stack| stack.borrow_mut().push(current));
        ConfigScope { _private: () }
    }
}

impl Drop for ConfigScope {
    fn drop(&mut self) {
        CONFIG_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` inside a scoped configuration override.
///
/// Changes made through [`update_config`] inside `f` are visible to
/// [`get_config`] on this thread and discarded when `f` returns.
pub fn config_context<R>(f: impl FnOnce() -> R) -> R {
    let _scope = ConfigScope::enter();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_override_is_popped() {
        let before = get_config().validate_on_read;
        config_context(|| {
            update_config(|c| c.validate_on_read = !before);
            assert_eq!(get_config().validate_on_read, !before);
        });
        assert_eq!(get_config().validate_on_read, before);
    }

    #[test]
    fn test_nested_scopes() {
        config_context(|| {
            update_config(|c| c.pad_blocks = true);
            config_context(|| {
                assert!(get_config().pad_blocks);
                update_config(|c| c.pad_blocks = false);
                assert!(!get_config().pad_blocks);
            });
            assert!(get_config().pad_blocks);
        });
    }

    #[test]
    fn test_pop_on_panic() {
        let result = std::panic::catch_unwind(|| {
            config_context(|| {
                update_config(|c| c.default_version = "1.4.0".to_string());
                panic!("boom");
            })
        });
        assert!(result.is_err());
        assert_ne!(get_config().default_version, "1.4.0");
    }

    #[test]
    fn test_incompatible_options() {
        let mut config = AsdfConfig::default();
        config.strict_extension_check = true;
        config.ignore_missing_extensions = true;
        assert!(config.check_consistent().is_err());
    }

    #[test]
    fn test_scope_is_thread_local() {
        config_context(|| {
            update_config(|c| c.pad_blocks = true);
            let other = std::thread::spawn(|| get_config().pad_blocks).join().unwrap();
            assert!(!other);
        });
    }
}
