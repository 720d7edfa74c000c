//! Logging macros for the scheduler with verbosity level control.
//!
//! Each macro checks the per-scheduler verbosity before touching the `log`
//! facade.
//! Levels:
//! - 0: SILENT (only warnings such as abandoned transport blocks)
//! - 1: CHANGES (grants issued, HARQ outcomes)
//! - 2: CHECKS (eligibility and skip reasons)
//! - 3: DEBUG (per-RBG allocation internals)

/// Verbosity level constants.
pub const VERBOSITY_SILENT: u8 = 0;
pub const VERBOSITY_CHANGES: u8 = 1;
pub const VERBOSITY_CHECKS: u8 = 2;
pub const VERBOSITY_DEBUG: u8 = 3;

/// Log target shared by every scheduler message.
pub const LOG_TARGET: &str = "gnb_sched";

/// Log at CHANGES level (verbosity >= 1).
///
/// Used for: grants issued, HARQ outcomes.
#[macro_export]
macro_rules! log_changes {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_CHANGES {
            log::info!(target: $crate::logging::LOG_TARGET, $($arg)*);
        }
    };
}

/// Log at CHECKS level (verbosity >= 2).
///
/// Used for: UE eligibility, skip reasons, slot selection.
#[macro_export]
macro_rules! log_checks {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_CHECKS {
            log::debug!(target: $crate::logging::LOG_TARGET, $($arg)*);
        }
    };
}

/// Log at DEBUG level (verbosity >= 3).
///
/// Used for: per-resource allocation decisions.
#[macro_export]
macro_rules! log_debug {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_DEBUG {
            log::trace!(target: $crate::logging::LOG_TARGET, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_ordering() {
        assert!(VERBOSITY_SILENT < VERBOSITY_CHANGES);
        assert!(VERBOSITY_CHANGES < VERBOSITY_CHECKS);
        assert!(VERBOSITY_CHECKS < VERBOSITY_DEBUG);
    }

    #[test]
    fn test_log_macros_compile() {
        let _ = env_logger::builder().is_test(true).try_init();
        let verbosity = VERBOSITY_DEBUG;
        log_changes!(verbosity, "test {}", 1);
        log_checks!(verbosity, "test {}", 2);
        log_debug!(verbosity, "test {}", 3);
    }
}
