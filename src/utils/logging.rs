//! Logger setup plus conditional logging macros that check a module-level
//! `ENABLE_LOGS` flag.
//!
//! Usage:
//! ```rust,ignore
//! // In your module, define the flag first:
//! const ENABLE_LOGS: bool = true;
//!
//! // Then use the macros (they're exported at the crate root):
//! use crate::{log_debug, log_info, log_warn, log_error};
//!
//! log_info!("This will log if ENABLE_LOGS is true");
//! ```

use std::fmt;
use std::io::Write;

use log::LevelFilter;

/// Which side of the process boundary is writing a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Supervisor,
    Worker,
    Cli,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessRole::Supervisor => "supervisor",
            ProcessRole::Worker => "worker",
            ProcessRole::Cli => "cli",
        };
        f.write_str(label)
    }
}

/// `TAPFILL_DEBUG=1` (or `true`) lowers the default level to debug.
pub fn debug_enabled() -> bool {
    std::env::var("TAPFILL_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Installs the global logger. `RUST_LOG` still wins over the default level.
///
/// Every line is tagged with the role and pid so supervisor and worker
/// output can be told apart when both write to the same terminal.
pub fn init(role: ProcessRole) {
    let default_level = if debug_enabled() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let pid = std::process::id();

    let _ = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} {:<5} [{role} {pid}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Macro for conditional debug logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

/// Macro for conditional info logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
///
/// Each module that uses this macro must define:
/// ```rust,ignore
/// const ENABLE_LOGS: bool = true; // or false
/// ```
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Macro for conditional warn logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Macro for conditional error logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
