//! Exports configuration data from the build system

/// The configured configuration directory
pub const CONFIGDIR: &str = "/etc/irobot";

#[macro_export]
macro_rules! IROBOT_RUN_DIR_M { () => ("/run/irobot") }

#[macro_export]
macro_rules! IROBOT_LOG_DIR_M { () => ("/var/log/irobot") }

/// namespaced directory for in-memory (tmpfs) run state
pub const IROBOT_RUN_DIR: &str = IROBOT_RUN_DIR_M!();

/// namespaced directory for persistent logging
pub const IROBOT_LOG_DIR: &str = IROBOT_LOG_DIR_M!();

/// the PID filename for the daemon
pub const IROBOT_PID_FN: &str = concat!(IROBOT_RUN_DIR_M!(), "/irobotd.pid");

/// Prepend configuration directory to a file name
///
/// This is a simple way to get the full path for configuration files.
/// #### Example:
/// ```
/// # #[macro_use] extern crate irobot_precache;
/// let cfg_path = configdir!("/irobot.toml");
/// ```
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/irobot", $subdir)
    };
}

/// Prepend the run directory to a file name.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!(IROBOT_RUN_DIR_M!(), $subdir)
    };
}

/// Default location of the daemon's own TOML configuration file.
pub const DEFAULT_CONFIG_FN: &str = configdir!("/irobot.toml");
