//! Utility library for the platoon coordination software

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod host;
pub mod logger;
pub mod maths;
pub mod params;
pub mod session;

// ---------------------------------------------------------------------------
// MACROS
// ---------------------------------------------------------------------------

/// Fire an unrecoverable error which will panic.
///
/// # Notes
/// - Only use this for broken internal invariants (programming errors). Business outcomes such as
///   a rejected join must be reported to the requester instead.
#[macro_export]
macro_rules! raise_error {
    () => ({
        log::error!("Explicit error raised.");
        std::panic!("Unrecoverable error");
    });
    ($fmt:expr) => ({
        log::error!("{}", $fmt);
        std::panic!("Unrecoverable error: {}", $fmt);
    });
    ($fmt:expr, $($arg:tt)*) => ({
        let msg = std::format!($fmt, $($arg)*);
        log::error!("{}", msg);
        std::panic!("Unrecoverable error: {}", msg);
    });
}
