//! Stderr logging for code running inside an arbitrary target process. No
//! subscriber can be assumed there, so lines go straight to fd 2, tagged
//! with the transport and pid, and only when `MIRAGE_VERBOSE` is set.

macro_rules! shim_log {
    ($($arg:tt)*) => {
        if $crate::verbose() {
            eprintln!(
                "[mirage-shim:{}] {}",
                unsafe { libc::getpid() },
                format_args!($($arg)*)
            );
        }
    };
}
