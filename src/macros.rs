#![allow(unused_macros)]

/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that use it.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
