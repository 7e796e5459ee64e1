//! Small helpers for turning `-1`-sentinel libc calls into `io::Result`.

/// Wraps a libc call, turning a `-1` return into `Err(io::Error::last_os_error())`.
#[macro_export]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
