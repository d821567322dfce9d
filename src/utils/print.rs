//! Helper macros for logging (console printing).
//!
//! Every log line carries a parenthesized prefix naming what emitted it: a
//! worker's shard id, a role tag like `"ctrl"`, or a channel endpoint. With
//! one controller and several workers logging into the same process, the
//! prefix is what keeps the interleaved streams apart.

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// pf_trace!(shard; "issued batch of {}", count);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// pf_debug!(shard; "issued batch of {}", count);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// pf_info!(shard; "issued batch of {}", count);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// pf_warn!(shard; "issued batch of {}", count);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// pf_error!(shard; "issued batch of {}", count);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string (with prefix) to logger, then return a `TsoError`
/// carrying the same prefixed string, wrapped in an `Err` variant.
///
/// Example:
/// ```no_run
/// let e = logged_err!(shard; "issued batch of {}", count);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {
        {
            pf_error!($prefix; $fmt_str);
            Err(TsoError::msg(format!(
                concat!("({}) ", $fmt_str),
                $prefix
            )))
        }
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            pf_error!($prefix; $fmt_str, $($fmt_arg)*);
            Err(TsoError::msg(format!(
                concat!("({}) ", $fmt_str),
                $prefix,
                $($fmt_arg)*
            )))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use crate::utils::TsoError;

    #[test]
    fn shard_id_prefix() {
        assert_eq!(
            logged_err!(3; "microsecond slots exhausted"),
            Err::<(), TsoError>(TsoError::msg(
                "(3) microsecond slots exhausted"
            ))
        );
    }

    #[test]
    fn role_tag_prefix_with_args() {
        assert_eq!(
            logged_err!("ctrl"; "missed {} heartbeats in a row", 3),
            Err::<(), TsoError>(TsoError::msg(
                "(ctrl) missed 3 heartbeats in a row"
            ))
        );
    }
}
