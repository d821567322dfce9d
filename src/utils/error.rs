//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;

/// Customized error type for the timestamp oracle.
///
/// Most failures are just strings carried in the `Msg` variant; the dedicated
/// variants are the error kinds that clients and operators observe at the
/// service boundary and that callers need to match on.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TsoError {
    /// Service started with fewer than two shards.
    NotEnoughCores(u16),

    /// Worker cannot currently issue timestamps; the client should retry.
    NotReady,

    /// Request arrived while the service is shutting down.
    Shutdown,

    /// Master instance found its consensus lease invalid.
    LeaseLost,

    /// Send attempted on a channel that is not up.
    ChannelDown,

    /// Framing or checksum failure on an RPC channel.
    ParserError(String),

    /// Time authority could not be reached.
    ClockUnavailable(String),

    /// Everything else.
    Msg(String),
}

impl TsoError {
    /// Constructs a generic string error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        TsoError::Msg(m.to_string())
    }
}

impl fmt::Display for TsoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TsoError::NotEnoughCores(shards) => {
                write!(f, "need at least 2 shards, configured with {}", shards)
            }
            TsoError::NotReady => {
                write!(f, "server not ready to issue timestamps, retry later")
            }
            TsoError::Shutdown => write!(f, "server shutting down"),
            TsoError::LeaseLost => write!(f, "mastership lease lost"),
            TsoError::ChannelDown => write!(f, "channel is not up"),
            TsoError::ParserError(s) => write!(f, "parser error: {}", s),
            TsoError::ClockUnavailable(s) => {
                write!(f, "time authority unavailable: {}", s)
            }
            TsoError::Msg(s) => write!(f, "{}", s),
        }
    }
}

impl error::Error for TsoError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `TsoError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TsoError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TsoError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::num::ParseIntError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::watch::error::SendError<bool>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = TsoError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = TsoError::from(io_error);
        assert!(matches!(e, TsoError::Msg(s) if s.contains("oh no!")));
    }

    #[test]
    fn not_enough_cores_formats_count() {
        let e = TsoError::NotEnoughCores(1);
        assert_eq!(
            format!("{}", e),
            "need at least 2 shards, configured with 1"
        );
    }
}
