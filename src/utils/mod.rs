//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod net;

pub use error::TsoError;

pub(crate) use net::{tcp_bind_with_retry, tcp_connect_with_retry};
