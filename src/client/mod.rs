//! Client-side functionality.

mod apistub;

pub use apistub::{ReceivedBatch, TsoClientStub};
