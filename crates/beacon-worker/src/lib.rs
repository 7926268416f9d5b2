//! Job executors for Beacon.
//!
//! - [`HttpExecutor`] fetches a page in-process and reports its status, final
//!   URL and title.
//! - [`ProcessExecutor`] runs each job in a child process and speaks the
//!   one-line [`WorkerMessage`] protocol over stdio.
//! - [`serve`] is the other end of that protocol, used by `beacon probe`.

pub mod error;
pub mod http;
pub mod message;
pub mod probe;
pub mod process;

pub use error::WorkerError;
pub use http::HttpExecutor;
pub use message::WorkerMessage;
pub use probe::{serve, serve_stdio};
pub use process::ProcessExecutor;
