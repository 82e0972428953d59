//! Async client for the verdict service.
//!
//! A [`Session`] holds one authenticated WebSocket connection and multiplexes
//! any number of concurrent verdict requests over it. Samples the service
//! does not know yet are uploaded over HTTP and the final verdict arrives on
//! the same connection.

pub mod auth;
pub mod correlator;
pub mod protocol;
mod reader;
pub mod session;
pub mod transport;
pub mod upload;

pub use auth::{ClientCredentials, DEFAULT_TOKEN_ENDPOINT};
pub use session::{RequestOptions, Session, State};
pub use upload::{UploadChannel, UploadSource};
pub use verdict_core::{Options, ScanVerdict, Sha256, UploadError, Verdict, VerdictError};
