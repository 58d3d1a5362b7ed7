//! Typed errors raised while talking to the source API.
//!
//! Every variant is fatal to an import run: partial source data would
//! corrupt the mapping stage, so nothing here is retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The server answered with a non-success status.
    #[error("Requested \"{url}\" got \"{status_line}\".")]
    Transport { url: String, status_line: String },

    /// The request never produced a response (DNS, TLS, timeout, ...).
    #[error("Request to \"{url}\" failed: {message}")]
    Network { url: String, message: String },

    /// The response body was not the JSON shape we expected.
    #[error("Could not decode response from \"{url}\": {message}")]
    Decode { url: String, message: String },
}
