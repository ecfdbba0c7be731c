//! Admission-control error types.
//!
//! Expected outcomes (content rejections, rate limiting, bans) are verdicts,
//! not errors. Only broken register/unregister pairing lands here.

use thiserror::Error;

use crate::types::ClientId;

#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A message was evaluated for a client with no registered state
    #[error("no admission state for client {0} (register/unregister pairing broken)")]
    UnknownClient(ClientId),
}
