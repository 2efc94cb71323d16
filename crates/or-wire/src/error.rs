//! Error and incomplete-data signaling shared by the framing layer.

use thiserror::Error;

/// Outcome of a `fetch_*` operation on [`crate::Buffer`].
///
/// Every `fetch_*` method returns `Err(FetchError::Incomplete)` without
/// consuming any bytes when there is not yet enough data buffered; callers
/// retry once more bytes arrive. `TooLong`/`Protocol` are terminal: the
/// caller closes the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Not enough bytes buffered yet; no bytes were consumed.
    #[error("incomplete")]
    Incomplete,

    /// The framed message exceeds the caller-supplied size limit.
    #[error("message too long")]
    TooLong,

    /// The buffered bytes violate the expected framing.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Errors produced while packing or unpacking a single cell.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("fixed cell has wrong length: expected {expected}, got {actual}")]
    BadFixedCellLength { expected: usize, actual: usize },

    #[error("variable cell payload exceeds the link-protocol limit: {actual} > {limit}")]
    VarCellTooLarge { actual: usize, limit: usize },

    #[error("unrecognized address encoding type {0}")]
    BadAddressType(u8),

    #[error("address encoding length mismatch: type {addr_type} expects {expected} bytes, got {actual}")]
    BadAddressLength {
        addr_type: u8,
        expected: usize,
        actual: usize,
    },

    #[error("truncated cell body: needed at least {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("CERTS cell body malformed: {0}")]
    BadCerts(String),

    #[error("odd-length VERSIONS payload ({0} bytes)")]
    OddVersionsPayload(usize),
}
