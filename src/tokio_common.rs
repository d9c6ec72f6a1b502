//! This module provides the error type shared by the `tokio` based engine:
//! correlator, command API and monitoring loop.
use crate::{protocol as proto, transport};
use std::time::Duration;

/// Represents all possible errors that can occur while talking to the device.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    ProtocolError(#[from] proto::Error),

    /// Wraps `transport::Error`.
    #[error(transparent)]
    TransportError(#[from] transport::Error),

    /// No notification resolved the wait before its deadline.
    #[error("No response to command 0x{opcode:02X} within {timeout:?}")]
    ResponseTimeout { opcode: u8, timeout: Duration },

    /// A wait for this opcode is already outstanding.
    #[error("Already awaiting a response to command 0x{0:02X}")]
    AlreadyAwaiting(u8),

    /// The wait was abandoned before a response arrived.
    #[error("Wait for command 0x{0:02X} was cancelled")]
    Cancelled(u8),
}

impl Error {
    /// Returns `true` for failures the caller may simply retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ResponseTimeout { .. })
    }
}

/// The result type for tokio operations.
pub type Result<T> = std::result::Result<T, crate::tokio_common::Error>;
