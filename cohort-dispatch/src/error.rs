use std::io;

use cohort_group::TransportError;
use thiserror::Error;

use crate::envelope::ClientId;
use crate::fork::ForkId;

#[derive(Debug, Error)]
/// A value could not be converted to or from its wire representation.
pub enum CodecError {
    #[error("Failed to encode value: {0}")]
    Encode(String),

    #[error("Failed to decode value: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
/// An error raised immediately by a dispatch call, before any handle is returned.
pub enum DispatchError {
    #[error("Codec Error: {0}")]
    /// The command could not be marshalled.
    Codec(#[from] CodecError),

    #[error("Transport Error: {0}")]
    /// The transport rejected the message for a reason other than the
    /// target member being unreachable.
    Transport(#[from] TransportError),

    #[error("The dispatcher has been closed")]
    Closed,

    #[error("A client is already registered with id {0}")]
    DuplicateClient(ClientId),

    #[error("A fork already exists with id {0}")]
    DuplicateFork(ForkId),

    #[error("No tokio runtime is available to drive request timeouts")]
    NoRuntime,

    #[error("IO Error: {0}")]
    /// The worker threads could not be spawned.
    Io(#[from] io::Error),
}
