//! Distributed Transaction Log
//!
//! A per-volume durability mirror hosted on a peer node. Every acknowledged
//! write is mirrored as a (cluster address, location, payload) entry keyed
//! by the SCO it landed in; after an unclean shutdown the owner streams the
//! entries back and refills whatever never reached the backend.
//!
//! The server fences stale owners: an append carrying an owner tag below
//! the highest it has seen for a volume is rejected, which is how a node
//! that lost a migration race finds out.

use thiserror::Error;

use crate::types::OwnerTag;

pub mod checker;
pub mod client;
pub mod protocol;
pub mod server;

pub use checker::{DtlChecker, DtlProbe};
pub use client::{DtlClient, DtlClientConfig, DtlMode, DtlState};
pub use protocol::DtlEntry;
pub use server::DtlServer;

/// DTL error types
#[derive(Error, Debug)]
pub enum DtlError {
    /// The peer has seen a newer owner for this volume
    #[error("fenced by owner tag {highest}")]
    Fenced {
        /// Highest tag the peer has seen
        highest: OwnerTag,
    },

    /// No peer is configured
    #[error("dtl not configured")]
    NotConfigured,

    /// The peer went away or never answered
    #[error("dtl peer unavailable: {0}")]
    PeerUnavailable(String),

    /// A frame would not encode or decode
    #[error("dtl protocol error: {0}")]
    Protocol(String),

    /// Socket I/O failed
    #[error("dtl I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for DTL operations
pub type DtlResult<T> = Result<T, DtlError>;
