//! # Communications interface crate.
//!
//! Provides the message catalog exchanged between vehicles, consumer agents, platoon controllers,
//! coordinators and the location service, along with the transport used to carry it.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Identifiers, endpoints and shared value types
pub mod types;

/// Message catalog and envelope
pub mod msg;

/// Network module
pub mod net;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use msg::{Envelope, PlatoonMsg};
pub use types::*;
