//! # Platoon library.
//!
//! Components of the platoon coordination software. Every component is a single-threaded, event
//! driven state machine which talks to the outside world only through the context it is handed
//! (see [`context`]). The [`host`] module composes them behind the socket of an edge host.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Capability traits handed to the components by their host
pub mod context;

/// Timer sets keyed by purpose
pub mod timer;

/// Platoon membership and vehicle kinematic state
pub mod platoon;

/// Control laws - map the kinematic state of a platoon to acceleration commands
pub mod control_law;

/// Platoon controller - membership, manoeuvres and control cycles of one platoon
pub mod controller;

/// Platoon selection - picks the best platoon for a vehicle from a catalog
pub mod selection;

/// Producer coordinator - per-host directory, federated discovery and controller factory
pub mod coordinator;

/// Consumer agent - relay between a vehicle and the platoon serving it
pub mod consumer;

/// Edge host - composes the components of one host behind a single socket
pub mod host;
