//! # Shared types
//!
//! Identifiers, endpoints and value types which appear inside messages.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::fmt::{self, Display};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// Identifier of a vehicle. Each vehicle has exactly one consumer agent, which shares this id.
pub type VehicleId = u32;

/// Identifier of a platoon controller, unique across the federation.
pub type ControllerId = u32;

/// Identifier of a producer coordinator (one per edge host).
pub type ProducerId = u32;

/// Correlation id of a discovery round.
pub type RequestId = u64;

/// Position, direction and acceleration vectors in metres (per second squared).
pub type Vec3 = Vector3<f64>;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A network address of an application.
///
/// `host` and `port` locate the socket of the edge host (or vehicle) while `app` selects the
/// application behind that socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub app: AppRef,
}

/// A position/speed sample for one vehicle, as produced by the location service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub vehicle_id: VehicleId,

    /// Position of the vehicle in metres
    pub position: Vec3,

    /// Speed along the direction of travel in metres per second
    pub speed_ms: f64,

    /// Time at which the sample was taken, in seconds
    pub timestamp_s: f64,
}

/// Catalog entry describing one platoon, exchanged between coordinators during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatoonSummary {
    pub controller_id: ControllerId,

    /// Coordinator which owns the controller
    pub producer_id: ProducerId,

    /// Direction of travel of the platoon
    pub direction: Vec3,

    /// Controller endpoint, `None` until the controller has been instantiated
    pub endpoint: Option<Endpoint>,

    /// Members, leader first
    pub vehicles: Vec<VehicleId>,

    /// Number of join requests waiting in the controller's queue (including the vehicle currently
    /// manoeuvring to join)
    pub queued_joins: usize,

    /// Last reported position of the last member of the platoon
    pub tail_position: Option<Vec3>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The application behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AppRef {
    Coordinator,
    Controller(ControllerId),
    Consumer(VehicleId),
    Vehicle(VehicleId),
    Location,
}

/// The state of a platoon controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// No members, no timers running
    Inactive,

    /// Longitudinal control of the members
    Cruise,

    /// A single vehicle is manoeuvring
    Maneuver(ManeuverKind),

    /// Transient state while the next queued request is selected
    CheckNext,
}

/// The kind of an in-progress manoeuvre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManeuverKind {
    Join,
    Leave,
    CheckPosition,
}

/// Selects a control law implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlLawKind {
    /// Linear leader/predecessor feedback law after Rajamani et al.
    Rajamani,

    /// Safety-envelope law bounding the next-step braking distance
    Safe,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Endpoint {
    pub fn new(host: &str, port: u16, app: AppRef) -> Self {
        Self {
            host: host.into(),
            port,
            app,
        }
    }

    /// The same socket, but a different application behind it.
    pub fn with_app(&self, app: AppRef) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            app,
        }
    }

    /// True if both endpoints share the same socket.
    pub fn same_socket(&self, other: &Endpoint) -> bool {
        self.host == other.host && self.port == other.port
    }

    /// The zmq address of the socket behind this endpoint.
    pub fn socket_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{:?}", self.host, self.port, self.app)
    }
}

impl Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Inactive => write!(f, "Inactive"),
            ControllerState::Cruise => write!(f, "Cruise"),
            ControllerState::Maneuver(k) => write!(f, "Maneuver{{{:?}}}", k),
            ControllerState::CheckNext => write!(f, "CheckNext"),
        }
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        ControllerState::Inactive
    }
}

impl ControllerState {
    /// True if the state is one of the manoeuvre states.
    pub fn is_maneuver(&self) -> bool {
        matches!(self, ControllerState::Maneuver(_))
    }
}
