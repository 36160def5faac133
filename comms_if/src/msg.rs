//! # Platoon message catalog
//!
//! Every message travels inside an [`Envelope`] which attaches the sender's endpoint, so that a
//! receiver can always build a reply path. Requests additionally carry an explicit `reply_to`
//! since the relay (consumer agent) is not always the original sender.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::types::*;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A message addressed from one endpoint to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Endpoint,
    pub to: Endpoint,
    pub msg: PlatoonMsg,
}

/// Request to find the best platoon for a vehicle and associate it with the platoon's
/// controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverAssociateRequest {
    pub vehicle_id: VehicleId,
    pub reply_to: Endpoint,
    pub position: Vec3,
    pub direction: Vec3,
    pub speed_ms: f64,
}

/// Request for the list of platoons known to a coordinator (and its federation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub vehicle_id: VehicleId,
    pub reply_to: Endpoint,
    pub position: Vec3,
    pub direction: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub vehicle_id: VehicleId,
    pub platoons: Vec<PlatoonSummary>,
}

/// Request to be associated with a specific, already known, platoon controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociateRequest {
    pub vehicle_id: VehicleId,
    pub reply_to: Endpoint,
    pub controller_id: ControllerId,
}

/// Result of an association, returned for both discover-and-associate and associate requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationResponse {
    pub vehicle_id: VehicleId,
    pub success: bool,

    /// Coordinator which answered the request
    pub producer_id: ProducerId,

    /// The associated controller, `None` on failure
    pub controller_id: Option<ControllerId>,

    /// Endpoint of the associated controller, `None` on failure
    pub controller_endpoint: Option<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub vehicle_id: VehicleId,
    pub controller_id: ControllerId,
    pub producer_id: ProducerId,
    pub reply_to: Endpoint,

    /// Last known position of the vehicle
    pub position: Vec3,
    pub speed_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub vehicle_id: VehicleId,
    pub controller_id: ControllerId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub vehicle_id: VehicleId,
    pub controller_id: ControllerId,
    pub reply_to: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub vehicle_id: VehicleId,
    pub controller_id: ControllerId,
    pub success: bool,
}

/// Acceleration command for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatoonCommand {
    pub vehicle_id: VehicleId,
    pub controller_id: ControllerId,

    /// Demanded acceleration in m/s^2
    pub acceleration: Vec3,

    /// The vehicle immediately ahead, `None` for the leader
    pub preceding: Option<VehicleId>,

    /// Distance to the preceding vehicle in metres, `None` for the leader
    pub distance_to_preceding_m: Option<f64>,

    /// Set on the last command of a manoeuvre
    pub maneuver_ended: bool,
}

/// One-way notification to a vehicle about the progress of its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManeuverNotification {
    pub vehicle_id: VehicleId,
    pub controller_id: ControllerId,
    pub kind: ManeuverNotice,
}

/// Discovery fan-out from one coordinator to a federation peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailablePlatoonsRequest {
    pub producer_id: ProducerId,
    pub request_id: RequestId,
    pub reply_to: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailablePlatoonsResponse {
    pub producer_id: ProducerId,
    pub request_id: RequestId,
    pub platoons: Vec<PlatoonSummary>,
}

/// Request to a peer coordinator to be told when one of its controllers is instantiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantiationRequest {
    pub producer_id: ProducerId,
    pub controller_id: ControllerId,
    pub reply_to: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantiationResponse {
    pub producer_id: ProducerId,
    pub controller_id: ControllerId,
    pub success: bool,
    pub endpoint: Option<Endpoint>,
}

/// Configuration sent by a coordinator to a newly instantiated controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller_id: ControllerId,
    pub producer_id: ProducerId,
    pub producer_endpoint: Endpoint,
    pub direction: Vec3,

    pub heartbeat_period_s: f64,
    pub longitudinal_control_period_s: f64,
    pub longitudinal_update_period_s: f64,
    pub lateral_control_period_s: f64,
    pub lateral_update_period_s: f64,

    /// Delay of the first control tick after a phase change, relative to the position update
    pub control_offset_s: f64,

    pub longitudinal_law: ControlLawKind,
    pub lateral_law: ControlLawKind,

    /// Extrapolate member positions to the control time before running the control law
    pub adjust_positions: bool,

    /// Request all positions from a producer in one request instead of one per vehicle
    pub send_bulk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureControllerResponse {
    pub controller_id: ControllerId,
    pub success: bool,
}

/// A member reference carried by new/removed member notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    pub vehicle_id: VehicleId,
    pub consumer: Endpoint,
}

/// One-way status report from a controller to its owning coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerNotification {
    pub controller_id: ControllerId,
    pub producer_id: ProducerId,
    pub kind: NotificationKind,

    /// The member concerned by a new/removed member notification
    pub member: Option<MemberRef>,

    pub state: ControllerState,

    /// Members, leader first
    pub vehicles_order: Vec<VehicleId>,

    /// Queued joins followed by the vehicle currently manoeuvring to join
    pub queued_joins: Vec<VehicleId>,

    pub tail_position: Option<Vec3>,
    pub timestamp_s: f64,
}

/// Request from a controller to the location service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRequest {
    pub controller_id: ControllerId,
    pub producer_id: ProducerId,
    pub vehicles: Vec<VehicleId>,
    pub reply_to: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub controller_id: ControllerId,
    pub samples: Vec<PositionSample>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManeuverNotice {
    QueuedJoin,
    QueuedLeave,
    JoinManeuver,
    LeaveManeuver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    NewMember,
    RemovedMember,
    NewOrder,
    Heartbeat,
    Stopped,
}

/// All messages of the platooning system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlatoonMsg {
    // ---- Vehicle <-> consumer <-> coordinator ----
    DiscoverPlatoons(DiscoverRequest),
    DiscoverPlatoonsResponse(DiscoverResponse),
    DiscoverAndAssociate(DiscoverAssociateRequest),
    DiscoverAndAssociateResponse(AssociationResponse),
    AssociatePlatoon(AssociateRequest),
    AssociatePlatoonResponse(AssociationResponse),

    /// Periodic status of a vehicle, sent to its consumer agent
    VehicleStatus(PositionSample),

    // ---- Consumer <-> controller ----
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),
    LeaveRequest(LeaveRequest),
    LeaveResponse(LeaveResponse),
    PlatoonCommand(PlatoonCommand),
    Notification(ManeuverNotification),

    // ---- Coordinator <-> coordinator ----
    AvailablePlatoonsRequest(AvailablePlatoonsRequest),
    AvailablePlatoonsResponse(AvailablePlatoonsResponse),
    InstantiationRequest(InstantiationRequest),
    InstantiationResponse(InstantiationResponse),

    // ---- Coordinator <-> controller ----
    ConfigureController(ControllerConfig),
    ConfigureControllerResponse(ConfigureControllerResponse),
    ControllerNotification(ControllerNotification),

    // ---- Controller <-> location service ----
    PositionRequest(PositionRequest),
    PositionUpdate(PositionUpdate),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PlatoonMsg {
    /// Short name of the message, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            PlatoonMsg::DiscoverPlatoons(_) => "DiscoverPlatoons",
            PlatoonMsg::DiscoverPlatoonsResponse(_) => "DiscoverPlatoonsResponse",
            PlatoonMsg::DiscoverAndAssociate(_) => "DiscoverAndAssociate",
            PlatoonMsg::DiscoverAndAssociateResponse(_) => "DiscoverAndAssociateResponse",
            PlatoonMsg::AssociatePlatoon(_) => "AssociatePlatoon",
            PlatoonMsg::AssociatePlatoonResponse(_) => "AssociatePlatoonResponse",
            PlatoonMsg::VehicleStatus(_) => "VehicleStatus",
            PlatoonMsg::JoinRequest(_) => "JoinRequest",
            PlatoonMsg::JoinResponse(_) => "JoinResponse",
            PlatoonMsg::LeaveRequest(_) => "LeaveRequest",
            PlatoonMsg::LeaveResponse(_) => "LeaveResponse",
            PlatoonMsg::PlatoonCommand(_) => "PlatoonCommand",
            PlatoonMsg::Notification(_) => "Notification",
            PlatoonMsg::AvailablePlatoonsRequest(_) => "AvailablePlatoonsRequest",
            PlatoonMsg::AvailablePlatoonsResponse(_) => "AvailablePlatoonsResponse",
            PlatoonMsg::InstantiationRequest(_) => "InstantiationRequest",
            PlatoonMsg::InstantiationResponse(_) => "InstantiationResponse",
            PlatoonMsg::ConfigureController(_) => "ConfigureController",
            PlatoonMsg::ConfigureControllerResponse(_) => "ConfigureControllerResponse",
            PlatoonMsg::ControllerNotification(_) => "ControllerNotification",
            PlatoonMsg::PositionRequest(_) => "PositionRequest",
            PlatoonMsg::PositionUpdate(_) => "PositionUpdate",
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
