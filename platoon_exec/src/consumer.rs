//! # Consumer agent
//!
//! Each vehicle attached to an edge host has a consumer agent on that host. The agent relays the
//! vehicle's requests to the coordinator or to the controller serving it, and relays responses,
//! commands and notifications back to the vehicle.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    msg::{
        AssociateRequest, AssociationResponse, DiscoverAssociateRequest, DiscoverRequest,
        JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, ManeuverNotice,
        ManeuverNotification,
    },
    ControllerId, Endpoint, Envelope, PlatoonMsg, PositionSample, ProducerId, Vec3, VehicleId,
};
use log::{debug, info, trace, warn};

use crate::context::Outbound;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct ConsumerAgent {
    vehicle_id: VehicleId,

    /// Coordinator of the host this agent runs on
    producer_id: ProducerId,
    coordinator: Endpoint,

    /// Where relayed messages are sent, learned from the vehicle's first message
    vehicle: Option<Endpoint>,

    state: ConsumerState,

    last_sample: Option<PositionSample>,

    /// The controller the vehicle is associated with
    controller: Option<(ControllerId, Endpoint)>,

    /// Set once the vehicle has left its platoon
    left: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    DiscoveryAndAssociate,
    Join,
    JoinedPlatoon,
    Maneuvering,
    Leave,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Consumer of vehicle {0} cannot handle a {1} message")]
    UnexpectedMessage(VehicleId, &'static str),

    #[error("Consumer of vehicle {expected} received a message from vehicle {got}")]
    WrongVehicle { expected: VehicleId, got: VehicleId },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ConsumerAgent {
    pub fn new(vehicle_id: VehicleId, producer_id: ProducerId, coordinator: Endpoint) -> Self {
        Self {
            vehicle_id,
            producer_id,
            coordinator,
            vehicle: None,
            state: ConsumerState::Idle,
            last_sample: None,
            controller: None,
            left: false,
        }
    }

    pub fn vehicle_id(&self) -> VehicleId {
        self.vehicle_id
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn controller_id(&self) -> Option<ControllerId> {
        self.controller.as_ref().map(|(id, _)| *id)
    }

    pub fn last_sample(&self) -> Option<&PositionSample> {
        self.last_sample.as_ref()
    }

    /// True once the vehicle has fully left its platoon and the agent can be dropped.
    pub fn has_left(&self) -> bool {
        self.left && self.state == ConsumerState::Idle
    }

    /// True if `msg` is a request a vehicle may open a session with.
    pub fn opens_session(msg: &PlatoonMsg) -> bool {
        matches!(
            msg,
            PlatoonMsg::VehicleStatus(_)
                | PlatoonMsg::DiscoverAndAssociate(_)
                | PlatoonMsg::DiscoverPlatoons(_)
                | PlatoonMsg::AssociatePlatoon(_)
        )
    }

    /// Handle an envelope addressed to this agent.
    pub fn handle<C: Outbound>(
        &mut self,
        ctx: &mut C,
        envelope: Envelope,
    ) -> Result<(), ConsumerError> {
        match envelope.msg {
            // ---- From the vehicle ----
            PlatoonMsg::VehicleStatus(sample) => {
                self.check_vehicle(sample.vehicle_id)?;
                self.vehicle.get_or_insert(envelope.from);
                trace!("Vehicle {} status at {:.3} s", self.vehicle_id, sample.timestamp_s);
                self.last_sample = Some(sample);
            }
            PlatoonMsg::DiscoverAndAssociate(req) => {
                self.check_vehicle(req.vehicle_id)?;
                self.discover_and_associate(ctx, req);
            }
            PlatoonMsg::DiscoverPlatoons(req) => {
                self.check_vehicle(req.vehicle_id)?;
                self.vehicle = Some(req.reply_to.clone());
                let fwd = DiscoverRequest {
                    reply_to: ctx.local_endpoint(),
                    ..req
                };
                ctx.send(&self.coordinator, PlatoonMsg::DiscoverPlatoons(fwd));
            }
            PlatoonMsg::AssociatePlatoon(req) => {
                self.check_vehicle(req.vehicle_id)?;
                self.vehicle = Some(req.reply_to.clone());
                let fwd = AssociateRequest {
                    reply_to: ctx.local_endpoint(),
                    ..req
                };
                ctx.send(&self.coordinator, PlatoonMsg::AssociatePlatoon(fwd));
                self.set_state(ConsumerState::DiscoveryAndAssociate);
            }
            PlatoonMsg::LeaveRequest(req) => {
                self.check_vehicle(req.vehicle_id)?;
                self.leave(ctx, req);
            }

            // ---- From the coordinator ----
            PlatoonMsg::DiscoverPlatoonsResponse(resp) => {
                self.relay(ctx, PlatoonMsg::DiscoverPlatoonsResponse(resp))
            }
            PlatoonMsg::DiscoverAndAssociateResponse(resp) => {
                self.associated(ctx, resp.clone());
                self.relay(ctx, PlatoonMsg::DiscoverAndAssociateResponse(resp));
            }
            PlatoonMsg::AssociatePlatoonResponse(resp) => {
                self.associated(ctx, resp.clone());
                self.relay(ctx, PlatoonMsg::AssociatePlatoonResponse(resp));
            }

            // ---- From the controller ----
            PlatoonMsg::JoinResponse(resp) => self.join_response(ctx, resp),
            PlatoonMsg::LeaveResponse(resp) => self.leave_response(ctx, resp),
            PlatoonMsg::PlatoonCommand(cmd) => self.relay(ctx, PlatoonMsg::PlatoonCommand(cmd)),
            PlatoonMsg::Notification(notification) => self.notification(ctx, notification),

            msg => return Err(ConsumerError::UnexpectedMessage(self.vehicle_id, msg.name())),
        }

        Ok(())
    }

    fn discover_and_associate<C: Outbound>(&mut self, ctx: &mut C, req: DiscoverAssociateRequest) {
        self.vehicle = Some(req.reply_to.clone());
        self.left = false;

        // The request carries the current position of the vehicle
        self.last_sample = Some(PositionSample {
            vehicle_id: self.vehicle_id,
            position: req.position,
            speed_ms: req.speed_ms,
            timestamp_s: ctx.now_s(),
        });

        let fwd = DiscoverAssociateRequest {
            reply_to: ctx.local_endpoint(),
            ..req
        };
        ctx.send(&self.coordinator, PlatoonMsg::DiscoverAndAssociate(fwd));

        self.set_state(ConsumerState::DiscoveryAndAssociate);
    }

    /// Handle the outcome of an association, joining the platoon on success.
    fn associated<C: Outbound>(&mut self, ctx: &mut C, resp: AssociationResponse) {
        if self.state != ConsumerState::DiscoveryAndAssociate {
            warn!(
                "Vehicle {} received an association response while {:?}, ignored",
                self.vehicle_id, self.state
            );
            return;
        }

        let target = (resp.success, resp.controller_id, resp.controller_endpoint);
        let (controller_id, endpoint) = match target {
            (true, Some(id), Some(ep)) => (id, ep),
            _ => {
                info!("Vehicle {} could not be associated with a platoon", self.vehicle_id);
                self.set_state(ConsumerState::Idle);
                return;
            }
        };

        let (position, speed_ms) = match self.last_sample {
            Some(ref s) => (s.position, s.speed_ms),
            None => (Vec3::zeros(), 0.0),
        };

        ctx.send(
            &endpoint,
            PlatoonMsg::JoinRequest(JoinRequest {
                vehicle_id: self.vehicle_id,
                controller_id,
                producer_id: self.producer_id,
                reply_to: ctx.local_endpoint(),
                position,
                speed_ms,
            }),
        );

        self.controller = Some((controller_id, endpoint));
        self.set_state(ConsumerState::Join);
    }

    fn join_response<C: Outbound>(&mut self, ctx: &mut C, resp: JoinResponse) {
        if resp.success {
            self.set_state(ConsumerState::JoinedPlatoon);
        }
        else {
            self.controller = None;
            self.set_state(ConsumerState::Idle);
        }

        self.relay(ctx, PlatoonMsg::JoinResponse(resp));
    }

    fn leave<C: Outbound>(&mut self, ctx: &mut C, req: LeaveRequest) {
        let (controller_id, endpoint) = match self.controller {
            Some((id, ref ep)) => (id, ep.clone()),
            None => {
                warn!("Vehicle {} asked to leave but has no platoon", self.vehicle_id);
                self.vehicle = Some(req.reply_to.clone());
                self.relay(
                    ctx,
                    PlatoonMsg::LeaveResponse(LeaveResponse {
                        vehicle_id: self.vehicle_id,
                        controller_id: req.controller_id,
                        success: false,
                    }),
                );
                return;
            }
        };

        self.vehicle = Some(req.reply_to);

        ctx.send(
            &endpoint,
            PlatoonMsg::LeaveRequest(LeaveRequest {
                vehicle_id: self.vehicle_id,
                controller_id,
                reply_to: ctx.local_endpoint(),
            }),
        );

        self.set_state(ConsumerState::Leave);
    }

    fn leave_response<C: Outbound>(&mut self, ctx: &mut C, resp: LeaveResponse) {
        if resp.success {
            self.controller = None;
            self.left = true;
            self.set_state(ConsumerState::Idle);
        }
        else if self.controller.is_some() {
            self.set_state(ConsumerState::JoinedPlatoon);
        }

        self.relay(ctx, PlatoonMsg::LeaveResponse(resp));
    }

    fn notification<C: Outbound>(&mut self, ctx: &mut C, notification: ManeuverNotification) {
        match notification.kind {
            ManeuverNotice::JoinManeuver | ManeuverNotice::LeaveManeuver => {
                self.set_state(ConsumerState::Maneuvering)
            }
            ManeuverNotice::QueuedJoin | ManeuverNotice::QueuedLeave => debug!(
                "Vehicle {} request queued: {:?}",
                self.vehicle_id, notification.kind
            ),
        }

        self.relay(ctx, PlatoonMsg::Notification(notification));
    }

    fn relay<C: Outbound>(&self, ctx: &mut C, msg: PlatoonMsg) {
        match self.vehicle {
            Some(ref vehicle) => ctx.send(vehicle, msg),
            None => warn!(
                "Vehicle {} endpoint unknown, {} dropped",
                self.vehicle_id,
                msg.name()
            ),
        }
    }

    fn set_state(&mut self, state: ConsumerState) {
        if self.state != state {
            info!("Consumer {} state change to: {:?}", self.vehicle_id, state);
            self.state = state;
        }
    }

    fn check_vehicle(&self, vehicle_id: VehicleId) -> Result<(), ConsumerError> {
        if vehicle_id == self.vehicle_id {
            Ok(())
        }
        else {
            Err(ConsumerError::WrongVehicle {
                expected: self.vehicle_id,
                got: vehicle_id,
            })
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
