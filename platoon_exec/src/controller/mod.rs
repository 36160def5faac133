//! # Platoon controller
//!
//! A platoon controller owns one platoon. It admits, queues or rejects join and leave requests,
//! tracks the positions of its members through the location service and periodically sends each
//! member an acceleration demand.
//!
//! ## States
//!
//! - `Inactive` - no members and nothing in progress, control timers stopped.
//! - `Cruise` - longitudinal control of the members.
//! - `Maneuver{Join|Leave|CheckPosition}` - lateral control while exactly one vehicle
//!   manoeuvres. `CheckPosition` waits for a fresh sample of a vehicle before deciding whether it
//!   is close enough to join.
//! - `CheckNext` - transient, the next queued request is being selected. Leaves are served
//!   before joins.
//!
//! Longitudinal (`Cruise`) and lateral (`Maneuver`) phases run their control and position update
//! timers at different periods.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod params;
mod requests;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap, VecDeque};

use comms_if::{
    msg::{
        ConfigureControllerResponse, ControllerConfig, ControllerNotification, JoinRequest,
        JoinResponse, LeaveRequest, LeaveResponse, ManeuverNotice, ManeuverNotification,
        MemberRef, NotificationKind, PlatoonCommand, PositionUpdate,
    },
    ControllerId, ControllerState, Endpoint, Envelope, ManeuverKind, PlatoonMsg, ProducerId,
    Vec3, VehicleId,
};
use log::{debug, info, trace, warn};
use util::raise_error;

use crate::{
    context::{ControllerContext, ControllerTimer},
    control_law::{build_law, AccelCommand, ControlLaw, ManeuverStep},
    platoon::{Membership, VehicleState},
};

pub use params::ControllerParams;
pub use requests::{ConsumerRecord, ConsumerStatus, JoinEntry, LeaveEntry, Maneuvering};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Controller of a single platoon.
#[derive(Debug)]
pub struct PlatoonController {
    id: ControllerId,
    producer_id: ProducerId,

    /// Owning coordinator, known once configured
    producer_endpoint: Option<Endpoint>,

    direction: Vec3,

    params: ControllerParams,
    configured: bool,

    longitudinal: Box<dyn ControlLaw>,
    lateral: Box<dyn ControlLaw>,

    state: ControllerState,

    /// Phase whose timers are currently running
    phase: Phase,

    members: Membership,
    records: HashMap<VehicleId, ConsumerRecord>,

    join_queue: VecDeque<JoinEntry>,
    leave_queue: VecDeque<LeaveEntry>,

    maneuvering: Option<Maneuvering>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Longitudinal,
    Lateral,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Controller {0} cannot handle a {1} message")]
    UnexpectedMessage(ControllerId, &'static str),

    #[error("Controller {expected} received a message addressed to controller {got}")]
    WrongController {
        expected: ControllerId,
        got: ControllerId,
    },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PlatoonController {
    /// Create a new, unconfigured, controller.
    pub fn new(
        id: ControllerId,
        producer_id: ProducerId,
        direction: Vec3,
        params: ControllerParams,
    ) -> Self {
        let longitudinal = build_law(
            params.longitudinal_law,
            &params.law,
            params.longitudinal_control_period_s,
        );
        let lateral = build_law(params.lateral_law, &params.law, params.lateral_control_period_s);

        Self {
            id,
            producer_id,
            producer_endpoint: None,
            direction,
            params,
            configured: false,
            longitudinal,
            lateral,
            state: ControllerState::Inactive,
            phase: Phase::Stopped,
            members: Membership::new(),
            records: HashMap::new(),
            join_queue: VecDeque::new(),
            leave_queue: VecDeque::new(),
            maneuvering: None,
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn direction(&self) -> &Vec3 {
        &self.direction
    }

    pub fn members(&self) -> &Membership {
        &self.members
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// The vehicle currently manoeuvring, if any.
    pub fn maneuvering_vehicle(&self) -> Option<VehicleId> {
        self.maneuvering.as_ref().map(|m| m.vehicle_id())
    }

    pub fn join_queue_len(&self) -> usize {
        self.join_queue.len()
    }

    pub fn leave_queue_len(&self) -> usize {
        self.leave_queue.len()
    }

    /// Status of the consumer of `vehicle_id`, `NotJoined` if the controller has no record of it.
    pub fn status_of(&self, vehicle_id: VehicleId) -> ConsumerStatus {
        self.records
            .get(&vehicle_id)
            .map(|r| r.status)
            .unwrap_or(ConsumerStatus::NotJoined)
    }

    /// Vehicles waiting to join, followed by the vehicle manoeuvring to join.
    pub fn queued_joins(&self) -> Vec<VehicleId> {
        let mut queued: Vec<VehicleId> = self.join_queue.iter().map(|e| e.vehicle_id).collect();
        if let Some(Maneuvering::Joining { request, .. }) = &self.maneuvering {
            queued.push(request.vehicle_id);
        }
        queued
    }

    /// Handle an envelope addressed to this controller.
    pub fn handle<C: ControllerContext>(
        &mut self,
        ctx: &mut C,
        envelope: Envelope,
    ) -> Result<(), ControllerError> {
        match envelope.msg {
            PlatoonMsg::ConfigureController(config) => {
                self.check_addressed(config.controller_id)?;
                self.configure(ctx, config);
            }
            PlatoonMsg::JoinRequest(req) => {
                self.check_addressed(req.controller_id)?;
                self.handle_join_request(ctx, req);
            }
            PlatoonMsg::LeaveRequest(req) => {
                self.check_addressed(req.controller_id)?;
                self.handle_leave_request(ctx, req);
            }
            PlatoonMsg::PositionUpdate(update) => {
                self.check_addressed(update.controller_id)?;
                self.handle_position_update(ctx, update);
            }
            msg => return Err(ControllerError::UnexpectedMessage(self.id, msg.name())),
        }

        Ok(())
    }

    /// Handle the expiry of one of this controller's timers.
    pub fn handle_timer<C: ControllerContext>(&mut self, ctx: &mut C, timer: ControllerTimer) {
        match timer {
            ControllerTimer::Control => self.control_tick(ctx),
            ControllerTimer::PositionUpdate => self.position_update_tick(ctx),
            ControllerTimer::Heartbeat => {
                self.notify_producer(ctx, NotificationKind::Heartbeat, None);
                ctx.start_timer(ControllerTimer::Heartbeat, self.params.heartbeat_period_s);
            }
        }
    }

    /// Apply the configuration sent by the owning coordinator.
    ///
    /// Configuration happens once, any further configuration is acknowledged negatively.
    pub fn configure<C: ControllerContext>(&mut self, ctx: &mut C, config: ControllerConfig) {
        let reply_to = config.producer_endpoint.clone();

        if self.configured {
            warn!(
                "Controller {} is already configured, rejecting the new configuration",
                self.id
            );
            ctx.send(
                &reply_to,
                PlatoonMsg::ConfigureControllerResponse(ConfigureControllerResponse {
                    controller_id: self.id,
                    success: false,
                }),
            );
            return;
        }

        self.producer_id = config.producer_id;
        self.producer_endpoint = Some(config.producer_endpoint);
        self.direction = config.direction;

        self.params.heartbeat_period_s = config.heartbeat_period_s;
        self.params.longitudinal_control_period_s = config.longitudinal_control_period_s;
        self.params.longitudinal_update_period_s = config.longitudinal_update_period_s;
        self.params.lateral_control_period_s = config.lateral_control_period_s;
        self.params.lateral_update_period_s = config.lateral_update_period_s;
        self.params.control_offset_s = config.control_offset_s;
        self.params.longitudinal_law = config.longitudinal_law;
        self.params.lateral_law = config.lateral_law;
        self.params.adjust_positions = config.adjust_positions;
        self.params.send_bulk = config.send_bulk;

        self.longitudinal = build_law(
            config.longitudinal_law,
            &self.params.law,
            config.longitudinal_control_period_s,
        );
        self.lateral = build_law(
            config.lateral_law,
            &self.params.law,
            config.lateral_control_period_s,
        );

        self.configured = true;

        ctx.start_timer(ControllerTimer::Heartbeat, self.params.heartbeat_period_s);

        info!(
            "Controller {} configured: direction {:?}, laws {:?}/{:?}",
            self.id,
            self.direction.as_slice(),
            self.params.longitudinal_law,
            self.params.lateral_law
        );

        ctx.send(
            &reply_to,
            PlatoonMsg::ConfigureControllerResponse(ConfigureControllerResponse {
                controller_id: self.id,
                success: true,
            }),
        );
    }

    /// Handle a join request fresh from a consumer.
    pub fn handle_join_request<C: ControllerContext>(&mut self, ctx: &mut C, req: JoinRequest) {
        if let Some(status) = self.records.get(&req.vehicle_id).map(|r| r.status) {
            self.repeated_join(ctx, req, status);
            return;
        }

        self.process_join(ctx, JoinEntry::from(req));
    }

    /// Handle a leave request fresh from a consumer.
    pub fn handle_leave_request<C: ControllerContext>(&mut self, ctx: &mut C, req: LeaveRequest) {
        self.process_leave(ctx, LeaveEntry::from(req), false);
    }

    /// Apply a batch of samples from the location service.
    pub fn handle_position_update<C: ControllerContext>(
        &mut self,
        ctx: &mut C,
        update: PositionUpdate,
    ) {
        let mut waiting_sampled = false;

        for sample in update.samples.iter() {
            if let Some(member) = self.members.get_mut(sample.vehicle_id) {
                member.update(sample);
                continue;
            }

            match &mut self.maneuvering {
                Some(Maneuvering::Joining { state, .. })
                    if state.vehicle_id == sample.vehicle_id =>
                {
                    state.update(sample);
                    waiting_sampled = true;
                }
                _ => debug!(
                    "Controller {} discarding sample of unknown vehicle {}",
                    self.id, sample.vehicle_id
                ),
            }
        }

        self.check_order(ctx);

        if waiting_sampled && self.state == ControllerState::Maneuver(ManeuverKind::CheckPosition) {
            self.check_waiting_position(ctx);
        }
    }

    // --------------------------------------------------------------------------------------------
    // JOIN
    // --------------------------------------------------------------------------------------------

    fn process_join<C: ControllerContext>(&mut self, ctx: &mut C, entry: JoinEntry) {
        match self.state {
            ControllerState::Inactive => self.start_join_maneuver(ctx, entry),
            ControllerState::CheckNext if self.members.is_empty() => {
                self.start_join_maneuver(ctx, entry)
            }
            ControllerState::Cruise | ControllerState::CheckNext => {
                let vehicle_id = entry.vehicle_id;
                let producer_id = entry.producer_id;

                self.set_record(&entry, ConsumerStatus::ManeuveringToJoin);
                self.set_joining(ctx, entry);

                // The request only carries the position the vehicle had when it asked, wait for a
                // fresh one before admitting it.
                ctx.request_positions(producer_id, vec![vehicle_id]);
                self.switch_state(ctx, ControllerState::Maneuver(ManeuverKind::CheckPosition));
            }
            ControllerState::Maneuver(_) => {
                let too_far = match self.members.last() {
                    Some(last) => {
                        (entry.position - last.position).norm() > self.params.admission_threshold_m
                    }
                    None => false,
                };

                if too_far {
                    info!(
                        "Controller {} rejecting join of vehicle {}, too far from the platoon",
                        self.id, entry.vehicle_id
                    );
                    self.finalize_join(ctx, entry, false);
                }
                else {
                    info!(
                        "Controller {} queueing join of vehicle {}",
                        self.id, entry.vehicle_id
                    );
                    self.set_record(&entry, ConsumerStatus::QueuedJoin);
                    self.notify_vehicle(
                        ctx,
                        &entry.reply_to,
                        entry.vehicle_id,
                        ManeuverNotice::QueuedJoin,
                    );
                    self.join_queue.push_back(entry);
                }
            }
        }
    }

    /// Answer a join request from a vehicle the controller already knows with where it stands.
    fn repeated_join<C: ControllerContext>(
        &self,
        ctx: &mut C,
        req: JoinRequest,
        status: ConsumerStatus,
    ) {
        debug!(
            "Controller {} received another join request from vehicle {}, which is {:?}",
            self.id, req.vehicle_id, status
        );

        match status {
            ConsumerStatus::Joined => ctx.send(
                &req.reply_to,
                PlatoonMsg::JoinResponse(JoinResponse {
                    vehicle_id: req.vehicle_id,
                    controller_id: self.id,
                    success: true,
                }),
            ),
            ConsumerStatus::QueuedJoin => self.notify_vehicle(
                ctx,
                &req.reply_to,
                req.vehicle_id,
                ManeuverNotice::QueuedJoin,
            ),
            ConsumerStatus::ManeuveringToJoin
                if self.state == ControllerState::Maneuver(ManeuverKind::Join) =>
            {
                self.notify_vehicle(
                    ctx,
                    &req.reply_to,
                    req.vehicle_id,
                    ManeuverNotice::JoinManeuver,
                )
            }
            _ => warn!(
                "Controller {} ignoring join request from vehicle {} while {:?}",
                self.id, req.vehicle_id, status
            ),
        }
    }

    fn start_join_maneuver<C: ControllerContext>(&mut self, ctx: &mut C, entry: JoinEntry) {
        let reply_to = entry.reply_to.clone();
        let vehicle_id = entry.vehicle_id;

        self.set_record(&entry, ConsumerStatus::ManeuveringToJoin);
        self.set_joining(ctx, entry);
        self.switch_state(ctx, ControllerState::Maneuver(ManeuverKind::Join));
        self.notify_vehicle(ctx, &reply_to, vehicle_id, ManeuverNotice::JoinManeuver);
    }

    /// Decide on the vehicle waiting in `CheckPosition` now that a fresh sample is available.
    fn check_waiting_position<C: ControllerContext>(&mut self, ctx: &mut C) {
        let (request, distance_m) = match &self.maneuvering {
            Some(Maneuvering::Joining { request, state }) => (
                request.clone(),
                self.members.last().map(|last| state.distance_to(last)),
            ),
            _ => return,
        };

        match distance_m {
            Some(d) if d > self.params.admission_threshold_m => {
                info!(
                    "Controller {} rejecting join of vehicle {}, {:.1} m from the platoon",
                    self.id, request.vehicle_id, d
                );
                self.finalize_join(ctx, request, false);
                self.check_next_request(ctx);
            }
            _ => {
                self.switch_state(ctx, ControllerState::Maneuver(ManeuverKind::Join));
                self.notify_vehicle(
                    ctx,
                    &request.reply_to,
                    request.vehicle_id,
                    ManeuverNotice::JoinManeuver,
                );
            }
        }
    }

    /// Conclude a join request, adding the vehicle to the platoon on success.
    ///
    /// If the vehicle was manoeuvring its tracked state is used for the insertion and the
    /// manoeuvring slot is cleared.
    pub fn finalize_join<C: ControllerContext>(
        &mut self,
        ctx: &mut C,
        request: JoinEntry,
        success: bool,
    ) {
        let vehicle_id = request.vehicle_id;

        let tracked = match self.maneuvering.take() {
            Some(Maneuvering::Joining { request: r, state }) if r.vehicle_id == vehicle_id => {
                Some(state)
            }
            other => {
                self.maneuvering = other;
                None
            }
        };

        if success {
            let state = tracked.unwrap_or_else(|| {
                VehicleState::new(
                    vehicle_id,
                    request.reply_to.clone(),
                    request.producer_id,
                    request.position,
                    request.speed_ms,
                    ctx.now_s(),
                )
            });

            let position = self.members.insert(state, &self.direction);
            self.set_record(&request, ConsumerStatus::Joined);

            info!(
                "Vehicle {} joined platoon {} at position {}",
                vehicle_id, self.id, position
            );
            self.check_order(ctx);

            self.notify_producer(
                ctx,
                NotificationKind::NewMember,
                Some(MemberRef {
                    vehicle_id,
                    consumer: request.reply_to.clone(),
                }),
            );
        }
        else {
            self.records.remove(&vehicle_id);
        }

        ctx.send(
            &request.reply_to,
            PlatoonMsg::JoinResponse(JoinResponse {
                vehicle_id,
                controller_id: self.id,
                success,
            }),
        );
    }

    // --------------------------------------------------------------------------------------------
    // LEAVE
    // --------------------------------------------------------------------------------------------

    fn process_leave<C: ControllerContext>(
        &mut self,
        ctx: &mut C,
        entry: LeaveEntry,
        from_queue: bool,
    ) {
        let vehicle_id = entry.vehicle_id;

        match self.status_of(vehicle_id) {
            ConsumerStatus::Joined => self.dispatch_leave(ctx, entry),
            ConsumerStatus::QueuedLeave if from_queue => self.dispatch_leave(ctx, entry),
            ConsumerStatus::QueuedLeave | ConsumerStatus::ManeuveringToLeave => {
                debug!(
                    "Controller {} discarding duplicate leave of vehicle {}",
                    self.id, vehicle_id
                );
            }
            ConsumerStatus::QueuedJoin => {
                self.join_queue.retain(|e| e.vehicle_id != vehicle_id);
                info!(
                    "Vehicle {} left the join queue of platoon {}",
                    vehicle_id, self.id
                );
                self.finalize_leave(ctx, entry, true);
            }
            ConsumerStatus::ManeuveringToJoin => {
                info!(
                    "Vehicle {} aborted its join manoeuvre on platoon {}",
                    vehicle_id, self.id
                );
                self.maneuvering = None;
                self.finalize_leave(ctx, entry, true);
                self.check_next_request(ctx);
            }
            ConsumerStatus::NotJoined => {
                info!(
                    "Controller {} rejecting leave of unknown vehicle {}",
                    self.id, vehicle_id
                );
                self.finalize_leave(ctx, entry, false);
            }
        }
    }

    /// Start, or queue, the leave of a member.
    fn dispatch_leave<C: ControllerContext>(&mut self, ctx: &mut C, entry: LeaveEntry) {
        match self.state {
            ControllerState::Maneuver(ManeuverKind::Leave) => {
                info!(
                    "Controller {} queueing leave of vehicle {}",
                    self.id, entry.vehicle_id
                );
                self.set_status(entry.vehicle_id, ConsumerStatus::QueuedLeave);
                self.notify_consumer(ctx, entry.vehicle_id, ManeuverNotice::QueuedLeave);
                self.leave_queue.push_back(entry);
            }
            ControllerState::Maneuver(_) => {
                // Leaves take priority, put the joiner back at the front of the queue
                if let Some(Maneuvering::Joining { request, .. }) = self.maneuvering.take() {
                    info!(
                        "Controller {} pre-empting the join of vehicle {} for the leave of {}",
                        self.id, request.vehicle_id, entry.vehicle_id
                    );
                    self.set_status(request.vehicle_id, ConsumerStatus::QueuedJoin);
                    self.notify_vehicle(
                        ctx,
                        &request.reply_to,
                        request.vehicle_id,
                        ManeuverNotice::QueuedJoin,
                    );
                    self.join_queue.push_front(request);
                }
                self.start_leave_maneuver(ctx, entry);
            }
            _ => self.start_leave_maneuver(ctx, entry),
        }
    }

    fn start_leave_maneuver<C: ControllerContext>(&mut self, ctx: &mut C, entry: LeaveEntry) {
        let vehicle_id = entry.vehicle_id;

        self.set_status(vehicle_id, ConsumerStatus::ManeuveringToLeave);
        self.set_maneuvering(Maneuvering::Leaving { request: entry });
        self.switch_state(ctx, ControllerState::Maneuver(ManeuverKind::Leave));
        self.notify_consumer(ctx, vehicle_id, ManeuverNotice::LeaveManeuver);
    }

    /// Conclude a leave request, removing the vehicle from the platoon on success.
    ///
    /// Once nothing is left to control the outbound connections are released and the coordinator
    /// is told that this controller has stopped.
    pub fn finalize_leave<C: ControllerContext>(
        &mut self,
        ctx: &mut C,
        request: LeaveEntry,
        success: bool,
    ) {
        let vehicle_id = request.vehicle_id;

        if success {
            if self.maneuvering_vehicle() == Some(vehicle_id) {
                self.maneuvering = None;
            }

            self.members.remove(vehicle_id);
            let consumer = self
                .records
                .remove(&vehicle_id)
                .map(|r| r.consumer)
                .unwrap_or_else(|| request.reply_to.clone());

            info!("Vehicle {} left platoon {}", vehicle_id, self.id);

            self.notify_producer(
                ctx,
                NotificationKind::RemovedMember,
                Some(MemberRef {
                    vehicle_id,
                    consumer,
                }),
            );

            if self.is_idle() {
                ctx.release_connections();
                info!("Platoon {} is empty, stopping", self.id);
                self.notify_producer(ctx, NotificationKind::Stopped, None);
            }
        }

        ctx.send(
            &request.reply_to,
            PlatoonMsg::LeaveResponse(LeaveResponse {
                vehicle_id,
                controller_id: self.id,
                success,
            }),
        );
    }

    // --------------------------------------------------------------------------------------------
    // STATE MACHINE
    // --------------------------------------------------------------------------------------------

    /// Serve the next queued request, leaves first, or settle in `Cruise`/`Inactive`.
    pub fn check_next_request<C: ControllerContext>(&mut self, ctx: &mut C) {
        self.switch_state(ctx, ControllerState::CheckNext);

        // A popped request may be rejected outright, keep going until one is served
        while self.state == ControllerState::CheckNext {
            if let Some(entry) = self.leave_queue.pop_front() {
                self.process_leave(ctx, entry, true);
            }
            else if let Some(entry) = self.join_queue.pop_front() {
                self.process_join(ctx, entry);
            }
            else if self.members.is_empty() {
                self.switch_state(ctx, ControllerState::Inactive);
            }
            else {
                self.switch_state(ctx, ControllerState::Cruise);
            }
        }
    }

    fn switch_state<C: ControllerContext>(&mut self, ctx: &mut C, next: ControllerState) {
        if next == self.state {
            return;
        }

        let next_phase = match next {
            ControllerState::Inactive => Phase::Stopped,
            ControllerState::Cruise => Phase::Longitudinal,
            ControllerState::Maneuver(_) => Phase::Lateral,
            ControllerState::CheckNext => self.phase,
        };

        if next_phase != self.phase {
            ctx.stop_timer(ControllerTimer::Control);
            ctx.stop_timer(ControllerTimer::PositionUpdate);

            if let Some((control_s, update_s)) = self.periods(next_phase) {
                ctx.start_timer(ControllerTimer::PositionUpdate, update_s);
                ctx.start_timer(
                    ControllerTimer::Control,
                    control_s + self.params.control_offset_s,
                );
            }

            self.phase = next_phase;
        }

        info!("Controller {} state change to: {}", self.id, next);
        self.state = next;
    }

    /// Control and position update periods of a phase.
    fn periods(&self, phase: Phase) -> Option<(f64, f64)> {
        match phase {
            Phase::Stopped => None,
            Phase::Longitudinal => Some((
                self.params.longitudinal_control_period_s,
                self.params.longitudinal_update_period_s,
            )),
            Phase::Lateral => Some((
                self.params.lateral_control_period_s,
                self.params.lateral_update_period_s,
            )),
        }
    }

    fn set_maneuvering(&mut self, maneuvering: Maneuvering) {
        if let Some(current) = &self.maneuvering {
            raise_error!(
                "Controller {} cannot manoeuvre vehicle {} while vehicle {} is manoeuvring",
                self.id,
                maneuvering.vehicle_id(),
                current.vehicle_id()
            );
        }
        self.maneuvering = Some(maneuvering);
    }

    fn set_joining<C: ControllerContext>(&mut self, ctx: &mut C, entry: JoinEntry) {
        let state = VehicleState::new(
            entry.vehicle_id,
            entry.reply_to.clone(),
            entry.producer_id,
            entry.position,
            entry.speed_ms,
            ctx.now_s(),
        );
        self.set_maneuvering(Maneuvering::Joining {
            request: entry,
            state,
        });
    }

    /// True when there is nothing left for this controller to do.
    fn is_idle(&self) -> bool {
        self.members.is_empty()
            && self.join_queue.is_empty()
            && self.leave_queue.is_empty()
            && self.maneuvering.is_none()
    }

    // --------------------------------------------------------------------------------------------
    // PERIODIC
    // --------------------------------------------------------------------------------------------

    fn control_tick<C: ControllerContext>(&mut self, ctx: &mut C) {
        if self.params.adjust_positions {
            self.adjust_positions(ctx.now_s());
            self.check_order(ctx);
        }

        match self.state {
            ControllerState::Cruise => {
                let commands = self.longitudinal.control_platoon(&self.members, &self.direction);
                self.send_commands(ctx, &commands);

                ctx.start_timer(
                    ControllerTimer::Control,
                    self.params.longitudinal_control_period_s,
                );
            }
            ControllerState::Maneuver(kind) => {
                let step = match (kind, &self.maneuvering) {
                    (ManeuverKind::Join, Some(Maneuvering::Joining { state, .. })) => {
                        self.lateral.join_step(&self.members, &self.direction, state)
                    }
                    (ManeuverKind::Leave, Some(Maneuvering::Leaving { request })) => {
                        self.lateral
                            .leave_step(&self.members, &self.direction, request.vehicle_id)
                    }
                    (ManeuverKind::CheckPosition, _) => ManeuverStep {
                        commands: self.lateral.control_platoon(&self.members, &self.direction),
                        completed: false,
                    },
                    (kind, m) => raise_error!(
                        "Controller {} in {:?} manoeuvre with manoeuvring vehicle {:?}",
                        self.id,
                        kind,
                        m.as_ref().map(|m| m.vehicle_id())
                    ),
                };

                self.send_commands(ctx, &step.commands);

                ctx.start_timer(ControllerTimer::Control, self.params.lateral_control_period_s);

                if step.completed {
                    self.complete_maneuver(ctx);
                }
            }
            _ => trace!("Controller {} control tick in {}", self.id, self.state),
        }
    }

    fn complete_maneuver<C: ControllerContext>(&mut self, ctx: &mut C) {
        match self.maneuvering.clone() {
            Some(Maneuvering::Joining { request, .. }) => self.finalize_join(ctx, request, true),
            Some(Maneuvering::Leaving { request }) => self.finalize_leave(ctx, request, true),
            None => return,
        }
        self.check_next_request(ctx);
    }

    fn position_update_tick<C: ControllerContext>(&mut self, ctx: &mut C) {
        let period_s = match self.periods(self.phase) {
            Some((_, update_s)) => update_s,
            None => return,
        };

        let mut by_producer: BTreeMap<ProducerId, Vec<VehicleId>> = BTreeMap::new();
        for member in self.members.iter() {
            by_producer
                .entry(member.producer_id)
                .or_default()
                .push(member.vehicle_id);
        }
        if let Some(Maneuvering::Joining { request, .. }) = &self.maneuvering {
            by_producer
                .entry(request.producer_id)
                .or_default()
                .push(request.vehicle_id);
        }

        for (producer_id, vehicles) in by_producer {
            if self.params.send_bulk {
                ctx.request_positions(producer_id, vehicles);
            }
            else {
                for vehicle_id in vehicles {
                    ctx.request_positions(producer_id, vec![vehicle_id]);
                }
            }
        }

        ctx.start_timer(ControllerTimer::PositionUpdate, period_s);
    }

    /// Extrapolate all tracked vehicles to `now_s`.
    fn adjust_positions(&mut self, now_s: f64) {
        let direction = self.direction;

        for member in self.members.states_mut() {
            member.extrapolate(&direction, now_s);
        }
        if let Some(Maneuvering::Joining { state, .. }) = &mut self.maneuvering {
            state.extrapolate(&direction, now_s);
        }
    }

    /// Restore the order of the members once their positions have moved past each other, and
    /// tell the producer about it.
    fn check_order<C: ControllerContext>(&mut self, ctx: &mut C) {
        if self.members.is_ordered(&self.direction) {
            return;
        }

        if self.members.reorder(&self.direction) {
            info!("Platoon {} reordered to {:?}", self.id, self.members.order());
            self.notify_producer(ctx, NotificationKind::NewOrder, None);
        }

        if !self.members.is_ordered(&self.direction) {
            warn!(
                "Platoon {} order {:?} is inconsistent with its direction",
                self.id,
                self.members.order()
            );
        }
    }

    fn send_commands<C: ControllerContext>(&mut self, ctx: &mut C, commands: &[AccelCommand]) {
        for cmd in commands {
            let consumer = match self.records.get(&cmd.vehicle_id) {
                Some(record) => record.consumer.clone(),
                None => {
                    warn!(
                        "Controller {} has no consumer for vehicle {}, command dropped",
                        self.id, cmd.vehicle_id
                    );
                    continue;
                }
            };

            if let Some(member) = self.members.get_mut(cmd.vehicle_id) {
                member.acceleration_mss = cmd.acceleration_mss;
            }
            else if let Some(Maneuvering::Joining { state, .. }) = &mut self.maneuvering {
                if state.vehicle_id == cmd.vehicle_id {
                    state.acceleration_mss = cmd.acceleration_mss;
                }
            }

            ctx.send(
                &consumer,
                PlatoonMsg::PlatoonCommand(PlatoonCommand {
                    vehicle_id: cmd.vehicle_id,
                    controller_id: self.id,
                    acceleration: cmd.acceleration,
                    preceding: cmd.preceding,
                    distance_to_preceding_m: cmd.distance_to_preceding_m,
                    maneuver_ended: cmd.maneuver_ended,
                }),
            );
        }
    }

    // --------------------------------------------------------------------------------------------
    // RECORDS AND NOTIFICATIONS
    // --------------------------------------------------------------------------------------------

    fn set_record(&mut self, entry: &JoinEntry, status: ConsumerStatus) {
        self.records.insert(
            entry.vehicle_id,
            ConsumerRecord {
                consumer: entry.reply_to.clone(),
                producer_id: entry.producer_id,
                status,
            },
        );
    }

    fn set_status(&mut self, vehicle_id: VehicleId, status: ConsumerStatus) {
        match self.records.get_mut(&vehicle_id) {
            Some(record) => record.status = status,
            None => raise_error!(
                "Controller {} has no record of vehicle {} to set to {:?}",
                self.id,
                vehicle_id,
                status
            ),
        }
    }

    fn check_addressed(&self, controller_id: ControllerId) -> Result<(), ControllerError> {
        if controller_id == self.id {
            Ok(())
        }
        else {
            Err(ControllerError::WrongController {
                expected: self.id,
                got: controller_id,
            })
        }
    }

    fn notify_consumer<C: ControllerContext>(
        &self,
        ctx: &mut C,
        vehicle_id: VehicleId,
        kind: ManeuverNotice,
    ) {
        if let Some(record) = self.records.get(&vehicle_id) {
            let consumer = record.consumer.clone();
            self.notify_vehicle(ctx, &consumer, vehicle_id, kind);
        }
    }

    fn notify_vehicle<C: ControllerContext>(
        &self,
        ctx: &mut C,
        consumer: &Endpoint,
        vehicle_id: VehicleId,
        kind: ManeuverNotice,
    ) {
        ctx.send(
            consumer,
            PlatoonMsg::Notification(ManeuverNotification {
                vehicle_id,
                controller_id: self.id,
                kind,
            }),
        );
    }

    fn notify_producer<C: ControllerContext>(
        &self,
        ctx: &mut C,
        kind: NotificationKind,
        member: Option<MemberRef>,
    ) {
        let producer = match self
            .producer_endpoint
            .clone()
            .or_else(|| ctx.lookup_producer(self.producer_id))
        {
            Some(p) => p,
            None => {
                warn!(
                    "Controller {} cannot reach producer {}, {:?} notification dropped",
                    self.id, self.producer_id, kind
                );
                return;
            }
        };

        let notification = ControllerNotification {
            controller_id: self.id,
            producer_id: self.producer_id,
            kind,
            member,
            state: self.state,
            vehicles_order: self.members.order().to_vec(),
            queued_joins: self.queued_joins(),
            tail_position: self.members.last().map(|v| v.position),
            timestamp_s: ctx.now_s(),
        };

        ctx.send(&producer, PlatoonMsg::ControllerNotification(notification));
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::mock::MockCtx;
    use comms_if::{AppRef, PositionSample};
    use proptest::prelude::*;

    const CTRL_ID: ControllerId = 2001;

    fn host() -> Endpoint {
        Endpoint::new("edge-a", 5000, AppRef::Coordinator)
    }

    fn consumer(vehicle_id: VehicleId) -> Endpoint {
        host().with_app(AppRef::Consumer(vehicle_id))
    }

    fn setup() -> (PlatoonController, MockCtx) {
        let mut ctx = MockCtx::new(host().with_app(AppRef::Controller(CTRL_ID)));
        ctx.producers.insert(1, host());

        let mut ctrl = PlatoonController::new(
            CTRL_ID,
            1,
            Vec3::new(1.0, 0.0, 0.0),
            ControllerParams::default(),
        );
        let config = ControllerParams::default().to_config(
            CTRL_ID,
            1,
            host(),
            Vec3::new(1.0, 0.0, 0.0),
        );
        ctrl.configure(&mut ctx, config);
        ctx.take_sent();

        (ctrl, ctx)
    }

    fn join(ctrl: &mut PlatoonController, ctx: &mut MockCtx, vehicle_id: VehicleId, x: f64) {
        ctrl.handle_join_request(
            ctx,
            JoinRequest {
                vehicle_id,
                controller_id: CTRL_ID,
                producer_id: 1,
                reply_to: consumer(vehicle_id),
                position: Vec3::new(x, 0.0, 0.0),
                speed_ms: 20.0,
            },
        );
    }

    fn leave(ctrl: &mut PlatoonController, ctx: &mut MockCtx, vehicle_id: VehicleId) {
        ctrl.handle_leave_request(
            ctx,
            LeaveRequest {
                vehicle_id,
                controller_id: CTRL_ID,
                reply_to: consumer(vehicle_id),
            },
        );
    }

    fn sample(
        ctrl: &mut PlatoonController,
        ctx: &mut MockCtx,
        vehicle_id: VehicleId,
        x: f64,
        y: f64,
    ) {
        let timestamp_s = ctx.now_s;
        ctrl.handle_position_update(
            ctx,
            PositionUpdate {
                controller_id: CTRL_ID,
                samples: vec![PositionSample {
                    vehicle_id,
                    position: Vec3::new(x, y, 0.0),
                    speed_ms: 20.0,
                    timestamp_s,
                }],
            },
        );
    }

    fn tick_control(ctrl: &mut PlatoonController, ctx: &mut MockCtx) {
        ctrl.handle_timer(ctx, ControllerTimer::Control);
    }

    fn notices(ctx: &MockCtx, vehicle_id: VehicleId) -> Vec<ManeuverNotice> {
        ctx.sent_to(AppRef::Consumer(vehicle_id))
            .into_iter()
            .filter_map(|m| match m {
                PlatoonMsg::Notification(n) => Some(n.kind),
                _ => None,
            })
            .collect()
    }

    fn join_responses(ctx: &MockCtx, vehicle_id: VehicleId) -> Vec<bool> {
        ctx.sent_to(AppRef::Consumer(vehicle_id))
            .into_iter()
            .filter_map(|m| match m {
                PlatoonMsg::JoinResponse(r) => Some(r.success),
                _ => None,
            })
            .collect()
    }

    fn leave_responses(ctx: &MockCtx, vehicle_id: VehicleId) -> Vec<bool> {
        ctx.sent_to(AppRef::Consumer(vehicle_id))
            .into_iter()
            .filter_map(|m| match m {
                PlatoonMsg::LeaveResponse(r) => Some(r.success),
                _ => None,
            })
            .collect()
    }

    fn producer_notifications(ctx: &MockCtx) -> Vec<NotificationKind> {
        ctx.sent_to(AppRef::Coordinator)
            .into_iter()
            .filter_map(|m| match m {
                PlatoonMsg::ControllerNotification(n) => Some(n.kind),
                _ => None,
            })
            .collect()
    }

    /// Build a platoon with members at the given x positions, in cruise.
    fn cruising(xs: &[f64]) -> (PlatoonController, MockCtx) {
        let (mut ctrl, mut ctx) = setup();

        for (i, x) in xs.iter().enumerate() {
            let vid = (i + 1) as VehicleId;
            join(&mut ctrl, &mut ctx, vid, *x);
            if ctrl.state() == ControllerState::Maneuver(ManeuverKind::CheckPosition) {
                sample(&mut ctrl, &mut ctx, vid, *x, 0.0);
            }
            tick_control(&mut ctrl, &mut ctx);
            assert_eq!(ctrl.status_of(vid), ConsumerStatus::Joined);
        }
        assert_eq!(ctrl.state(), ControllerState::Cruise);
        ctx.take_sent();

        (ctrl, ctx)
    }

    #[test]
    fn test_configure_once() {
        let (mut ctrl, mut ctx) = setup();
        assert!(ctrl.is_configured());
        assert!(ctx.controller_timers.is_pending(ControllerTimer::Heartbeat));

        let config =
            ControllerParams::default().to_config(CTRL_ID, 1, host(), Vec3::new(1.0, 0.0, 0.0));
        ctrl.configure(&mut ctx, config);

        match ctx.sent_to(AppRef::Coordinator).as_slice() {
            [PlatoonMsg::ConfigureControllerResponse(r)] => assert!(!r.success),
            other => panic!("Unexpected messages {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat() {
        let (mut ctrl, mut ctx) = setup();

        ctrl.handle_timer(&mut ctx, ControllerTimer::Heartbeat);

        assert_eq!(producer_notifications(&ctx), vec![NotificationKind::Heartbeat]);
        assert!(ctx.controller_timers.is_pending(ControllerTimer::Heartbeat));
    }

    #[test]
    fn test_first_join() {
        let (mut ctrl, mut ctx) = setup();

        join(&mut ctrl, &mut ctx, 1, 0.0);
        assert_eq!(ctrl.state(), ControllerState::Maneuver(ManeuverKind::Join));
        assert_eq!(ctrl.maneuvering_vehicle(), Some(1));
        assert_eq!(notices(&ctx, 1), vec![ManeuverNotice::JoinManeuver]);
        assert!(ctx.controller_timers.is_pending(ControllerTimer::Control));
        assert!(ctx.controller_timers.is_pending(ControllerTimer::PositionUpdate));

        tick_control(&mut ctrl, &mut ctx);

        assert_eq!(ctrl.state(), ControllerState::Cruise);
        assert_eq!(ctrl.members().order(), &[1]);
        assert_eq!(ctrl.maneuvering_vehicle(), None);
        assert_eq!(join_responses(&ctx, 1), vec![true]);
        assert_eq!(producer_notifications(&ctx), vec![NotificationKind::NewMember]);
    }

    #[test]
    fn test_join_in_cruise_checks_position() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        join(&mut ctrl, &mut ctx, 2, 80.0);
        assert_eq!(
            ctrl.state(),
            ControllerState::Maneuver(ManeuverKind::CheckPosition)
        );
        assert_eq!(ctx.position_requests.last(), Some(&(1, vec![2])));

        // The fresh sample puts the vehicle close enough
        sample(&mut ctrl, &mut ctx, 2, 85.0, 0.0);
        assert_eq!(ctrl.state(), ControllerState::Maneuver(ManeuverKind::Join));
        assert_eq!(notices(&ctx, 2), vec![ManeuverNotice::JoinManeuver]);

        // Still 15 m behind, not done
        tick_control(&mut ctrl, &mut ctx);
        assert_eq!(ctrl.state(), ControllerState::Maneuver(ManeuverKind::Join));

        sample(&mut ctrl, &mut ctx, 2, 90.5, 0.0);
        tick_control(&mut ctrl, &mut ctx);

        assert_eq!(ctrl.state(), ControllerState::Cruise);
        assert_eq!(ctrl.members().order(), &[1, 2]);
        assert_eq!(join_responses(&ctx, 2), vec![true]);
    }

    #[test]
    fn test_check_position_rejects_far_vehicle() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        join(&mut ctrl, &mut ctx, 2, 90.0);
        sample(&mut ctrl, &mut ctx, 2, -200.0, 0.0);

        assert_eq!(join_responses(&ctx, 2), vec![false]);
        assert_eq!(ctrl.status_of(2), ConsumerStatus::NotJoined);
        assert_eq!(ctrl.maneuvering_vehicle(), None);
        assert_eq!(ctrl.state(), ControllerState::Cruise);
    }

    #[test]
    fn test_join_during_maneuver_queued_or_rejected() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        join(&mut ctrl, &mut ctx, 2, 80.0);
        sample(&mut ctrl, &mut ctx, 2, 80.0, 0.0);
        assert_eq!(ctrl.state(), ControllerState::Maneuver(ManeuverKind::Join));

        // Within the admission threshold of the last member
        join(&mut ctrl, &mut ctx, 3, 70.0);
        assert_eq!(ctrl.status_of(3), ConsumerStatus::QueuedJoin);
        assert_eq!(notices(&ctx, 3), vec![ManeuverNotice::QueuedJoin]);

        // Beyond it
        join(&mut ctrl, &mut ctx, 4, -500.0);
        assert_eq!(join_responses(&ctx, 4), vec![false]);
        assert_eq!(ctrl.status_of(4), ConsumerStatus::NotJoined);

        assert_eq!(ctrl.join_queue_len(), 1);
        assert_eq!(ctrl.queued_joins(), vec![3, 2]);
    }

    #[test]
    fn test_queued_joins_fifo_with_leaves_first() {
        let (mut ctrl, mut ctx) = cruising(&[100.0, 90.0]);

        // Vehicle 3 starts joining, 4 and 5 are queued behind it
        join(&mut ctrl, &mut ctx, 3, 80.0);
        sample(&mut ctrl, &mut ctx, 3, 80.0, 0.0);
        join(&mut ctrl, &mut ctx, 4, 75.0);
        join(&mut ctrl, &mut ctx, 5, 70.0);

        // A leave arriving now pre-empts the join of vehicle 3
        leave(&mut ctrl, &mut ctx, 2);
        assert_eq!(ctrl.state(), ControllerState::Maneuver(ManeuverKind::Leave));
        assert_eq!(ctrl.maneuvering_vehicle(), Some(2));
        assert_eq!(ctrl.status_of(3), ConsumerStatus::QueuedJoin);
        assert_eq!(notices(&ctx, 3).last(), Some(&ManeuverNotice::QueuedJoin));
        assert_eq!(ctrl.queued_joins(), vec![3, 4, 5]);

        // Vehicle 2 completes its lane change
        sample(&mut ctrl, &mut ctx, 2, 90.0, 5.0);
        tick_control(&mut ctrl, &mut ctx);
        assert_eq!(leave_responses(&ctx, 2), vec![true]);
        assert_eq!(ctrl.members().order(), &[1]);

        // Joins are then served in order, 3 first
        let mut served = vec![];
        while let Some(vid) = ctrl.maneuvering_vehicle() {
            served.push(vid);
            if ctrl.state() == ControllerState::Maneuver(ManeuverKind::CheckPosition) {
                sample(&mut ctrl, &mut ctx, vid, 89.5 - 10.0 * (served.len() - 1) as f64, 0.0);
            }
            let last_x = ctrl.members().last().map(|v| v.position[0]).unwrap_or(0.0);
            sample(&mut ctrl, &mut ctx, vid, last_x - 10.0, 0.0);
            tick_control(&mut ctrl, &mut ctx);
        }

        assert_eq!(served, vec![3, 4, 5]);
        assert_eq!(ctrl.members().order(), &[1, 3, 4, 5]);
        assert_eq!(ctrl.state(), ControllerState::Cruise);
        assert!(ctrl.members().is_ordered(ctrl.direction()));
    }

    #[test]
    fn test_leave_during_leave_is_queued() {
        let (mut ctrl, mut ctx) = cruising(&[100.0, 90.0, 80.0]);

        leave(&mut ctrl, &mut ctx, 2);
        assert_eq!(ctrl.state(), ControllerState::Maneuver(ManeuverKind::Leave));
        assert_eq!(notices(&ctx, 2), vec![ManeuverNotice::LeaveManeuver]);

        leave(&mut ctrl, &mut ctx, 3);
        assert_eq!(ctrl.status_of(3), ConsumerStatus::QueuedLeave);
        assert_eq!(notices(&ctx, 3), vec![ManeuverNotice::QueuedLeave]);
        assert_eq!(ctrl.leave_queue_len(), 1);

        // Duplicate leaves change nothing
        leave(&mut ctrl, &mut ctx, 3);
        leave(&mut ctrl, &mut ctx, 2);
        assert_eq!(ctrl.leave_queue_len(), 1);
        assert_eq!(ctrl.maneuvering_vehicle(), Some(2));

        // Vehicle 2 completes, 3 starts
        sample(&mut ctrl, &mut ctx, 2, 90.0, 5.0);
        tick_control(&mut ctrl, &mut ctx);
        assert_eq!(ctrl.maneuvering_vehicle(), Some(3));
        assert_eq!(ctrl.status_of(3), ConsumerStatus::ManeuveringToLeave);
        assert_eq!(ctrl.leave_queue_len(), 0);
    }

    #[test]
    fn test_leave_of_queued_joiner() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        join(&mut ctrl, &mut ctx, 2, 90.0);
        join(&mut ctrl, &mut ctx, 3, 85.0);
        assert_eq!(ctrl.status_of(3), ConsumerStatus::QueuedJoin);

        leave(&mut ctrl, &mut ctx, 3);
        assert_eq!(leave_responses(&ctx, 3), vec![true]);
        assert_eq!(ctrl.join_queue_len(), 0);
        assert_eq!(ctrl.status_of(3), ConsumerStatus::NotJoined);
        assert_eq!(ctrl.maneuvering_vehicle(), Some(2));
    }

    #[test]
    fn test_leave_of_maneuvering_joiner_aborts() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        join(&mut ctrl, &mut ctx, 2, 90.0);
        leave(&mut ctrl, &mut ctx, 2);

        assert_eq!(leave_responses(&ctx, 2), vec![true]);
        assert_eq!(ctrl.maneuvering_vehicle(), None);
        assert_eq!(ctrl.state(), ControllerState::Cruise);
        assert_eq!(ctrl.members().order(), &[1]);
    }

    #[test]
    fn test_leave_of_unknown_rejected() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        leave(&mut ctrl, &mut ctx, 9);

        assert_eq!(leave_responses(&ctx, 9), vec![false]);
        assert_eq!(ctrl.state(), ControllerState::Cruise);
    }

    #[test]
    fn test_join_then_leave_restores_membership() {
        let (mut ctrl, mut ctx) = cruising(&[100.0, 90.0]);
        let before = ctrl.members().order().to_vec();

        join(&mut ctrl, &mut ctx, 3, 80.0);
        sample(&mut ctrl, &mut ctx, 3, 80.0, 0.0);
        tick_control(&mut ctrl, &mut ctx);
        assert_eq!(ctrl.status_of(3), ConsumerStatus::Joined);

        leave(&mut ctrl, &mut ctx, 3);
        sample(&mut ctrl, &mut ctx, 3, 80.0, 5.0);
        tick_control(&mut ctrl, &mut ctx);

        assert_eq!(ctrl.members().order(), before.as_slice());
        assert_eq!(ctrl.state(), ControllerState::Cruise);
    }

    #[test]
    fn test_last_leave_stops_controller() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        // The leader leaves straight away
        leave(&mut ctrl, &mut ctx, 1);
        tick_control(&mut ctrl, &mut ctx);

        assert_eq!(ctrl.state(), ControllerState::Inactive);
        assert!(ctrl.members().is_empty());
        assert_eq!(ctx.releases, 1);
        assert_eq!(
            producer_notifications(&ctx),
            vec![NotificationKind::RemovedMember, NotificationKind::Stopped]
        );
        assert!(!ctx.controller_timers.is_pending(ControllerTimer::Control));
        assert!(!ctx.controller_timers.is_pending(ControllerTimer::PositionUpdate));
    }

    #[test]
    fn test_position_update_requests() {
        let (mut ctrl, mut ctx) = cruising(&[100.0, 90.0]);
        ctx.position_requests.clear();

        ctrl.handle_timer(&mut ctx, ControllerTimer::PositionUpdate);
        assert_eq!(ctx.position_requests, vec![(1, vec![1, 2])]);

        // Joining vehicle is included while it manoeuvres
        join(&mut ctrl, &mut ctx, 3, 80.0);
        sample(&mut ctrl, &mut ctx, 3, 80.0, 0.0);
        ctx.position_requests.clear();
        ctrl.handle_timer(&mut ctx, ControllerTimer::PositionUpdate);
        assert_eq!(ctx.position_requests, vec![(1, vec![1, 2, 3])]);
        assert!(ctx.controller_timers.is_pending(ControllerTimer::PositionUpdate));
    }

    #[test]
    fn test_cruise_commands() {
        let (mut ctrl, mut ctx) = cruising(&[100.0, 90.0]);

        tick_control(&mut ctrl, &mut ctx);

        for vid in &[1, 2] {
            let cmds: Vec<_> = ctx
                .sent_to(AppRef::Consumer(*vid))
                .into_iter()
                .filter(|m| matches!(m, PlatoonMsg::PlatoonCommand(_)))
                .collect();
            assert_eq!(cmds.len(), 1);
        }
        assert!(ctx.controller_timers.is_pending(ControllerTimer::Control));
    }

    #[test]
    fn test_unexpected_message() {
        let (mut ctrl, mut ctx) = setup();

        let res = ctrl.handle(
            &mut ctx,
            Envelope {
                from: host(),
                to: host().with_app(AppRef::Controller(CTRL_ID)),
                msg: PlatoonMsg::JoinResponse(JoinResponse {
                    vehicle_id: 1,
                    controller_id: CTRL_ID,
                    success: true,
                }),
            },
        );
        assert!(matches!(res, Err(ControllerError::UnexpectedMessage(..))));

        let res = ctrl.handle(
            &mut ctx,
            Envelope {
                from: consumer(1),
                to: host().with_app(AppRef::Controller(CTRL_ID)),
                msg: PlatoonMsg::LeaveRequest(LeaveRequest {
                    vehicle_id: 1,
                    controller_id: 42,
                    reply_to: consumer(1),
                }),
            },
        );
        assert!(matches!(res, Err(ControllerError::WrongController { .. })));
    }

    #[test]
    fn test_repeated_join_answered() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        // Already a member
        join(&mut ctrl, &mut ctx, 1, 100.0);
        assert_eq!(join_responses(&ctx, 1), vec![true]);
        assert_eq!(ctrl.members().order(), &[1]);

        // Waiting for a fresh sample, nothing to say yet
        join(&mut ctrl, &mut ctx, 2, 90.0);
        join(&mut ctrl, &mut ctx, 2, 90.0);
        assert!(notices(&ctx, 2).is_empty());
        assert!(join_responses(&ctx, 2).is_empty());

        sample(&mut ctrl, &mut ctx, 2, 90.0, 0.0);
        join(&mut ctrl, &mut ctx, 3, 85.0);
        assert_eq!(ctrl.join_queue_len(), 1);

        join(&mut ctrl, &mut ctx, 2, 90.0);
        join(&mut ctrl, &mut ctx, 3, 85.0);
        assert_eq!(
            notices(&ctx, 2),
            vec![ManeuverNotice::JoinManeuver, ManeuverNotice::JoinManeuver]
        );
        assert_eq!(
            notices(&ctx, 3),
            vec![ManeuverNotice::QueuedJoin, ManeuverNotice::QueuedJoin]
        );
        assert_eq!(ctrl.join_queue_len(), 1);
        assert_eq!(ctrl.maneuvering_vehicle(), Some(2));
    }

    #[test]
    fn test_overtaking_member_reorders() {
        let (mut ctrl, mut ctx) = cruising(&[100.0, 90.0]);

        sample(&mut ctrl, &mut ctx, 2, 110.0, 0.0);

        assert_eq!(ctrl.members().order(), &[2, 1]);
        assert_eq!(ctrl.members().leader().map(|v| v.vehicle_id), Some(2));
        match ctx.sent_to(AppRef::Coordinator).as_slice() {
            [PlatoonMsg::ControllerNotification(n)] => {
                assert_eq!(n.kind, NotificationKind::NewOrder);
                assert_eq!(n.vehicles_order, vec![2, 1]);
            }
            other => panic!("Expected a new order notification, got {:?}", other),
        }

        // Samples keeping the order change nothing
        ctx.take_sent();
        sample(&mut ctrl, &mut ctx, 1, 105.0, 0.0);
        assert_eq!(ctrl.members().order(), &[2, 1]);
        assert!(producer_notifications(&ctx).is_empty());
    }

    #[test]
    #[should_panic(expected = "while vehicle 2 is manoeuvring")]
    fn test_second_maneuvering_vehicle_is_fatal() {
        let (mut ctrl, mut ctx) = cruising(&[100.0]);

        join(&mut ctrl, &mut ctx, 2, 90.0);
        assert_eq!(ctrl.maneuvering_vehicle(), Some(2));

        ctrl.set_maneuvering(Maneuvering::Leaving {
            request: LeaveEntry {
                vehicle_id: 1,
                reply_to: consumer(1),
            },
        });
    }

    #[test]
    #[should_panic(expected = "manoeuvre with manoeuvring vehicle None")]
    fn test_maneuver_without_vehicle_is_fatal() {
        let (mut ctrl, mut ctx) = cruising(&[100.0, 90.0]);

        leave(&mut ctrl, &mut ctx, 2);
        assert_eq!(ctrl.state(), ControllerState::Maneuver(ManeuverKind::Leave));

        ctrl.maneuvering = None;
        tick_control(&mut ctrl, &mut ctx);
    }

    #[test]
    #[should_panic(expected = "has no record of vehicle 9")]
    fn test_status_of_unknown_vehicle_is_fatal() {
        let (mut ctrl, _) = setup();

        ctrl.set_status(9, ConsumerStatus::Joined);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(VehicleId, f64),
        Leave(VehicleId),
        Sample(VehicleId, f64, f64),
        Tick,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..7, 0.0f64..150.0).prop_map(|(v, x)| Op::Join(v, x)),
            (1u32..7).prop_map(Op::Leave),
            (1u32..7, 0.0f64..150.0, 0.0f64..6.0).prop_map(|(v, x, y)| Op::Sample(v, x, y)),
            Just(Op::Tick),
        ]
    }

    proptest! {
        /// Whatever the sequence of requests, samples and ticks, at most one vehicle manoeuvres,
        /// repeated leaves change nothing and the members stay ordered.
        #[test]
        fn prop_request_sequences(ops in prop::collection::vec(op(), 1..40)) {
            let (mut ctrl, mut ctx) = setup();

            for op in ops {
                match op {
                    Op::Join(vid, x) => join(&mut ctrl, &mut ctx, vid, x),
                    Op::Leave(vid) => {
                        let repeated = matches!(
                            ctrl.status_of(vid),
                            ConsumerStatus::QueuedLeave | ConsumerStatus::ManeuveringToLeave
                        );
                        let before = (
                            ctrl.join_queue_len(),
                            ctrl.leave_queue_len(),
                            ctrl.maneuvering_vehicle(),
                            ctrl.members().order().to_vec(),
                        );

                        leave(&mut ctrl, &mut ctx, vid);

                        if repeated {
                            let after = (
                                ctrl.join_queue_len(),
                                ctrl.leave_queue_len(),
                                ctrl.maneuvering_vehicle(),
                                ctrl.members().order().to_vec(),
                            );
                            prop_assert_eq!(before, after);
                        }
                    }
                    Op::Sample(vid, x, y) => sample(&mut ctrl, &mut ctx, vid, x, y),
                    Op::Tick => {
                        ctx.now_s += 0.1;
                        tick_control(&mut ctrl, &mut ctx);
                    }
                }

                let maneuvering = ctrl
                    .records
                    .values()
                    .filter(|r| {
                        matches!(
                            r.status,
                            ConsumerStatus::ManeuveringToJoin | ConsumerStatus::ManeuveringToLeave
                        )
                    })
                    .count();
                prop_assert!(maneuvering <= 1);
                prop_assert_eq!(maneuvering, ctrl.maneuvering_vehicle().iter().count());

                prop_assert!(ctrl.members().is_ordered(ctrl.direction()));
                for vid in ctrl.members().order() {
                    prop_assert!(ctrl.maneuvering_vehicle() == Some(*vid)
                        || ctrl.status_of(*vid) == ConsumerStatus::Joined
                        || ctrl.status_of(*vid) == ConsumerStatus::QueuedLeave);
                }
            }
        }
    }
}
