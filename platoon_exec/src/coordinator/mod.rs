//! # Producer coordinator
//!
//! One coordinator runs on each edge host. It keeps a directory of the controllers it owns,
//! federates platoon discovery with the coordinators of the other hosts, selects a platoon for
//! each vehicle asking to be associated with one, and instantiates a new controller when no
//! existing platoon fits.
//!
//! Waiting is done by correlation. Discovery requests wait on the request id of the in-flight
//! round, association requests wait on the id of the controller being instantiated.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod directory;
mod federation;
mod params;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, VecDeque};

use comms_if::{
    msg::{
        AssociateRequest, AssociationResponse, AvailablePlatoonsRequest,
        AvailablePlatoonsResponse, ControllerNotification, DiscoverAssociateRequest,
        DiscoverRequest, DiscoverResponse, InstantiationRequest, InstantiationResponse,
        NotificationKind,
    },
    ControllerId, Endpoint, Envelope, PlatoonMsg, PlatoonSummary, ProducerId, RequestId, Vec3,
    VehicleId,
};
use log::{debug, info, trace, warn};
use util::raise_error;

use crate::{
    context::{CoordinatorContext, CoordinatorTimer},
    selection::{NearestTailSelection, PlatoonIndex, PlatoonSelection},
};

pub use directory::{ControllerEntry, Directory};
pub use federation::{DiscoveryRound, FederationRecord, RoundUpdate};
pub use params::{CoordinatorParams, PeerParams};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct ProducerCoordinator {
    producer_id: ProducerId,
    params: CoordinatorParams,
    selection: Box<dyn PlatoonSelection>,

    directory: Directory,

    round: Option<DiscoveryRound>,
    next_request_id: RequestId,

    /// Requests resolved at the end of the current discovery round
    discovery_queue: VecDeque<DiscoveryRequest>,

    /// Requests waiting for a controller, local or remote, to be instantiated
    instantiation_queue: BTreeMap<ControllerId, Vec<AssociationRequest>>,

    /// Peers waiting to be told when one of the local controllers is instantiated
    waiting_peers: BTreeMap<ControllerId, Vec<Endpoint>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Coordinator {0} cannot handle a {1} message")]
    UnexpectedMessage(ProducerId, &'static str),
}

/// A request which needs the federation catalog before it can be answered.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryRequest {
    Discover(DiscoverRequest),
    DiscoverAssociate(DiscoverAssociateRequest),
}

/// A request which is answered with a controller endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationRequest {
    /// Associate with the best platoon found during discovery
    Discovered(DiscoverAssociateRequest),

    /// Associate with a named controller
    Direct(AssociateRequest),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl AssociationRequest {
    pub fn vehicle_id(&self) -> VehicleId {
        match self {
            AssociationRequest::Discovered(r) => r.vehicle_id,
            AssociationRequest::Direct(r) => r.vehicle_id,
        }
    }
}

impl ProducerCoordinator {
    /// Create a coordinator selecting platoons with [`NearestTailSelection`].
    pub fn new(params: CoordinatorParams) -> Self {
        let selection = Box::new(NearestTailSelection::new(params.selection.clone()));
        Self::with_selection(params, selection)
    }

    pub fn with_selection(params: CoordinatorParams, selection: Box<dyn PlatoonSelection>) -> Self {
        Self {
            producer_id: params.producer_id,
            directory: Directory::new(params.producer_id),
            params,
            selection,
            round: None,
            next_request_id: 1,
            discovery_queue: VecDeque::new(),
            instantiation_queue: BTreeMap::new(),
            waiting_peers: BTreeMap::new(),
        }
    }

    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    pub fn params(&self) -> &CoordinatorParams {
        &self.params
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Request id of the in-flight discovery round, if any.
    pub fn current_round(&self) -> Option<RequestId> {
        self.round.as_ref().map(|r| r.request_id)
    }

    pub fn discovery_queue_len(&self) -> usize {
        self.discovery_queue.len()
    }

    /// Number of requests waiting for the given controller to be instantiated.
    pub fn waiting_on(&self, controller_id: ControllerId) -> usize {
        self.instantiation_queue
            .get(&controller_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Handle an envelope addressed to this coordinator.
    pub fn handle<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        envelope: Envelope,
    ) -> Result<(), CoordinatorError> {
        match envelope.msg {
            PlatoonMsg::DiscoverPlatoons(req) => {
                self.handle_discovery(ctx, DiscoveryRequest::Discover(req))
            }
            PlatoonMsg::DiscoverAndAssociate(req) => {
                self.handle_discovery(ctx, DiscoveryRequest::DiscoverAssociate(req))
            }
            PlatoonMsg::AssociatePlatoon(req) => self.handle_associate(ctx, req),
            PlatoonMsg::AvailablePlatoonsRequest(req) => {
                self.handle_available_platoons_request(ctx, req)
            }
            PlatoonMsg::AvailablePlatoonsResponse(resp) => {
                self.handle_available_platoons_response(ctx, resp)
            }
            PlatoonMsg::InstantiationRequest(req) => self.handle_instantiation_request(ctx, req),
            PlatoonMsg::InstantiationResponse(resp) => {
                self.handle_instantiation_response(ctx, resp)
            }
            PlatoonMsg::ControllerNotification(notification) => {
                self.handle_controller_notification(ctx, notification)
            }
            PlatoonMsg::ConfigureControllerResponse(resp) => {
                if resp.success {
                    debug!("Controller {} acknowledged its configuration", resp.controller_id);
                }
                else {
                    warn!("Controller {} rejected its configuration", resp.controller_id);
                }
            }
            msg => return Err(CoordinatorError::UnexpectedMessage(self.producer_id, msg.name())),
        }

        Ok(())
    }

    /// Handle the expiry of one of this coordinator's timers.
    pub fn handle_timer<C: CoordinatorContext>(&mut self, ctx: &mut C, timer: CoordinatorTimer) {
        match timer {
            CoordinatorTimer::Instantiation(controller_id) => {
                self.complete_instantiation(ctx, controller_id)
            }
            CoordinatorTimer::DiscoveryTimeout => {
                let progress = self
                    .round
                    .as_ref()
                    .map(|r| (r.request_id, r.received(), r.expected()));

                match progress {
                    Some((request_id, received, expected)) => {
                        warn!(
                            "Discovery round {} timed out with {}/{} responses, resolving with \
                             the partial catalog",
                            request_id, received, expected
                        );
                        self.resolve_round(ctx);
                    }
                    None => debug!("Discovery timeout with no round in flight"),
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Discovery
    // --------------------------------------------------------------------------------------------

    fn handle_discovery<C: CoordinatorContext>(&mut self, ctx: &mut C, request: DiscoveryRequest) {
        let peers: Vec<Endpoint> = self
            .params
            .peers
            .iter()
            .filter(|p| p.producer_id != self.producer_id)
            .map(|p| p.endpoint())
            .collect();

        if peers.is_empty() {
            let catalog = self.directory.catalog();
            self.select_and_dispatch(ctx, request, &catalog);
            return;
        }

        match self.round.as_ref() {
            Some(round) => debug!(
                "Discovery request queued on round {} ({}/{} responses)",
                round.request_id,
                round.received(),
                round.expected()
            ),
            None => self.start_round(ctx, &peers),
        }

        self.discovery_queue.push_back(request);
    }

    /// Fan a new round out to `peers` and start its timeout.
    fn start_round<C: CoordinatorContext>(&mut self, ctx: &mut C, peers: &[Endpoint]) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let reply_to = ctx.local_endpoint();
        for peer in peers {
            ctx.send(
                peer,
                PlatoonMsg::AvailablePlatoonsRequest(AvailablePlatoonsRequest {
                    producer_id: self.producer_id,
                    request_id,
                    reply_to: reply_to.clone(),
                }),
            );
        }

        self.round = Some(DiscoveryRound::new(request_id, peers.len()));
        ctx.start_timer(
            CoordinatorTimer::DiscoveryTimeout,
            self.params.discovery_timeout_s,
        );

        debug!("Discovery round {} sent to {} peers", request_id, peers.len());
    }

    fn handle_available_platoons_request<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        req: AvailablePlatoonsRequest,
    ) {
        trace!(
            "Sending the catalog to producer {} for round {}",
            req.producer_id,
            req.request_id
        );

        ctx.send(
            &req.reply_to,
            PlatoonMsg::AvailablePlatoonsResponse(AvailablePlatoonsResponse {
                producer_id: self.producer_id,
                request_id: req.request_id,
                platoons: self.directory.catalog(),
            }),
        );
    }

    fn handle_available_platoons_response<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        resp: AvailablePlatoonsResponse,
    ) {
        let (producer_id, request_id) = (resp.producer_id, resp.request_id);

        let update = match self.round {
            Some(ref mut round) => round.record(resp),
            None => RoundUpdate::Stale,
        };

        match update {
            RoundUpdate::Stale => debug!(
                "Discarding stale catalog of producer {} for round {}",
                producer_id, request_id
            ),
            RoundUpdate::Pending => trace!(
                "Received the catalog of producer {} for round {}",
                producer_id,
                request_id
            ),
            RoundUpdate::Complete => self.resolve_round(ctx),
        }
    }

    /// Close the current round and answer every request queued on it.
    fn resolve_round<C: CoordinatorContext>(&mut self, ctx: &mut C) {
        ctx.stop_timer(CoordinatorTimer::DiscoveryTimeout);

        let round = match self.round.take() {
            Some(r) => r,
            None => return,
        };
        let remote = round.merged_catalog(vec![]);

        debug!(
            "Discovery round {} complete, {} remote platoons, {} requests",
            round.request_id,
            remote.len(),
            self.discovery_queue.len()
        );

        while let Some(request) = self.discovery_queue.pop_front() {
            // Rebuilt for every request so that a platoon created for one is seen by the next
            let mut catalog = self.directory.catalog();
            catalog.extend(remote.iter().cloned());

            self.select_and_dispatch(ctx, request, &catalog);
        }
    }

    fn select_and_dispatch<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        request: DiscoveryRequest,
        catalog: &[PlatoonSummary],
    ) {
        let req = match request {
            DiscoveryRequest::Discover(req) => {
                info!(
                    "Sending {} platoons to vehicle {}",
                    catalog.len(),
                    req.vehicle_id
                );
                ctx.send(
                    &req.reply_to,
                    PlatoonMsg::DiscoverPlatoonsResponse(DiscoverResponse {
                        vehicle_id: req.vehicle_id,
                        platoons: catalog.to_vec(),
                    }),
                );
                return;
            }
            DiscoveryRequest::DiscoverAssociate(req) => req,
        };

        let index = self.selection.find_best_platoon(
            self.producer_id,
            &req.position,
            &req.direction,
            catalog,
        );

        match index {
            None => {
                let direction = req.direction;
                self.create_local(ctx, direction, AssociationRequest::Discovered(req));
            }
            Some(index) if index.producer_id == self.producer_id => {
                self.associate_local(ctx, index.controller_id, AssociationRequest::Discovered(req))
            }
            Some(index) => {
                self.associate_remote(ctx, index, catalog, AssociationRequest::Discovered(req))
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Association
    // --------------------------------------------------------------------------------------------

    fn handle_associate<C: CoordinatorContext>(&mut self, ctx: &mut C, req: AssociateRequest) {
        let controller_id = req.controller_id;
        self.associate_local(ctx, controller_id, AssociationRequest::Direct(req));
    }

    fn create_local<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        direction: Vec3,
        request: AssociationRequest,
    ) {
        let controller_id = self.directory.create(direction);

        info!(
            "Coordinator {} creating controller {} for vehicle {}, ready in {:.2} s",
            self.producer_id,
            controller_id,
            request.vehicle_id(),
            self.params.instantiation_delay_s
        );

        self.instantiation_queue
            .entry(controller_id)
            .or_default()
            .push(request);

        ctx.start_timer(
            CoordinatorTimer::Instantiation(controller_id),
            self.params.instantiation_delay_s,
        );
    }

    fn associate_local<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        controller_id: ControllerId,
        request: AssociationRequest,
    ) {
        let endpoint = match self.directory.get(controller_id) {
            Some(entry) => entry.endpoint.clone(),
            None => {
                warn!(
                    "Vehicle {} asked for unknown controller {}",
                    request.vehicle_id(),
                    controller_id
                );
                self.answer(ctx, request, None);
                return;
            }
        };

        match endpoint {
            Some(endpoint) => self.answer(ctx, request, Some((controller_id, endpoint))),
            None => {
                debug!(
                    "Vehicle {} waiting for controller {} to be instantiated",
                    request.vehicle_id(),
                    controller_id
                );
                self.instantiation_queue
                    .entry(controller_id)
                    .or_default()
                    .push(request);
            }
        }
    }

    fn associate_remote<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        index: PlatoonIndex,
        catalog: &[PlatoonSummary],
        request: AssociationRequest,
    ) {
        let summary = catalog
            .iter()
            .find(|p| p.producer_id == index.producer_id && p.controller_id == index.controller_id);

        let summary = match summary {
            Some(s) => s,
            None => {
                warn!(
                    "Controller {} of producer {} is not in the catalog",
                    index.controller_id, index.producer_id
                );
                self.answer(ctx, request, None);
                return;
            }
        };

        if let Some(ref endpoint) = summary.endpoint {
            self.answer(ctx, request, Some((index.controller_id, endpoint.clone())));
            return;
        }

        // The remote controller is still being instantiated, ask its owner to tell us when it is
        // ready unless a request is already out for it
        if !self.instantiation_queue.contains_key(&index.controller_id) {
            let peer = match self
                .params
                .peers
                .iter()
                .find(|p| p.producer_id == index.producer_id)
            {
                Some(p) => p.endpoint(),
                None => {
                    warn!("Producer {} is not a known peer", index.producer_id);
                    self.answer(ctx, request, None);
                    return;
                }
            };

            debug!(
                "Asking producer {} for the instantiation of controller {}",
                index.producer_id, index.controller_id
            );

            ctx.send(
                &peer,
                PlatoonMsg::InstantiationRequest(InstantiationRequest {
                    producer_id: self.producer_id,
                    controller_id: index.controller_id,
                    reply_to: ctx.local_endpoint(),
                }),
            );
        }

        self.instantiation_queue
            .entry(index.controller_id)
            .or_default()
            .push(request);
    }

    /// Send the association response, `outcome` is `None` on failure.
    fn answer<C: CoordinatorContext>(
        &self,
        ctx: &mut C,
        request: AssociationRequest,
        outcome: Option<(ControllerId, Endpoint)>,
    ) {
        let (controller_id, controller_endpoint) = match outcome {
            Some((id, ep)) => (Some(id), Some(ep)),
            None => (None, None),
        };

        let response = |vehicle_id| AssociationResponse {
            vehicle_id,
            success: controller_id.is_some(),
            producer_id: self.producer_id,
            controller_id,
            controller_endpoint: controller_endpoint.clone(),
        };

        match controller_id {
            Some(id) => info!("Vehicle {} associated with controller {}", request.vehicle_id(), id),
            None => info!("Association of vehicle {} failed", request.vehicle_id()),
        }

        match request {
            AssociationRequest::Discovered(req) => ctx.send(
                &req.reply_to,
                PlatoonMsg::DiscoverAndAssociateResponse(response(req.vehicle_id)),
            ),
            AssociationRequest::Direct(req) => ctx.send(
                &req.reply_to,
                PlatoonMsg::AssociatePlatoonResponse(response(req.vehicle_id)),
            ),
        }
    }

    /// Answer every request waiting on `controller_id`.
    fn release_waiting<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        controller_id: ControllerId,
        endpoint: Option<Endpoint>,
    ) {
        let waiting = self
            .instantiation_queue
            .remove(&controller_id)
            .unwrap_or_default();

        for request in waiting {
            let outcome = endpoint.clone().map(|ep| (controller_id, ep));
            self.answer(ctx, request, outcome);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Instantiation
    // --------------------------------------------------------------------------------------------

    fn complete_instantiation<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        controller_id: ControllerId,
    ) {
        let direction = match self.directory.get(controller_id) {
            Some(entry) => entry.direction,
            None => raise_error!(
                "Instantiation of controller {} completed but it is not in the directory",
                controller_id
            ),
        };

        let endpoint = match ctx.instantiate_controller(controller_id, self.producer_id, direction)
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Could not instantiate controller {}: {}", controller_id, e);
                self.directory.remove(controller_id);
                self.release_waiting(ctx, controller_id, None);
                self.answer_peers(ctx, controller_id, None);
                return;
            }
        };

        if let Some(entry) = self.directory.get_mut(controller_id) {
            entry.endpoint = Some(endpoint.clone());
        }

        info!("Controller {} instantiated at {}", controller_id, endpoint);

        let config = self.params.controller.to_config(
            controller_id,
            self.producer_id,
            ctx.local_endpoint(),
            direction,
        );
        ctx.send(&endpoint, PlatoonMsg::ConfigureController(config));

        self.release_waiting(ctx, controller_id, Some(endpoint.clone()));
        self.answer_peers(ctx, controller_id, Some(endpoint));
    }

    fn answer_peers<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        controller_id: ControllerId,
        endpoint: Option<Endpoint>,
    ) {
        let peers = self
            .waiting_peers
            .remove(&controller_id)
            .unwrap_or_default();

        for peer in peers {
            ctx.send(
                &peer,
                PlatoonMsg::InstantiationResponse(InstantiationResponse {
                    producer_id: self.producer_id,
                    controller_id,
                    success: endpoint.is_some(),
                    endpoint: endpoint.clone(),
                }),
            );
        }
    }

    fn handle_instantiation_request<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        req: InstantiationRequest,
    ) {
        let state = self
            .directory
            .get(req.controller_id)
            .map(|e| e.endpoint.clone());

        let endpoint = match state {
            // Being instantiated, answer on completion
            Some(None) => {
                let peers = self.waiting_peers.entry(req.controller_id).or_default();
                if !peers.contains(&req.reply_to) {
                    peers.push(req.reply_to);
                }
                return;
            }
            Some(Some(endpoint)) => Some(endpoint),
            None => {
                warn!(
                    "Producer {} asked for unknown controller {}",
                    req.producer_id, req.controller_id
                );
                None
            }
        };

        ctx.send(
            &req.reply_to,
            PlatoonMsg::InstantiationResponse(InstantiationResponse {
                producer_id: self.producer_id,
                controller_id: req.controller_id,
                success: endpoint.is_some(),
                endpoint,
            }),
        );
    }

    fn handle_instantiation_response<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        resp: InstantiationResponse,
    ) {
        if !self.instantiation_queue.contains_key(&resp.controller_id) {
            debug!(
                "Discarding stale instantiation response for controller {} from producer {}",
                resp.controller_id, resp.producer_id
            );
            return;
        }

        let endpoint = match resp.success {
            true => resp.endpoint,
            false => None,
        };

        self.release_waiting(ctx, resp.controller_id, endpoint);
    }

    // --------------------------------------------------------------------------------------------
    // Controller notifications
    // --------------------------------------------------------------------------------------------

    fn handle_controller_notification<C: CoordinatorContext>(
        &mut self,
        ctx: &mut C,
        notification: ControllerNotification,
    ) {
        let controller_id = notification.controller_id;

        match self.directory.get_mut(controller_id) {
            Some(entry) => entry.refresh(&notification),
            None => {
                warn!(
                    "Dropping {:?} notification from unknown controller {}",
                    notification.kind, controller_id
                );
                return;
            }
        }

        let member = notification.member.as_ref().map(|m| m.vehicle_id);

        match notification.kind {
            NotificationKind::NewMember => info!(
                "Controller {} has a new member {:?}, order {:?}",
                controller_id, member, notification.vehicles_order
            ),
            NotificationKind::RemovedMember => info!(
                "Controller {} removed member {:?}, order {:?}",
                controller_id, member, notification.vehicles_order
            ),
            NotificationKind::NewOrder => debug!(
                "Controller {} order {:?}",
                controller_id, notification.vehicles_order
            ),
            NotificationKind::Heartbeat => trace!(
                "Heartbeat from controller {} in {}",
                controller_id,
                notification.state
            ),
            NotificationKind::Stopped => {
                if ctx.terminate_controller(controller_id) {
                    self.directory.remove(controller_id);
                    info!("Controller {} stopped and terminated", controller_id);
                }
                else {
                    warn!(
                        "Controller {} stopped but its instance could not be terminated",
                        controller_id
                    );
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::mock::MockCtx;
    use comms_if::{
        msg::{JoinRequest, MemberRef},
        AppRef, ControllerState,
    };

    fn host() -> Endpoint {
        Endpoint::new("edge-a", 5000, AppRef::Coordinator)
    }

    fn peer(producer_id: ProducerId) -> PeerParams {
        PeerParams {
            producer_id,
            host: format!("edge-{}", producer_id),
            port: 5000,
        }
    }

    fn consumer(vehicle_id: VehicleId) -> Endpoint {
        host().with_app(AppRef::Consumer(vehicle_id))
    }

    fn setup(peers: Vec<PeerParams>) -> (ProducerCoordinator, MockCtx) {
        let params = CoordinatorParams {
            producer_id: 1,
            peers,
            ..Default::default()
        };
        (ProducerCoordinator::new(params), MockCtx::new(host()))
    }

    fn envelope(from: Endpoint, msg: PlatoonMsg) -> Envelope {
        Envelope {
            from,
            to: host(),
            msg,
        }
    }

    fn discover_associate(
        coord: &mut ProducerCoordinator,
        ctx: &mut MockCtx,
        vehicle_id: VehicleId,
        x: f64,
    ) {
        let msg = PlatoonMsg::DiscoverAndAssociate(DiscoverAssociateRequest {
            vehicle_id,
            reply_to: consumer(vehicle_id),
            position: Vec3::new(x, 0.0, 0.0),
            direction: Vec3::x(),
            speed_ms: 20.0,
        });
        coord.handle(ctx, envelope(consumer(vehicle_id), msg)).unwrap();
    }

    /// Fire the given timer at its deadline.
    fn fire(coord: &mut ProducerCoordinator, ctx: &mut MockCtx, timer: CoordinatorTimer) {
        let deadline = ctx.coordinator_timers.deadline(timer).unwrap();
        ctx.now_s = deadline;
        ctx.coordinator_timers.stop(timer);
        coord.handle_timer(ctx, timer);
    }

    fn associations(ctx: &MockCtx, vehicle_id: VehicleId) -> Vec<AssociationResponse> {
        ctx.sent_to(AppRef::Consumer(vehicle_id))
            .into_iter()
            .filter_map(|m| match m {
                PlatoonMsg::DiscoverAndAssociateResponse(r) => Some(r.clone()),
                PlatoonMsg::AssociatePlatoonResponse(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Bring up one live local controller and return its id.
    fn live_controller(coord: &mut ProducerCoordinator, ctx: &mut MockCtx) -> ControllerId {
        discover_associate(coord, ctx, 99, 0.0);
        let id = coord.directory().catalog()[0].controller_id;
        fire(coord, ctx, CoordinatorTimer::Instantiation(id));
        ctx.take_sent();
        id
    }

    fn notification(
        controller_id: ControllerId,
        kind: NotificationKind,
        member: Option<VehicleId>,
    ) -> ControllerNotification {
        ControllerNotification {
            controller_id,
            producer_id: 1,
            kind,
            member: member.map(|vehicle_id| MemberRef {
                vehicle_id,
                consumer: consumer(vehicle_id),
            }),
            state: ControllerState::Cruise,
            vehicles_order: member.into_iter().collect(),
            queued_joins: vec![],
            tail_position: Some(Vec3::new(5.0, 0.0, 0.0)),
            timestamp_s: 1.0,
        }
    }

    #[test]
    fn test_new_local_platoon() {
        let (mut coord, mut ctx) = setup(vec![]);

        discover_associate(&mut coord, &mut ctx, 7, 0.0);

        // Nothing answered until the factory completes
        assert!(ctx.sent.is_empty());
        assert_eq!(coord.waiting_on(2001), 1);
        let timer = CoordinatorTimer::Instantiation(2001);
        assert_eq!(ctx.coordinator_timers.deadline(timer), Some(0.5));

        fire(&mut coord, &mut ctx, timer);

        assert_eq!(ctx.instantiated, vec![(2001, 1)]);
        assert!(coord.directory().get(2001).unwrap().is_live());

        match ctx.sent_to(AppRef::Controller(2001)).as_slice() {
            [PlatoonMsg::ConfigureController(c)] => {
                assert_eq!(c.controller_id, 2001);
                assert_eq!(c.producer_endpoint, host());
                assert_eq!(c.direction, Vec3::x());
            }
            m => panic!("Expected a configuration, got {:?}", m),
        }

        let responses = associations(&ctx, 7);
        assert_eq!(responses.len(), 1);
        assert!(responses[0].success);
        assert_eq!(responses[0].controller_id, Some(2001));
        assert_eq!(
            responses[0].controller_endpoint,
            Some(host().with_app(AppRef::Controller(2001)))
        );
        assert_eq!(coord.waiting_on(2001), 0);
    }

    #[test]
    fn test_requests_share_instantiating_platoon() {
        let (mut coord, mut ctx) = setup(vec![]);

        discover_associate(&mut coord, &mut ctx, 7, 0.0);
        discover_associate(&mut coord, &mut ctx, 8, -20.0);

        assert_eq!(coord.directory().len(), 1);
        assert_eq!(coord.waiting_on(2001), 2);

        fire(&mut coord, &mut ctx, CoordinatorTimer::Instantiation(2001));

        for v in &[7, 8] {
            let responses = associations(&ctx, *v);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].controller_id, Some(2001));
        }

        // Once live, a new request is answered straight away
        ctx.take_sent();
        discover_associate(&mut coord, &mut ctx, 9, -40.0);
        assert_eq!(associations(&ctx, 9)[0].controller_id, Some(2001));
    }

    #[test]
    fn test_instantiation_failure() {
        let (mut coord, mut ctx) = setup(vec![]);
        ctx.fail_instantiation = true;

        discover_associate(&mut coord, &mut ctx, 7, 0.0);
        fire(&mut coord, &mut ctx, CoordinatorTimer::Instantiation(2001));

        let responses = associations(&ctx, 7);
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].success);
        assert_eq!(responses[0].controller_endpoint, None);
        assert!(coord.directory().is_empty());
    }

    #[test]
    fn test_discovery_partial_fallback() {
        let (mut coord, mut ctx) = setup(vec![peer(2), peer(3)]);

        let msg = PlatoonMsg::DiscoverPlatoons(DiscoverRequest {
            vehicle_id: 7,
            reply_to: consumer(7),
            position: Vec3::zeros(),
            direction: Vec3::x(),
        });
        coord.handle(&mut ctx, envelope(consumer(7), msg)).unwrap();

        let requests: Vec<_> = ctx
            .take_sent()
            .into_iter()
            .filter_map(|(to, m)| match m {
                PlatoonMsg::AvailablePlatoonsRequest(r) => Some((to, r)),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, peer(2).endpoint());
        let request_id = requests[0].1.request_id;
        assert_eq!(coord.current_round(), Some(request_id));
        assert!(ctx
            .coordinator_timers
            .is_pending(CoordinatorTimer::DiscoveryTimeout));

        let summary = PlatoonSummary {
            controller_id: 3001,
            producer_id: 2,
            direction: Vec3::x(),
            endpoint: Some(peer(2).endpoint().with_app(AppRef::Controller(3001))),
            vehicles: vec![4],
            queued_joins: 0,
            tail_position: Some(Vec3::new(30.0, 0.0, 0.0)),
        };
        let resp = |request_id| {
            PlatoonMsg::AvailablePlatoonsResponse(AvailablePlatoonsResponse {
                producer_id: 2,
                request_id,
                platoons: vec![summary.clone()],
            })
        };

        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), resp(request_id)))
            .unwrap();
        // A response to an older round changes nothing
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), resp(request_id - 1)))
            .unwrap();
        assert!(ctx.sent.is_empty());
        assert_eq!(coord.discovery_queue_len(), 1);

        // Producer 3 never answers
        fire(&mut coord, &mut ctx, CoordinatorTimer::DiscoveryTimeout);

        match ctx.sent_to(AppRef::Consumer(7)).as_slice() {
            [PlatoonMsg::DiscoverPlatoonsResponse(r)] => assert_eq!(r.platoons, vec![summary]),
            m => panic!("Expected a discovery response, got {:?}", m),
        }
        assert_eq!(coord.current_round(), None);
        assert_eq!(coord.discovery_queue_len(), 0);

        // A late answer is stale
        ctx.take_sent();
        let late = PlatoonMsg::AvailablePlatoonsResponse(AvailablePlatoonsResponse {
            producer_id: 3,
            request_id,
            platoons: vec![],
        });
        coord
            .handle(&mut ctx, envelope(peer(3).endpoint(), late))
            .unwrap();
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn test_remote_platoon_being_instantiated() {
        let (mut coord, mut ctx) = setup(vec![peer(2)]);

        discover_associate(&mut coord, &mut ctx, 7, 0.0);
        discover_associate(&mut coord, &mut ctx, 8, 0.0);
        let request_id = coord.current_round().unwrap();
        ctx.take_sent();

        let resp = PlatoonMsg::AvailablePlatoonsResponse(AvailablePlatoonsResponse {
            producer_id: 2,
            request_id,
            platoons: vec![PlatoonSummary {
                controller_id: 3001,
                producer_id: 2,
                direction: Vec3::x(),
                endpoint: None,
                vehicles: vec![],
                queued_joins: 1,
                tail_position: None,
            }],
        });
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), resp))
            .unwrap();

        // One notification request for both vehicles
        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (to, PlatoonMsg::InstantiationRequest(r)) => {
                assert_eq!(to, &peer(2).endpoint());
                assert_eq!(r.controller_id, 3001);
                assert_eq!(r.producer_id, 1);
            }
            m => panic!("Expected an instantiation request, got {:?}", m),
        }
        assert_eq!(coord.waiting_on(3001), 2);
        assert!(coord.directory().is_empty());

        let endpoint = peer(2).endpoint().with_app(AppRef::Controller(3001));
        let resp = PlatoonMsg::InstantiationResponse(InstantiationResponse {
            producer_id: 2,
            controller_id: 3001,
            success: true,
            endpoint: Some(endpoint.clone()),
        });
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), resp.clone()))
            .unwrap();

        for v in &[7, 8] {
            let responses = associations(&ctx, *v);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].controller_endpoint, Some(endpoint.clone()));
            assert_eq!(responses[0].producer_id, 1);
        }

        // Repeated response is stale
        ctx.take_sent();
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), resp))
            .unwrap();
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn test_peer_requests() {
        let (mut coord, mut ctx) = setup(vec![peer(2)]);

        // An empty remote catalog, a local controller is created
        discover_associate(&mut coord, &mut ctx, 7, 0.0);
        let request_id = coord.current_round().unwrap();
        let resp = PlatoonMsg::AvailablePlatoonsResponse(AvailablePlatoonsResponse {
            producer_id: 2,
            request_id,
            platoons: vec![],
        });
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), resp))
            .unwrap();
        ctx.take_sent();
        assert_eq!(coord.waiting_on(2001), 1);

        // Catalog
        let req = PlatoonMsg::AvailablePlatoonsRequest(AvailablePlatoonsRequest {
            producer_id: 2,
            request_id: 12,
            reply_to: peer(2).endpoint(),
        });
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), req))
            .unwrap();
        match ctx.take_sent().as_slice() {
            [(_, PlatoonMsg::AvailablePlatoonsResponse(r))] => {
                assert_eq!(r.request_id, 12);
                assert_eq!(r.producer_id, 1);
                assert_eq!(r.platoons.len(), 1);
                assert_eq!(r.platoons[0].endpoint, None);
            }
            m => panic!("Expected a catalog, got {:?}", m),
        }

        let inst = |controller_id| {
            PlatoonMsg::InstantiationRequest(InstantiationRequest {
                producer_id: 2,
                controller_id,
                reply_to: peer(2).endpoint(),
            })
        };
        let inst_responses = |ctx: &MockCtx| -> Vec<InstantiationResponse> {
            ctx.sent_to(AppRef::Coordinator)
                .into_iter()
                .filter_map(|m| match m {
                    PlatoonMsg::InstantiationResponse(r) => Some(r.clone()),
                    _ => None,
                })
                .collect()
        };

        // Unknown controller
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), inst(2042)))
            .unwrap();
        let r = inst_responses(&ctx);
        assert_eq!(r.len(), 1);
        assert!(!r[0].success);
        ctx.take_sent();

        // Being instantiated, answered once live
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), inst(2001)))
            .unwrap();
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), inst(2001)))
            .unwrap();
        assert!(ctx.sent.is_empty());

        fire(&mut coord, &mut ctx, CoordinatorTimer::Instantiation(2001));
        let r = inst_responses(&ctx);
        assert_eq!(r.len(), 1);
        assert!(r[0].success);
        assert_eq!(r[0].endpoint, Some(host().with_app(AppRef::Controller(2001))));
        ctx.take_sent();

        // Live
        coord
            .handle(&mut ctx, envelope(peer(2).endpoint(), inst(2001)))
            .unwrap();
        assert!(inst_responses(&ctx)[0].success);
    }

    #[test]
    fn test_associate_direct() {
        let (mut coord, mut ctx) = setup(vec![]);
        let id = live_controller(&mut coord, &mut ctx);

        let assoc = |controller_id| {
            PlatoonMsg::AssociatePlatoon(AssociateRequest {
                vehicle_id: 7,
                reply_to: consumer(7),
                controller_id,
            })
        };

        coord
            .handle(&mut ctx, envelope(consumer(7), assoc(id)))
            .unwrap();
        coord
            .handle(&mut ctx, envelope(consumer(7), assoc(id + 40)))
            .unwrap();

        let responses = associations(&ctx, 7);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].controller_id, Some(id));
        assert!(!responses[1].success);
        assert!(matches!(
            ctx.sent_to(AppRef::Consumer(7))[0],
            PlatoonMsg::AssociatePlatoonResponse(_)
        ));
    }

    #[test]
    fn test_controller_notifications() {
        let (mut coord, mut ctx) = setup(vec![]);
        let id = live_controller(&mut coord, &mut ctx);

        let notify = |coord: &mut ProducerCoordinator, ctx: &mut MockCtx, n| {
            let from = host().with_app(AppRef::Controller(id));
            coord
                .handle(ctx, envelope(from, PlatoonMsg::ControllerNotification(n)))
                .unwrap();
        };

        notify(
            &mut coord,
            &mut ctx,
            notification(id, NotificationKind::NewMember, Some(7)),
        );
        let entry = coord.directory().get(id).unwrap();
        assert_eq!(entry.vehicles, vec![7]);
        assert_eq!(entry.tail_position, Some(Vec3::new(5.0, 0.0, 0.0)));
        assert_eq!(entry.consumers.get(&7), Some(&consumer(7)));

        // Unknown controllers are ignored
        notify(
            &mut coord,
            &mut ctx,
            notification(id + 1, NotificationKind::Stopped, None),
        );
        assert!(ctx.terminated.is_empty());

        let mut reordered = notification(id, NotificationKind::NewOrder, None);
        reordered.vehicles_order = vec![8, 7];
        notify(&mut coord, &mut ctx, reordered);
        let entry = coord.directory().get(id).unwrap();
        assert_eq!(entry.vehicles, vec![8, 7]);
        assert_eq!(entry.consumers.get(&7), Some(&consumer(7)));

        notify(
            &mut coord,
            &mut ctx,
            notification(id, NotificationKind::RemovedMember, Some(7)),
        );
        assert!(coord.directory().get(id).unwrap().consumers.is_empty());

        notify(
            &mut coord,
            &mut ctx,
            notification(id, NotificationKind::Stopped, None),
        );
        assert_eq!(ctx.terminated, vec![id]);
        assert!(coord.directory().is_empty());
    }

    #[test]
    #[should_panic(expected = "it is not in the directory")]
    fn test_instantiation_of_unknown_controller_is_fatal() {
        let (mut coord, mut ctx) = setup(vec![]);

        coord.handle_timer(&mut ctx, CoordinatorTimer::Instantiation(4242));
    }

    #[test]
    fn test_unexpected_message() {
        let (mut coord, mut ctx) = setup(vec![]);

        let msg = PlatoonMsg::JoinRequest(JoinRequest {
            vehicle_id: 7,
            controller_id: 2001,
            producer_id: 1,
            reply_to: consumer(7),
            position: Vec3::zeros(),
            speed_ms: 0.0,
        });

        match coord.handle(&mut ctx, envelope(consumer(7), msg)) {
            Err(CoordinatorError::UnexpectedMessage(1, "JoinRequest")) => (),
            r => panic!("Expected an unexpected message error, got {:?}", r),
        }
    }
}
