//! # Edge host
//!
//! An [`EdgeHost`] runs, behind a single socket, the producer coordinator of the host, the
//! controllers it instantiated and the consumer agents of the vehicles attached to the host.
//!
//! The host owns the timers of every component and gives each handler a context built from its
//! own fields. Envelopes between applications of the same host are delivered in-process, in the
//! order they were sent, before [`EdgeHost::handle`] returns. Everything else is collected in the
//! outbox for the transport.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod params;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::{btree_map::Entry, BTreeMap, BTreeSet, VecDeque};

use comms_if::{
    msg::PositionRequest, AppRef, ControllerId, Endpoint, Envelope, PlatoonMsg, ProducerId, Vec3,
    VehicleId,
};
use log::{debug, info, trace, warn};

use crate::{
    consumer::{ConsumerAgent, ConsumerError},
    context::*,
    controller::{ControllerError, ControllerParams, PlatoonController},
    coordinator::{CoordinatorError, PeerParams, ProducerCoordinator},
    timer::TimerSet,
};

pub use params::HostParams;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Upper bound on the timer expiries processed by one call to [`EdgeHost::advance`]
const MAX_EXPIRIES_PER_ADVANCE: usize = 10_000;

// ------------------------------------------------------------------------------------------------
// MACROS
// ------------------------------------------------------------------------------------------------

/// Implement `Outbound` for a context holding a `mail: Mailer` field.
macro_rules! outbound_via_mailer {
    ($ctx:ident) => {
        impl<'a> Outbound for $ctx<'a> {
            fn now_s(&self) -> f64 {
                self.mail.now_s
            }

            fn local_endpoint(&self) -> Endpoint {
                self.mail.endpoint.clone()
            }

            fn send(&mut self, to: &Endpoint, msg: PlatoonMsg) {
                self.mail.send(to, msg)
            }
        }
    };
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct EdgeHost {
    params: HostParams,

    /// Endpoint of the coordinator, shares its socket with every application of the host
    endpoint: Endpoint,

    /// Location service of this host
    location: Endpoint,

    coordinator: ProducerCoordinator,
    coordinator_timers: TimerSet<CoordinatorTimer>,

    controllers: BTreeMap<ControllerId, HostedController>,

    consumers: BTreeMap<VehicleId, ConsumerAgent>,

    /// Remote sockets each controller has sent to
    controller_sockets: BTreeMap<ControllerId, BTreeSet<String>>,

    /// Controllers which released their connections since the last pump
    releasing: Vec<ControllerId>,

    /// Sockets no longer used by any controller, waiting for the transport to close them
    released_sockets: Vec<String>,

    /// Envelopes sent by the components and not yet routed
    queue: VecDeque<Envelope>,

    /// Envelopes for other hosts, vehicles and location services
    outbox: Vec<Envelope>,

    now_s: f64,
}

/// A controller instance and its timers.
struct HostedController {
    controller: PlatoonController,
    timers: TimerSet<ControllerTimer>,
}

/// Collects the envelopes sent by one component.
struct Mailer<'a> {
    now_s: f64,
    endpoint: Endpoint,
    queue: &'a mut VecDeque<Envelope>,
}

struct ControllerCtx<'a> {
    mail: Mailer<'a>,
    timers: &'a mut TimerSet<ControllerTimer>,
    controller_id: ControllerId,
    producer_id: ProducerId,
    coordinator: &'a Endpoint,
    location: &'a Endpoint,
    peers: &'a [PeerParams],
    released: bool,
}

struct CoordinatorCtx<'a> {
    mail: Mailer<'a>,
    timers: &'a mut TimerSet<CoordinatorTimer>,
    controllers: &'a mut BTreeMap<ControllerId, HostedController>,
    max_controllers: usize,
    controller_params: &'a ControllerParams,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Envelope addressed to {0} does not belong to this host")]
    NotLocal(Endpoint),

    #[error("No application can receive envelopes addressed to {0}")]
    NoSuchApp(Endpoint),

    #[error("No controller with id {0} runs on this host")]
    UnknownController(ControllerId),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

/// Owner of an expired timer.
#[derive(Debug, Clone, Copy)]
enum TimerOwner {
    Coordinator,
    Controller(ControllerId),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl EdgeHost {
    pub fn new(params: HostParams) -> Self {
        let endpoint = params.coordinator_endpoint();
        let location = params.location_endpoint();
        let coordinator = ProducerCoordinator::new(params.coordinator.clone());

        info!(
            "Edge host {} running producer {}",
            endpoint,
            coordinator.producer_id()
        );

        Self {
            params,
            endpoint,
            location,
            coordinator,
            coordinator_timers: TimerSet::new(),
            controllers: BTreeMap::new(),
            consumers: BTreeMap::new(),
            controller_sockets: BTreeMap::new(),
            releasing: Vec::new(),
            released_sockets: Vec::new(),
            queue: VecDeque::new(),
            outbox: Vec::new(),
            now_s: 0.0,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn params(&self) -> &HostParams {
        &self.params
    }

    pub fn now_s(&self) -> f64 {
        self.now_s
    }

    pub fn coordinator(&self) -> &ProducerCoordinator {
        &self.coordinator
    }

    pub fn controller(&self, controller_id: ControllerId) -> Option<&PlatoonController> {
        self.controllers.get(&controller_id).map(|h| &h.controller)
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn consumer(&self, vehicle_id: VehicleId) -> Option<&ConsumerAgent> {
        self.consumers.get(&vehicle_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Take the envelopes waiting for the transport.
    pub fn drain_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Take the addresses of the sockets the transport can close.
    ///
    /// A socket is released once every controller which sent to it has released its
    /// connections. Sockets of peer hosts stay open for the coordinator.
    pub fn drain_released_sockets(&mut self) -> Vec<String> {
        std::mem::take(&mut self.released_sockets)
    }

    /// Handle an envelope received from the transport.
    ///
    /// Local traffic resulting from the envelope is routed before returning. An error means the
    /// envelope itself was dropped, errors raised by the local traffic are logged.
    pub fn handle(&mut self, envelope: Envelope) -> Result<(), HostError> {
        if !envelope.to.same_socket(&self.endpoint) {
            return Err(HostError::NotLocal(envelope.to));
        }

        let result = self.deliver(envelope);
        self.pump();
        result
    }

    /// Move the host clock to `now_s`, firing every timer which expires up to then.
    ///
    /// Timers fire in deadline order, and the clock seen by a handler is the deadline of its
    /// timer.
    pub fn advance(&mut self, now_s: f64) {
        let mut fired = 0;

        while let Some((deadline_s, owner)) = self.next_expiry(now_s) {
            if fired >= MAX_EXPIRIES_PER_ADVANCE {
                warn!(
                    "More than {} timer expiries before {:.3} s, deferring the rest",
                    MAX_EXPIRIES_PER_ADVANCE, now_s
                );
                break;
            }
            fired += 1;

            self.now_s = self.now_s.max(deadline_s);

            match owner {
                TimerOwner::Coordinator => {
                    if let Some(timer) = self.coordinator_timers.pop_expired(self.now_s) {
                        trace!("Coordinator timer {:?} expired", timer);
                        let mut ctx = CoordinatorCtx {
                            mail: Mailer {
                                now_s: self.now_s,
                                endpoint: self.endpoint.clone(),
                                queue: &mut self.queue,
                            },
                            timers: &mut self.coordinator_timers,
                            controllers: &mut self.controllers,
                            max_controllers: self.params.max_controllers,
                            controller_params: &self.params.coordinator.controller,
                        };
                        self.coordinator.handle_timer(&mut ctx, timer);
                    }
                }
                TimerOwner::Controller(controller_id) => {
                    let hosted = match self.controllers.get_mut(&controller_id) {
                        Some(h) => h,
                        None => continue,
                    };

                    if let Some(timer) = hosted.timers.pop_expired(self.now_s) {
                        trace!("Controller {} timer {:?} expired", controller_id, timer);
                        let mut ctx = ControllerCtx {
                            mail: Mailer {
                                now_s: self.now_s,
                                endpoint: self.endpoint.with_app(AppRef::Controller(controller_id)),
                                queue: &mut self.queue,
                            },
                            timers: &mut hosted.timers,
                            controller_id,
                            producer_id: self.params.coordinator.producer_id,
                            coordinator: &self.endpoint,
                            location: &self.location,
                            peers: &self.params.coordinator.peers,
                            released: false,
                        };
                        hosted.controller.handle_timer(&mut ctx, timer);

                        if ctx.released {
                            self.releasing.push(controller_id);
                        }
                    }
                }
            }

            self.pump();
        }

        self.now_s = self.now_s.max(now_s);
    }

    /// The earliest timer expiring at or before `now_s`.
    fn next_expiry(&self, now_s: f64) -> Option<(f64, TimerOwner)> {
        let coordinator = self
            .coordinator_timers
            .next_deadline()
            .map(|d| (d, TimerOwner::Coordinator));

        let controllers = self.controllers.iter().filter_map(|(id, h)| {
            h.timers
                .next_deadline()
                .map(|d| (d, TimerOwner::Controller(*id)))
        });

        coordinator
            .into_iter()
            .chain(controllers)
            .filter(|(d, _)| *d <= now_s)
            .fold(None, |acc, next| match acc {
                Some((d, _)) if d <= next.0 => acc,
                _ => Some(next),
            })
    }

    /// Route the envelopes sent by the components until none are left.
    fn pump(&mut self) {
        while let Some(envelope) = self.queue.pop_front() {
            if envelope.to.same_socket(&self.endpoint) {
                let name = envelope.msg.name();
                if let Err(e) = self.deliver(envelope) {
                    warn!("Dropped local {} message: {}", name, e);
                }
            }
            else {
                if let AppRef::Controller(controller_id) = envelope.from.app {
                    self.controller_sockets
                        .entry(controller_id)
                        .or_default()
                        .insert(envelope.to.socket_addr());
                }
                self.outbox.push(envelope);
            }
        }

        self.release_sockets();
    }

    /// Queue for closing the sockets which only the releasing controllers were using.
    fn release_sockets(&mut self) {
        for controller_id in std::mem::take(&mut self.releasing) {
            info!("Controller {} released its connections", controller_id);

            let sockets = match self.controller_sockets.remove(&controller_id) {
                Some(s) => s,
                None => continue,
            };

            for socket in sockets {
                let peer = self
                    .params
                    .coordinator
                    .peers
                    .iter()
                    .any(|p| p.endpoint().socket_addr() == socket);
                let in_use = self.controller_sockets.values().any(|s| s.contains(&socket));

                if peer || in_use {
                    trace!("Socket {} is still in use", socket);
                }
                else {
                    debug!("Releasing socket {}", socket);
                    self.released_sockets.push(socket);
                }
            }
        }
    }

    /// Hand an envelope to the application it is addressed to.
    fn deliver(&mut self, envelope: Envelope) -> Result<(), HostError> {
        match envelope.to.app {
            AppRef::Coordinator => {
                let mut ctx = CoordinatorCtx {
                    mail: Mailer {
                        now_s: self.now_s,
                        endpoint: self.endpoint.clone(),
                        queue: &mut self.queue,
                    },
                    timers: &mut self.coordinator_timers,
                    controllers: &mut self.controllers,
                    max_controllers: self.params.max_controllers,
                    controller_params: &self.params.coordinator.controller,
                };
                self.coordinator.handle(&mut ctx, envelope)?;
            }
            AppRef::Controller(controller_id) => {
                let hosted = self
                    .controllers
                    .get_mut(&controller_id)
                    .ok_or(HostError::UnknownController(controller_id))?;

                let mut ctx = ControllerCtx {
                    mail: Mailer {
                        now_s: self.now_s,
                        endpoint: envelope.to.clone(),
                        queue: &mut self.queue,
                    },
                    timers: &mut hosted.timers,
                    controller_id,
                    producer_id: self.params.coordinator.producer_id,
                    coordinator: &self.endpoint,
                    location: &self.location,
                    peers: &self.params.coordinator.peers,
                    released: false,
                };
                let result = hosted.controller.handle(&mut ctx, envelope);

                if ctx.released {
                    self.releasing.push(controller_id);
                }
                result?;
            }
            AppRef::Consumer(vehicle_id) => {
                let producer_id = self.coordinator.producer_id();

                // Only the vehicle itself can bring up its agent
                let agent = match self.consumers.entry(vehicle_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) if ConsumerAgent::opens_session(&envelope.msg) => {
                        info!("New consumer agent for vehicle {}", vehicle_id);
                        entry.insert(ConsumerAgent::new(
                            vehicle_id,
                            producer_id,
                            self.endpoint.clone(),
                        ))
                    }
                    Entry::Vacant(_) => return Err(HostError::NoSuchApp(envelope.to)),
                };

                let mut mail = Mailer {
                    now_s: self.now_s,
                    endpoint: envelope.to.clone(),
                    queue: &mut self.queue,
                };
                agent.handle(&mut mail, envelope)?;

                if agent.has_left() {
                    self.consumers.remove(&vehicle_id);
                    info!("Vehicle {} left, consumer agent dropped", vehicle_id);
                }
            }
            // Position requests from the controllers of peer hosts go through this host to reach
            // its location service.
            AppRef::Location if !self.location.same_socket(&self.endpoint) => {
                debug!(
                    "Relaying {} from {} to the location service",
                    envelope.msg.name(),
                    envelope.from
                );
                self.outbox.push(Envelope {
                    from: envelope.from,
                    to: self.location.clone(),
                    msg: envelope.msg,
                });
            }
            AppRef::Location | AppRef::Vehicle(_) => {
                return Err(HostError::NoSuchApp(envelope.to))
            }
        }

        Ok(())
    }
}

impl<'a> Outbound for Mailer<'a> {
    fn now_s(&self) -> f64 {
        self.now_s
    }

    fn local_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn send(&mut self, to: &Endpoint, msg: PlatoonMsg) {
        self.queue.push_back(Envelope {
            from: self.endpoint.clone(),
            to: to.clone(),
            msg,
        });
    }
}

outbound_via_mailer!(ControllerCtx);
outbound_via_mailer!(CoordinatorCtx);

impl<'a> TimerControl<ControllerTimer> for ControllerCtx<'a> {
    fn start_timer(&mut self, timer: ControllerTimer, delay_s: f64) {
        self.timers.start(timer, self.mail.now_s + delay_s);
    }

    fn stop_timer(&mut self, timer: ControllerTimer) {
        self.timers.stop(timer);
    }
}

impl<'a> TimerControl<CoordinatorTimer> for CoordinatorCtx<'a> {
    fn start_timer(&mut self, timer: CoordinatorTimer, delay_s: f64) {
        self.timers.start(timer, self.mail.now_s + delay_s);
    }

    fn stop_timer(&mut self, timer: CoordinatorTimer) {
        self.timers.stop(timer);
    }
}

impl<'a> ControllerContext for ControllerCtx<'a> {
    fn request_positions(&mut self, producer_id: ProducerId, vehicles: Vec<VehicleId>) {
        let location = if producer_id == self.producer_id {
            self.location.clone()
        }
        else {
            match self.peers.iter().find(|p| p.producer_id == producer_id) {
                Some(peer) => peer.endpoint().with_app(AppRef::Location),
                None => {
                    warn!(
                        "Controller {} has no route to the location service of producer {}",
                        self.controller_id, producer_id
                    );
                    return;
                }
            }
        };

        let request = PositionRequest {
            controller_id: self.controller_id,
            producer_id,
            vehicles,
            reply_to: self.mail.endpoint.clone(),
        };
        self.mail.send(&location, PlatoonMsg::PositionRequest(request));
    }

    fn lookup_producer(&self, producer_id: ProducerId) -> Option<Endpoint> {
        if producer_id == self.producer_id {
            Some(self.coordinator.clone())
        }
        else {
            self.peers
                .iter()
                .find(|p| p.producer_id == producer_id)
                .map(|p| p.endpoint())
        }
    }

    fn release_connections(&mut self) {
        self.released = true;
    }
}

impl<'a> CoordinatorContext for CoordinatorCtx<'a> {
    fn instantiate_controller(
        &mut self,
        controller_id: ControllerId,
        producer_id: ProducerId,
        direction: Vec3,
    ) -> Result<Endpoint, InstantiationError> {
        if self.controllers.contains_key(&controller_id) {
            return Err(InstantiationError::AlreadyExists(controller_id));
        }
        if self.controllers.len() >= self.max_controllers {
            return Err(InstantiationError::NoCapacity(self.max_controllers));
        }

        self.controllers.insert(
            controller_id,
            HostedController {
                controller: PlatoonController::new(
                    controller_id,
                    producer_id,
                    direction,
                    self.controller_params.clone(),
                ),
                timers: TimerSet::new(),
            },
        );

        info!("Controller {} instantiated", controller_id);

        Ok(self.mail.endpoint.with_app(AppRef::Controller(controller_id)))
    }

    fn terminate_controller(&mut self, controller_id: ControllerId) -> bool {
        match self.controllers.remove(&controller_id) {
            Some(_) => {
                info!("Controller {} terminated", controller_id);
                true
            }
            None => false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
