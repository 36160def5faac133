//! # Component contexts
//!
//! The components of the library never talk to the transport, the clock, the location service or
//! the instance factory directly. Instead each handler is given a context implementing the narrow
//! capability traits in this module. The [`EdgeHost`](crate::host::EdgeHost) provides the real
//! implementations, tests provide recording ones.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{ControllerId, Endpoint, PlatoonMsg, ProducerId, Vec3, VehicleId};

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Timers owned by a platoon controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerTimer {
    /// Control cycle (longitudinal in Cruise, lateral in Maneuver)
    Control,

    /// Position update cycle
    PositionUpdate,

    Heartbeat,
}

/// Timers owned by a producer coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoordinatorTimer {
    /// Completion of the asynchronous instantiation of a controller
    Instantiation(ControllerId),

    /// Timeout of the in-flight discovery round
    DiscoveryTimeout,
}

/// Errors reported by the instance factory.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InstantiationError {
    #[error("A controller with id {0} already exists")]
    AlreadyExists(ControllerId),

    #[error("The host has no capacity for another controller (limit {0})")]
    NoCapacity(usize),
}

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Clock and message sending, available to every component.
pub trait Outbound {
    /// Current time in seconds.
    fn now_s(&self) -> f64;

    /// Endpoint of the component this context belongs to.
    fn local_endpoint(&self) -> Endpoint;

    /// Send a message. Delivery is handled by the transport and is assumed reliable.
    fn send(&mut self, to: &Endpoint, msg: PlatoonMsg);
}

/// Timer control, with at most one pending timer per purpose.
pub trait TimerControl<T> {
    /// Start `timer` to expire after `delay_s`, replacing any pending instance.
    fn start_timer(&mut self, timer: T, delay_s: f64);

    fn stop_timer(&mut self, timer: T);
}

/// Capabilities available to a platoon controller.
pub trait ControllerContext: Outbound + TimerControl<ControllerTimer> {
    /// Ask the location service of `producer_id` for fresh samples of `vehicles`. The samples
    /// arrive later as a `PositionUpdate`.
    fn request_positions(&mut self, producer_id: ProducerId, vehicles: Vec<VehicleId>);

    /// Look up the endpoint of a coordinator.
    fn lookup_producer(&self, producer_id: ProducerId) -> Option<Endpoint>;

    /// Tear down outbound connections, called once the platoon has no members left.
    ///
    /// Connections shared with other applications of the host are kept open.
    fn release_connections(&mut self);
}

/// Capabilities available to a producer coordinator.
pub trait CoordinatorContext: Outbound + TimerControl<CoordinatorTimer> {
    /// Instantiate a new controller, returning its endpoint.
    fn instantiate_controller(
        &mut self,
        controller_id: ControllerId,
        producer_id: ProducerId,
        direction: Vec3,
    ) -> Result<Endpoint, InstantiationError>;

    /// Terminate a controller instance. Returns `false` if there was no such instance.
    fn terminate_controller(&mut self, controller_id: ControllerId) -> bool;
}

// ------------------------------------------------------------------------------------------------
// MOCKS
// ------------------------------------------------------------------------------------------------
