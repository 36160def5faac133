//! Edge host parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{net::NetParams, AppRef, Endpoint};
use serde::Deserialize;

use crate::coordinator::CoordinatorParams;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone)]
pub struct HostParams {
    /// Name under which the other hosts and the vehicles reach this host
    pub host: String,

    /// Port of the inbound socket
    pub port: u16,

    pub net: NetParams,

    /// Host of the location service serving the vehicles attached to this host
    pub location_host: String,
    pub location_port: u16,

    /// Period of the main loop
    pub cycle_period_s: f64,

    /// Maximum number of controllers the instance factory may run at once
    pub max_controllers: usize,

    pub coordinator: CoordinatorParams,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl HostParams {
    /// Endpoint of the coordinator of this host.
    pub fn coordinator_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port, AppRef::Coordinator)
    }

    pub fn location_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.location_host, self.location_port, AppRef::Location)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
