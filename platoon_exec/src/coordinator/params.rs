//! Producer coordinator parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{AppRef, Endpoint, ProducerId};
use serde::Deserialize;

use crate::{controller::ControllerParams, selection::SelectionParams};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CoordinatorParams {
    pub producer_id: ProducerId,

    /// Time taken by the instance factory to bring up a new controller
    pub instantiation_delay_s: f64,

    /// Time after which a discovery round is resolved with the responses received so far
    pub discovery_timeout_s: f64,

    /// The other coordinators of the federation
    pub peers: Vec<PeerParams>,

    pub selection: SelectionParams,

    /// Defaults sent to new controllers
    pub controller: ControllerParams,
}

/// A federation peer.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PeerParams {
    pub producer_id: ProducerId,
    pub host: String,
    pub port: u16,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PeerParams {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port, AppRef::Coordinator)
    }
}

impl Default for CoordinatorParams {
    fn default() -> Self {
        Self {
            producer_id: 1,
            instantiation_delay_s: 0.5,
            discovery_timeout_s: 0.2,
            peers: vec![],
            selection: SelectionParams::default(),
            controller: ControllerParams::default(),
        }
    }
}
