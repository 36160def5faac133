//! Directory of the controllers owned by a coordinator

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;

use comms_if::{
    msg::{ControllerNotification, NotificationKind},
    ControllerId, Endpoint, PlatoonSummary, ProducerId, Vec3, VehicleId,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// What a coordinator knows about one of its controllers.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerEntry {
    pub controller_id: ControllerId,
    pub direction: Vec3,

    /// `None` while the controller is being instantiated
    pub endpoint: Option<Endpoint>,

    /// Members, leader first, as of the last notification
    pub vehicles: Vec<VehicleId>,
    pub queued_joins: usize,
    pub tail_position: Option<Vec3>,
    pub last_heartbeat_s: Option<f64>,

    /// Consumers of the members of the platoon
    pub consumers: BTreeMap<VehicleId, Endpoint>,
}

/// The controllers of a coordinator, keyed by id.
#[derive(Debug)]
pub struct Directory {
    producer_id: ProducerId,
    entries: BTreeMap<ControllerId, ControllerEntry>,
    next_index: u32,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ControllerEntry {
    pub fn is_live(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Apply the content of a notification from the controller.
    pub fn refresh(&mut self, notification: &ControllerNotification) {
        self.vehicles = notification.vehicles_order.clone();
        self.queued_joins = notification.queued_joins.len();
        self.tail_position = notification.tail_position;
        self.last_heartbeat_s = Some(notification.timestamp_s);

        if let Some(ref member) = notification.member {
            match notification.kind {
                NotificationKind::NewMember => {
                    self.consumers
                        .insert(member.vehicle_id, member.consumer.clone());
                }
                NotificationKind::RemovedMember => {
                    self.consumers.remove(&member.vehicle_id);
                }
                _ => (),
            }
        }
    }

    pub fn summary(&self, producer_id: ProducerId) -> PlatoonSummary {
        PlatoonSummary {
            controller_id: self.controller_id,
            producer_id,
            direction: self.direction,
            endpoint: self.endpoint.clone(),
            vehicles: self.vehicles.clone(),
            queued_joins: self.queued_joins,
            tail_position: self.tail_position,
        }
    }
}

impl Directory {
    pub fn new(producer_id: ProducerId) -> Self {
        Self {
            producer_id,
            entries: BTreeMap::new(),
            next_index: 1,
        }
    }

    /// Create the descriptor of a new, not yet instantiated, controller.
    ///
    /// Ids are `1000 * (1 + producer_id) + n`, so that ids from different coordinators of a
    /// federation never collide.
    pub fn create(&mut self, direction: Vec3) -> ControllerId {
        let controller_id = 1000 * (1 + self.producer_id) + self.next_index;
        self.next_index += 1;

        self.entries.insert(
            controller_id,
            ControllerEntry {
                controller_id,
                direction,
                endpoint: None,
                vehicles: vec![],
                queued_joins: 0,
                tail_position: None,
                last_heartbeat_s: None,
                consumers: BTreeMap::new(),
            },
        );

        controller_id
    }

    pub fn get(&self, controller_id: ControllerId) -> Option<&ControllerEntry> {
        self.entries.get(&controller_id)
    }

    pub fn get_mut(&mut self, controller_id: ControllerId) -> Option<&mut ControllerEntry> {
        self.entries.get_mut(&controller_id)
    }

    pub fn remove(&mut self, controller_id: ControllerId) -> Option<ControllerEntry> {
        self.entries.remove(&controller_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The local catalog, as sent to peers and used for selection.
    pub fn catalog(&self) -> Vec<PlatoonSummary> {
        self.entries
            .values()
            .map(|e| e.summary(self.producer_id))
            .collect()
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
