//! Discovery rounds across the federation

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;

use comms_if::{msg::AvailablePlatoonsResponse, PlatoonSummary, ProducerId, RequestId};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The catalog a peer returned during the current round.
#[derive(Debug, Clone, PartialEq)]
pub struct FederationRecord {
    pub producer_id: ProducerId,
    pub platoons: Vec<PlatoonSummary>,
}

/// An in-flight discovery round.
#[derive(Debug)]
pub struct DiscoveryRound {
    pub request_id: RequestId,

    /// Number of peers the request was sent to
    expected: usize,

    records: BTreeMap<ProducerId, FederationRecord>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Outcome of recording a response in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundUpdate {
    /// The response belongs to another round or repeats one already received
    Stale,

    /// More responses are expected
    Pending,

    /// Every peer has answered
    Complete,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl DiscoveryRound {
    pub fn new(request_id: RequestId, expected: usize) -> Self {
        Self {
            request_id,
            expected,
            records: BTreeMap::new(),
        }
    }

    pub fn received(&self) -> usize {
        self.records.len()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn record(&mut self, response: AvailablePlatoonsResponse) -> RoundUpdate {
        if response.request_id != self.request_id
            || self.records.contains_key(&response.producer_id)
        {
            return RoundUpdate::Stale;
        }

        self.records.insert(
            response.producer_id,
            FederationRecord {
                producer_id: response.producer_id,
                platoons: response.platoons,
            },
        );

        if self.records.len() >= self.expected {
            RoundUpdate::Complete
        }
        else {
            RoundUpdate::Pending
        }
    }

    /// The local catalog followed by every catalog received in this round.
    pub fn merged_catalog(&self, local: Vec<PlatoonSummary>) -> Vec<PlatoonSummary> {
        let mut catalog = local;
        for record in self.records.values() {
            catalog.extend(record.platoons.iter().cloned());
        }
        catalog
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::Vec3;

    fn response(producer_id: ProducerId, request_id: RequestId) -> AvailablePlatoonsResponse {
        AvailablePlatoonsResponse {
            producer_id,
            request_id,
            platoons: vec![PlatoonSummary {
                controller_id: 1000 * (1 + producer_id) + 1,
                producer_id,
                direction: Vec3::x(),
                endpoint: None,
                vehicles: vec![],
                queued_joins: 0,
                tail_position: None,
            }],
        }
    }

    #[test]
    fn test_round() {
        let mut round = DiscoveryRound::new(4, 2);

        assert_eq!(round.record(response(2, 3)), RoundUpdate::Stale);
        assert_eq!(round.record(response(2, 4)), RoundUpdate::Pending);
        assert_eq!(round.record(response(2, 4)), RoundUpdate::Stale);
        assert_eq!(round.received(), 1);
        assert_eq!(round.record(response(3, 4)), RoundUpdate::Complete);

        let catalog = round.merged_catalog(vec![]);
        let ids: Vec<_> = catalog.iter().map(|p| p.controller_id).collect();
        assert_eq!(ids, vec![3001, 4001]);
    }
}
