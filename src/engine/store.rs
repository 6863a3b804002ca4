use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::ledger::SeatLedger;
use super::outbox::Outbox;
use super::{Indexes, Target, apply_to_resource, event_target};

/// Plain (unlocked) state rebuilt from the log before the engine goes live.
#[derive(Default)]
pub(super) struct Replayed {
    pub resources: HashMap<Ulid, ResourceState>,
    pub ledgers: HashMap<SeatKey, SeatLedger>,
}

impl Replayed {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::FacilityCreated { id, name, policy } => {
                self.resources
                    .insert(*id, ResourceState::facility(*id, name.clone(), *policy));
            }
            Event::ProgramCreated { id, name, capacity } => {
                self.resources
                    .insert(*id, ResourceState::program(*id, name.clone(), *capacity));
            }
            _ => match event_target(event) {
                Target::Resource(id) => {
                    if let Some(rs) = self.resources.get_mut(&id) {
                        apply_to_resource(rs, event);
                    }
                }
                Target::Ledger(key) => {
                    self.ledgers
                        .entry(key)
                        .or_insert_with(|| SeatLedger::new(key))
                        .apply(event);
                }
                Target::Global => {}
            },
        }
    }
}

pub(super) fn replay(events: &[Event], index: &Indexes, outbox: &Outbox) -> Replayed {
    let mut state = Replayed::default();
    for event in events {
        state.apply(event);
        index.record(event);
        outbox.record(event);
    }
    state
}

/// Events that recreate one resource's configuration and facility bookings.
pub(super) fn snapshot_resource(rs: &ResourceState, out: &mut Vec<Event>) {
    match &rs.kind {
        ResourceKind::Facility(f) => {
            out.push(Event::FacilityCreated {
                id: rs.id,
                name: rs.name.clone(),
                policy: f.policy,
            });
            for window in &f.windows {
                out.push(Event::WindowAdded {
                    resource_id: rs.id,
                    window: window.clone(),
                });
            }
            for closure in &f.closures {
                out.push(Event::ClosureAdded {
                    resource_id: rs.id,
                    closure: closure.clone(),
                });
            }
            for reservation in f.reservations.values() {
                out.push(Event::ReservationRestored {
                    reservation: reservation.clone(),
                    waitlist: None,
                });
            }
        }
        ResourceKind::Program(p) => {
            out.push(Event::ProgramCreated {
                id: rs.id,
                name: rs.name.clone(),
                capacity: p.capacity,
            });
            for occurrence in p.occurrences.values() {
                out.push(Event::OccurrenceAdded {
                    occurrence: occurrence.clone(),
                });
            }
        }
    }
    if !rs.active {
        out.push(Event::ResourceDeactivated { id: rs.id });
    }
}

/// Events that recreate a seat ledger, including its position high-water mark.
pub(super) fn snapshot_ledger(ledger: &SeatLedger, out: &mut Vec<Event>) {
    let mut reservations: Vec<&Reservation> = ledger.reservations.values().collect();
    reservations.sort_by_key(|r| r.id);
    for reservation in reservations {
        let waitlist = ledger
            .position_of(reservation.id)
            .and_then(|pos| ledger.waitlist.get(&pos))
            .cloned();
        out.push(Event::ReservationRestored {
            reservation: reservation.clone(),
            waitlist,
        });
    }
    out.push(Event::WaitlistWatermark {
        key: ledger.key,
        last_position: ledger.last_position,
    });
}
