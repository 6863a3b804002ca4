use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Confirmed seats and the waitlist for one program occurrence.
///
/// Positions come from a high-water mark and are never handed out twice,
/// even after the entry holding them is promoted or cancelled.
#[derive(Debug, Clone)]
pub struct SeatLedger {
    pub key: SeatKey,
    pub reservations: HashMap<Ulid, Reservation>,
    pub waitlist: BTreeMap<u32, WaitlistEntry>,
    pub last_position: u32,
}

impl SeatLedger {
    pub fn new(key: SeatKey) -> Self {
        Self {
            key,
            reservations: HashMap::new(),
            waitlist: BTreeMap::new(),
            last_position: 0,
        }
    }

    pub fn confirmed_count(&self) -> u32 {
        self.reservations
            .values()
            .filter(|r| r.status == Status::Confirmed)
            .count() as u32
    }

    /// The participant's live (confirmed or waitlisted) reservation, if any.
    pub fn active_for(&self, participant: &str) -> Option<&Reservation> {
        self.reservations
            .values()
            .find(|r| r.participant == participant && r.status != Status::Cancelled)
    }

    pub fn next_position(&self) -> u32 {
        self.last_position + 1
    }

    pub fn position_of(&self, reservation_id: Ulid) -> Option<u32> {
        self.waitlist
            .values()
            .find(|w| w.reservation_id == reservation_id)
            .map(|w| w.position)
    }

    /// Lowest position still waiting.
    pub fn head(&self) -> Option<&WaitlistEntry> {
        self.waitlist.first_key_value().map(|(_, w)| w)
    }

    pub fn waitlisted(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.waitlist.values()
    }

    fn remove_from_waitlist(&mut self, reservation_id: Ulid) {
        if let Some(pos) = self.position_of(reservation_id) {
            self.waitlist.remove(&pos);
        }
    }

    /// Apply a reservation event to this ledger. Caller holds the ledger lock.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ReservationCreated {
                reservation,
                waitlist,
                ..
            }
            | Event::ReservationRestored {
                reservation,
                waitlist,
            } => {
                if let Some(entry) = waitlist {
                    self.last_position = self.last_position.max(entry.position);
                    self.waitlist.insert(entry.position, entry.clone());
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationCancelled {
                id,
                at,
                by,
                promotion,
                ..
            } => {
                self.remove_from_waitlist(*id);
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = Status::Cancelled;
                    r.cancellation = Some(Cancellation {
                        at: *at,
                        by: by.clone(),
                    });
                }
                if let Some(p) = promotion {
                    self.remove_from_waitlist(p.reservation_id);
                    if let Some(r) = self.reservations.get_mut(&p.reservation_id) {
                        r.status = Status::Confirmed;
                    }
                }
            }
            Event::WaitlistWatermark { last_position, .. } => {
                self.last_position = self.last_position.max(*last_position);
            }
            _ => {}
        }
    }
}

/// Seats available for the occurrence: its override, else the program default.
pub fn effective_capacity(program: &Program, occurrence_id: Option<Ulid>) -> Result<u32, EngineError> {
    match occurrence_id {
        None => Ok(program.capacity),
        Some(id) => program
            .occurrences
            .get(&id)
            .map(|o| o.capacity.unwrap_or(program.capacity))
            .ok_or(EngineError::NotFound(id)),
    }
}
