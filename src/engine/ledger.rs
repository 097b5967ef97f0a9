/// Result of asking the ledger for a seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Occupied,
    Full,
}

/// Authoritative occupied/capacity counter for one section.
///
/// Callers hold the section's write lock, which is what makes `try_occupy`
/// atomic. `occupied > capacity` only arises after an administrative
/// capacity decrease; no new seat is handed out until occupancy drops back
/// under the new capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatLedger {
    capacity: u32,
    occupied: u32,
}

impl SeatLedger {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            occupied: 0,
        }
    }

    pub fn restore(capacity: u32, occupied: u32) -> Self {
        Self { capacity, occupied }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn occupied(&self) -> u32 {
        self.occupied
    }

    pub fn has_free_seat(&self) -> bool {
        self.occupied < self.capacity
    }

    pub fn free_seats(&self) -> u32 {
        self.capacity.saturating_sub(self.occupied)
    }

    pub fn try_occupy(&mut self) -> Occupancy {
        if self.has_free_seat() {
            self.occupied += 1;
            Occupancy::Occupied
        } else {
            Occupancy::Full
        }
    }

    /// Give back one seat, returning the occupancy before the release.
    /// `None` means nothing was occupied, which callers treat as an
    /// invariant violation.
    pub fn release(&mut self) -> Option<u32> {
        let prev = self.occupied;
        self.occupied = prev.checked_sub(1)?;
        Some(prev)
    }

    pub fn revise(&mut self, capacity: u32) {
        self.capacity = capacity;
    }

    /// Empty every seat (section cancellation). Returns how many were held.
    pub fn vacate_all(&mut self) -> u32 {
        std::mem::take(&mut self.occupied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupy_until_full() {
        let mut ledger = SeatLedger::new(2);
        assert_eq!(ledger.try_occupy(), Occupancy::Occupied);
        assert_eq!(ledger.try_occupy(), Occupancy::Occupied);
        assert_eq!(ledger.try_occupy(), Occupancy::Full);
        assert_eq!(ledger.occupied(), 2);
        assert!(!ledger.has_free_seat());
    }

    #[test]
    fn release_reports_previous() {
        let mut ledger = SeatLedger::new(3);
        ledger.try_occupy();
        ledger.try_occupy();
        assert_eq!(ledger.release(), Some(2));
        assert_eq!(ledger.release(), Some(1));
        assert_eq!(ledger.release(), None);
        assert_eq!(ledger.occupied(), 0);
    }

    #[test]
    fn decrease_below_occupancy_blocks_intake() {
        let mut ledger = SeatLedger::new(3);
        for _ in 0..3 {
            ledger.try_occupy();
        }
        ledger.revise(1);
        assert_eq!(ledger.occupied(), 3);
        assert_eq!(ledger.free_seats(), 0);
        ledger.release();
        assert_eq!(ledger.try_occupy(), Occupancy::Full);
        ledger.release();
        ledger.release();
        assert_eq!(ledger.try_occupy(), Occupancy::Occupied);
    }

    #[test]
    fn vacate_all_empties() {
        let mut ledger = SeatLedger::new(5);
        ledger.try_occupy();
        ledger.try_occupy();
        assert_eq!(ledger.vacate_all(), 2);
        assert_eq!(ledger.occupied(), 0);
        assert_eq!(ledger.free_seats(), 5);
    }
}
