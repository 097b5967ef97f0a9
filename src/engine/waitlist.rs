use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Head slots retired before the arena is shifted down.
const COMPACT_MIN_HEAD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEntry {
    pub seq: u64,
    pub student_id: Ulid,
    pub record_id: Ulid,
}

/// FIFO waitlist for one section.
///
/// Entries live in an arena indexed by intake sequence number (`seq - base`);
/// departed entries leave a hole. A Fenwick tree over slot liveness turns
/// "how many live entries precede me" into an O(log n) prefix sum, so
/// positions stay dense 1..N without shifting anything on removal.
#[derive(Debug, Clone)]
pub struct Waitlist {
    slots: Vec<Option<WaitEntry>>,
    /// 1-indexed; `tree[0]` is unused.
    tree: Vec<u32>,
    base: u64,
    /// First slot that may still be live.
    head: usize,
    next_seq: u64,
    by_student: HashMap<Ulid, u64>,
    len: usize,
}

impl Default for Waitlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Waitlist {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            tree: vec![0],
            base: 0,
            head: 0,
            next_seq: 0,
            by_student: HashMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sequence number the next intake will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn contains(&self, student_id: &Ulid) -> bool {
        self.by_student.contains_key(student_id)
    }

    /// Append at the tail with the next sequence number. Returns the entry's
    /// 1-based position, or `None` if the student is already queued.
    pub fn enqueue(&mut self, student_id: Ulid, record_id: Ulid) -> Option<usize> {
        let entry = WaitEntry {
            seq: self.next_seq,
            student_id,
            record_id,
        };
        self.insert(entry).ok()?;
        self.position_of(&student_id)
    }

    /// Insert with an explicit sequence number, which must not go backwards.
    /// Skipped sequence numbers become holes.
    pub fn insert(&mut self, entry: WaitEntry) -> Result<(), String> {
        if entry.seq < self.next_seq {
            return Err(format!(
                "waitlist seq {} behind next seq {}",
                entry.seq, self.next_seq
            ));
        }
        if self.by_student.contains_key(&entry.student_id) {
            return Err(format!("student {} already queued", entry.student_id));
        }
        if self.slots.is_empty() {
            self.base = entry.seq;
            self.head = 0;
        }
        while self.base + (self.slots.len() as u64) < entry.seq {
            self.push_slot(None);
        }
        self.by_student.insert(entry.student_id, entry.seq);
        self.push_slot(Some(entry));
        self.next_seq = entry.seq + 1;
        self.len += 1;
        Ok(())
    }

    /// 1-based position of a queued student.
    pub fn position_of(&self, student_id: &Ulid) -> Option<usize> {
        let seq = *self.by_student.get(student_id)?;
        let slot = (seq - self.base) as usize;
        Some(self.prefix(slot + 1) as usize)
    }

    pub fn peek_head(&self) -> Option<&WaitEntry> {
        self.slots.get(self.head).and_then(Option::as_ref)
    }

    pub fn dequeue_head(&mut self) -> Option<WaitEntry> {
        let entry = *self.peek_head()?;
        self.take_slot(self.head);
        Some(entry)
    }

    /// Withdraw a student from anywhere in the queue.
    pub fn remove(&mut self, student_id: &Ulid) -> Option<WaitEntry> {
        let seq = *self.by_student.get(student_id)?;
        self.take_slot((seq - self.base) as usize)
    }

    /// Live entries in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &WaitEntry> {
        self.slots[self.head.min(self.slots.len())..]
            .iter()
            .flatten()
    }

    /// Drop every entry. Sequence numbering continues where it was.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.tree = vec![0];
        self.base = self.next_seq;
        self.head = 0;
        self.by_student.clear();
        self.len = 0;
    }

    pub fn restore(entries: Vec<WaitEntry>, next_seq: u64) -> Result<Self, String> {
        let mut waitlist = Self::new();
        for entry in entries {
            waitlist.insert(entry)?;
        }
        if next_seq < waitlist.next_seq {
            return Err(format!(
                "snapshot next seq {next_seq} behind queued seq {}",
                waitlist.next_seq
            ));
        }
        waitlist.next_seq = next_seq;
        if waitlist.slots.is_empty() {
            waitlist.base = next_seq;
        }
        Ok(waitlist)
    }

    fn take_slot(&mut self, slot: usize) -> Option<WaitEntry> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.by_student.remove(&entry.student_id);
        self.sub(slot + 1);
        self.len -= 1;
        while self.head < self.slots.len() && self.slots[self.head].is_none() {
            self.head += 1;
        }
        self.maybe_compact();
        Some(entry)
    }

    fn maybe_compact(&mut self) {
        if self.len == 0 {
            self.slots.clear();
            self.tree = vec![0];
            self.base = self.next_seq;
            self.head = 0;
            return;
        }
        if self.head < COMPACT_MIN_HEAD || self.head * 2 <= self.slots.len() {
            return;
        }
        let retired = self.head;
        let kept: Vec<Option<WaitEntry>> = self.slots.drain(retired..).collect();
        self.slots.clear();
        self.tree = vec![0];
        self.base += retired as u64;
        self.head = 0;
        for slot in kept {
            self.push_slot(slot);
        }
    }

    /// Append a slot and extend the Fenwick tree. Node `n` covers
    /// `(n - lowbit(n), n]`, which only involves earlier slots.
    fn push_slot(&mut self, slot: Option<WaitEntry>) {
        let n = self.tree.len();
        let live = u32::from(slot.is_some());
        let covered_from = n - lowbit(n);
        let value = live + self.prefix(n - 1) - self.prefix(covered_from);
        self.tree.push(value);
        self.slots.push(slot);
    }

    fn prefix(&self, mut i: usize) -> u32 {
        let mut sum = 0;
        while i > 0 {
            sum += self.tree[i];
            i -= lowbit(i);
        }
        sum
    }

    fn sub(&mut self, mut i: usize) {
        while i < self.tree.len() {
            self.tree[i] -= 1;
            i += lowbit(i);
        }
    }
}

fn lowbit(i: usize) -> usize {
    i & i.wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn students(n: usize) -> Vec<Ulid> {
        (0..n).map(|_| Ulid::new()).collect()
    }

    fn assert_dense(w: &Waitlist) {
        for (i, entry) in w.iter().enumerate() {
            assert_eq!(w.position_of(&entry.student_id), Some(i + 1));
        }
        assert_eq!(w.iter().count(), w.len());
    }

    #[test]
    fn fifo_positions() {
        let mut w = Waitlist::new();
        let s = students(3);
        assert_eq!(w.enqueue(s[0], Ulid::new()), Some(1));
        assert_eq!(w.enqueue(s[1], Ulid::new()), Some(2));
        assert_eq!(w.enqueue(s[2], Ulid::new()), Some(3));
        assert_eq!(w.dequeue_head().unwrap().student_id, s[0]);
        assert_eq!(w.position_of(&s[1]), Some(1));
        assert_eq!(w.position_of(&s[2]), Some(2));
        assert_eq!(w.position_of(&s[0]), None);
    }

    #[test]
    fn duplicate_enqueue_refused() {
        let mut w = Waitlist::new();
        let s = Ulid::new();
        assert_eq!(w.enqueue(s, Ulid::new()), Some(1));
        assert_eq!(w.enqueue(s, Ulid::new()), None);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn remove_from_middle_keeps_positions_dense() {
        let mut w = Waitlist::new();
        let s = students(5);
        for id in &s {
            w.enqueue(*id, Ulid::new());
        }
        assert!(w.remove(&s[2]).is_some());
        assert!(w.remove(&s[2]).is_none());
        assert_eq!(w.position_of(&s[3]), Some(3));
        assert_eq!(w.position_of(&s[4]), Some(4));
        assert_dense(&w);

        // Removing the head advances past the hole left by s[2].
        w.remove(&s[0]);
        w.remove(&s[1]);
        assert_eq!(w.peek_head().unwrap().student_id, s[3]);
        assert_dense(&w);
    }

    #[test]
    fn sequence_numbers_survive_clear() {
        let mut w = Waitlist::new();
        w.enqueue(Ulid::new(), Ulid::new());
        w.enqueue(Ulid::new(), Ulid::new());
        w.clear();
        assert!(w.is_empty());
        assert_eq!(w.next_seq(), 2);
        let s = Ulid::new();
        assert_eq!(w.enqueue(s, Ulid::new()), Some(1));
        assert_eq!(w.peek_head().unwrap().seq, 2);
    }

    #[test]
    fn insert_rejects_old_seq_and_fills_gaps() {
        let mut w = Waitlist::new();
        let s = students(3);
        w.insert(WaitEntry { seq: 5, student_id: s[0], record_id: Ulid::new() }).unwrap();
        w.insert(WaitEntry { seq: 9, student_id: s[1], record_id: Ulid::new() }).unwrap();
        assert!(w.insert(WaitEntry { seq: 7, student_id: s[2], record_id: Ulid::new() }).is_err());
        assert_eq!(w.position_of(&s[1]), Some(2));
        assert_eq!(w.next_seq(), 10);
        assert_dense(&w);
    }

    #[test]
    fn long_churn_compacts_arena() {
        let mut w = Waitlist::new();
        let mut queued = std::collections::VecDeque::new();
        for round in 0..1000 {
            let s = Ulid::new();
            w.enqueue(s, Ulid::new());
            queued.push_back(s);
            if round % 3 != 0 {
                let head = w.dequeue_head().unwrap();
                assert_eq!(Some(head.student_id), queued.pop_front());
            }
        }
        assert_eq!(w.len(), queued.len());
        assert!(w.slots.len() < 1000, "arena never compacted: {}", w.slots.len());
        assert_dense(&w);
        let order: Vec<Ulid> = w.iter().map(|e| e.student_id).collect();
        assert_eq!(order, queued.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn restore_round_trip() {
        let mut w = Waitlist::new();
        let s = students(4);
        for id in &s {
            w.enqueue(*id, Ulid::new());
        }
        w.remove(&s[1]);
        let entries: Vec<WaitEntry> = w.iter().copied().collect();
        let restored = Waitlist::restore(entries, w.next_seq()).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.position_of(&s[3]), Some(3));
        assert_eq!(restored.next_seq(), 4);
        assert!(Waitlist::restore(w.iter().copied().collect(), 1).is_err());
    }
}
