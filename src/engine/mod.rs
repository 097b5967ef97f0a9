mod catalog;
mod compact;
mod coordinator;
mod eligibility;
mod error;
mod ledger;
mod queries;
mod students;
mod waitlist;

pub use catalog::SectionSpec;
pub use eligibility::{check, CheckMode, Commitment, Eligibility, SectionView, StudentSnapshot};
pub use error::EngineError;
pub use ledger::{Occupancy, SeatLedger};
pub use students::StudentDirectory;
pub use waitlist::{WaitEntry, Waitlist};

use std::collections::BTreeSet;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{error, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedSectionState = Arc<RwLock<SectionState>>;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One committed transaction.
    Append {
        batch: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { batch, response } => {
                let mut pending = vec![(batch, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { batch, response }) => pending.push((batch, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush what we have
                    }
                }

                flush_and_respond(&mut wal, &mut pending);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, pending: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_pending(wal, pending);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!(error = %e, transactions = pending.len(), "WAL flush failed");
    }
    for (_, tx) in pending.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_pending(wal: &mut Wal, pending: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (batch, _) in pending {
        if let Err(e) = wal.append_buffered(batch) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { batch, response } => {
            let mut pending = vec![(batch, response)];
            flush_and_respond(wal, &mut pending);
        }
    }
}

pub struct Engine {
    pub sections: DashMap<Ulid, SharedSectionState>,
    /// term id → sections published in it.
    pub(super) terms: DashMap<String, BTreeSet<Ulid>>,
    pub students: StudentDirectory,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Held shared by every mutation, exclusively by compaction.
    pub(super) gate: RwLock<()>,
    /// Serializes catalog and directory writes.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) lock_timeout: Duration,
}

/// Exclusive access to one section for the length of a transaction.
/// Events are applied as they are staged and hit the WAL on `commit`.
pub(super) struct SectionTxn<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    guard: OwnedRwLockWriteGuard<SectionState>,
    batch: Vec<Event>,
}

impl Deref for SectionTxn<'_> {
    type Target = SectionState;

    fn deref(&self) -> &SectionState {
        &self.guard
    }
}

impl DerefMut for SectionTxn<'_> {
    fn deref_mut(&mut self) -> &mut SectionState {
        &mut self.guard
    }
}

/// Apply a section-scoped event. The caller holds the section lock.
/// Returns the occupancy before a dropped seat was released, if one was.
/// Errors describe an inconsistency between the event and the current state.
fn apply_to_section(
    rs: &mut SectionState,
    students: &StudentDirectory,
    event: &Event,
) -> Result<Option<u32>, String> {
    let mut released = None;
    match event {
        Event::CapacityRevised { capacity, .. } => rs.ledger.revise(*capacity),
        Event::StatusChanged { status, .. } => rs.status = *status,
        Event::SectionCancelled { at, .. } => {
            for (student_id, record_id) in rs.live.drain() {
                if let Some(record) = rs.records.get_mut(&record_id) {
                    record.state = EnrollmentState::Rejected(RejectReason::CancelledByAdmin);
                    record.seq = None;
                    record.updated_at = *at;
                }
                students.release(&student_id, &rs.id);
            }
            rs.waitlist.clear();
            rs.ledger.vacate_all();
            rs.status = SectionStatus::Cancelled;
        }
        Event::Enrolled {
            record_id,
            student_id,
            at,
            ..
        } => {
            check_new_record(rs, *record_id, *student_id)?;
            if rs.ledger.try_occupy() == Occupancy::Full {
                return Err(format!("no free seat for enrolled record {record_id}"));
            }
            open_record(rs, *record_id, *student_id, EnrollmentState::Enrolled, None, *at);
            students.commit(*student_id, rs.id, &rs.term_id, &rs.meetings, true);
        }
        Event::Waitlisted {
            record_id,
            student_id,
            seq,
            at,
            ..
        } => {
            check_new_record(rs, *record_id, *student_id)?;
            rs.waitlist.insert(WaitEntry {
                seq: *seq,
                student_id: *student_id,
                record_id: *record_id,
            })?;
            open_record(rs, *record_id, *student_id, EnrollmentState::Waitlisted, Some(*seq), *at);
            students.commit(*student_id, rs.id, &rs.term_id, &rs.meetings, false);
        }
        Event::Dropped { record_id, at, .. } => {
            let record = rs
                .records
                .get_mut(record_id)
                .ok_or_else(|| format!("drop of unknown record {record_id}"))?;
            match record.state {
                EnrollmentState::Enrolled => {
                    let previous = rs
                        .ledger
                        .release()
                        .ok_or_else(|| format!("ledger underflow dropping record {record_id}"))?;
                    released = Some(previous);
                }
                EnrollmentState::Waitlisted => {
                    rs.waitlist
                        .remove(&record.student_id)
                        .ok_or_else(|| format!("waitlisted record {record_id} not queued"))?;
                }
                other => return Err(format!("drop of {} record {record_id}", other.as_str())),
            }
            record.state = EnrollmentState::Dropped;
            record.seq = None;
            record.updated_at = *at;
            let student_id = record.student_id;
            rs.live.remove(&student_id);
            students.release(&student_id, &rs.id);
        }
        Event::Promoted { record_id, at, .. } => {
            take_head(rs, *record_id)?;
            if rs.ledger.try_occupy() == Occupancy::Full {
                return Err(format!("no free seat promoting record {record_id}"));
            }
            let record = rs
                .records
                .get_mut(record_id)
                .ok_or_else(|| format!("promotion of unknown record {record_id}"))?;
            record.state = EnrollmentState::Enrolled;
            record.seq = None;
            record.updated_at = *at;
            students.commit(record.student_id, rs.id, &rs.term_id, &rs.meetings, true);
        }
        Event::PromotionRejected {
            record_id,
            reason,
            at,
            ..
        } => {
            take_head(rs, *record_id)?;
            let record = rs
                .records
                .get_mut(record_id)
                .ok_or_else(|| format!("promotion of unknown record {record_id}"))?;
            record.state = EnrollmentState::Rejected(*reason);
            record.seq = None;
            record.updated_at = *at;
            let student_id = record.student_id;
            rs.live.remove(&student_id);
            students.release(&student_id, &rs.id);
        }
        // Catalog and directory events are applied at the engine level.
        Event::SectionPublished { .. }
        | Event::TermArchived { .. }
        | Event::CourseCompleted { .. }
        | Event::HoldPlaced { .. }
        | Event::HoldCleared { .. }
        | Event::SectionRestored { .. }
        | Event::StudentRestored { .. } => {}
    }
    Ok(released)
}

/// The student an unlogged event gave a directory commitment to.
fn committed_student(rs: &SectionState, event: &Event) -> Option<Ulid> {
    match event {
        Event::Enrolled { student_id, .. } | Event::Waitlisted { student_id, .. } => Some(*student_id),
        Event::Promoted { record_id, .. } => rs.records.get(record_id).map(|r| r.student_id),
        _ => None,
    }
}

fn check_new_record(rs: &SectionState, record_id: Ulid, student_id: Ulid) -> Result<(), String> {
    if rs.live.contains_key(&student_id) {
        return Err(format!("student {student_id} already has a live record"));
    }
    if rs.records.contains_key(&record_id) {
        return Err(format!("duplicate record {record_id}"));
    }
    Ok(())
}

fn open_record(
    rs: &mut SectionState,
    record_id: Ulid,
    student_id: Ulid,
    state: EnrollmentState,
    seq: Option<u64>,
    at: Ms,
) {
    rs.records.insert(
        record_id,
        EnrollmentRecord {
            id: record_id,
            student_id,
            section_id: rs.id,
            state,
            seq,
            requested_at: at,
            updated_at: at,
        },
    );
    rs.live.insert(student_id, record_id);
}

/// Dequeue the waitlist head, which must be `record_id`.
fn take_head(rs: &mut SectionState, record_id: Ulid) -> Result<WaitEntry, String> {
    let head = rs
        .waitlist
        .dequeue_head()
        .ok_or_else(|| format!("promotion of {record_id} from an empty waitlist"))?;
    if head.record_id != record_id {
        return Err(format!(
            "promotion of {record_id} but waitlist head is {}",
            head.record_id
        ));
    }
    Ok(head)
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let batches = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            sections: DashMap::new(),
            terms: DashMap::new(),
            students: StudentDirectory::new(),
            wal_tx,
            notify,
            gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };

        for event in batches.iter().flatten() {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Replay one logged event. We're the sole owner of the section Arcs here,
    /// so try_write always succeeds. Never use blocking_write: this may run
    /// inside an async context (lazy tenant creation).
    fn replay_event(&self, event: &Event) {
        match event {
            Event::SectionPublished { .. } | Event::SectionRestored { .. } | Event::TermArchived { .. } => {
                self.apply_catalog(event)
            }
            Event::CourseCompleted { .. }
            | Event::HoldPlaced { .. }
            | Event::HoldCleared { .. }
            | Event::StudentRestored { .. } => self.apply_directory(event),
            other => {
                let Some(section_id) = other.section_id() else { return };
                let Some(shared) = self.get_section(&section_id) else {
                    warn!(%section_id, event = other.label(), "replay: event for unknown section");
                    return;
                };
                let Ok(mut rs) = shared.try_write() else { return };
                if rs.halted.is_some() {
                    return;
                }
                if let Err(detail) = apply_to_section(&mut rs, &self.students, other) {
                    self.halt(&mut rs, format!("replay: {detail}"));
                }
            }
        }
    }

    /// Write one transaction to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, batch: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { batch, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_section(&self, id: &Ulid) -> Option<SharedSectionState> {
        self.sections.get(id).map(|e| e.value().clone())
    }

    /// Enter a section's serialization domain, waiting at most `lock_timeout`.
    /// A timed-out request has mutated nothing.
    pub(super) async fn begin(&self, section_id: Ulid) -> Result<SectionTxn<'_>, EngineError> {
        let shared = self
            .get_section(&section_id)
            .ok_or(EngineError::NotFound(section_id))?;
        let gate = &self.gate;
        let acquire = async move {
            let gate = gate.read().await;
            let guard = shared.write_owned().await;
            (gate, guard)
        };
        let (gate, guard) = match tokio::time::timeout(self.lock_timeout, acquire).await {
            Ok(pair) => pair,
            Err(_) => {
                metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                warn!(%section_id, timeout_ms = self.lock_timeout.as_millis() as u64, "gave up waiting for section");
                return Err(EngineError::Timeout(section_id));
            }
        };
        if guard.archived {
            return Err(EngineError::NotFound(section_id));
        }
        if guard.halted.is_some() {
            return Err(EngineError::SectionHalted(section_id));
        }
        Ok(SectionTxn {
            _gate: gate,
            guard,
            batch: Vec::new(),
        })
    }

    /// Apply an event inside the transaction and queue it for the WAL.
    /// An inconsistent event halts the section. Returns the occupancy a
    /// dropped seat was released from.
    pub(super) fn stage(&self, txn: &mut SectionTxn<'_>, event: Event) -> Result<Option<u32>, EngineError> {
        match apply_to_section(&mut txn.guard, &self.students, &event) {
            Ok(released) => {
                txn.batch.push(event);
                Ok(released)
            }
            Err(detail) => Err(self.halt(&mut txn.guard, detail)),
        }
    }

    /// Make the staged events durable as one WAL frame, then notify listeners.
    /// Memory is already ahead of the log, so a WAL failure halts the section;
    /// a restart replays the durable state.
    pub(super) async fn commit(&self, mut txn: SectionTxn<'_>) -> Result<(), EngineError> {
        if txn.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut txn.batch);
        let section_id = txn.id;
        if let Err(e) = self.wal_append(batch.clone()).await {
            metrics::counter!(observability::WAL_FAILURES_TOTAL).increment(1);
            error!(%section_id, error = %e, "commit failed; section halted");
            txn.halted = Some(format!("WAL append failed: {e}"));
            // The halted section serves no requests until restart, so its
            // unlogged seats must not block the students elsewhere.
            for event in &batch {
                if let Some(student_id) = committed_student(&txn, event) {
                    self.students.release(&student_id, &section_id);
                }
            }
            return Err(e);
        }
        for event in &batch {
            self.notify.send(section_id, event);
        }
        Ok(())
    }

    /// Freeze a section after an invariant violation.
    pub(super) fn halt(&self, rs: &mut SectionState, detail: String) -> EngineError {
        metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
        error!(section_id = %rs.id, %detail, "invariant violation; section halted");
        rs.halted = Some(detail.clone());
        EngineError::InvariantViolation {
            section_id: rs.id,
            detail,
        }
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}
