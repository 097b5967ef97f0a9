use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashmap::DashMap;
use tracing::info;
use ulid::Ulid;

use super::eligibility::{Commitment, StudentSnapshot};
use super::{Engine, EngineError};
use crate::limits::*;
use crate::model::{meetings_overlap, normalize_code, Event, Grade, HoldInfo, Span};

#[derive(Debug, Clone, Default)]
struct StudentEntry {
    completed: HashMap<String, Grade>,
    holds: BTreeMap<Ulid, String>,
    /// Sections the student is Enrolled or Waitlisted in.
    commitments: BTreeMap<Ulid, Commitment>,
    /// Every section holding a record about the student.
    sections: BTreeSet<Ulid>,
}

impl StudentEntry {
    fn is_empty(&self) -> bool {
        self.completed.is_empty()
            && self.holds.is_empty()
            && self.commitments.is_empty()
            && self.sections.is_empty()
    }
}

/// Per-student read data (history, holds) plus the schedule index the
/// coordinator maintains. Each student lives in one DashMap shard, so a
/// check-and-claim on a student's schedule is atomic.
pub struct StudentDirectory {
    students: DashMap<Ulid, StudentEntry>,
    hold_owner: DashMap<Ulid, Ulid>,
}

impl Default for StudentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StudentDirectory {
    pub fn new() -> Self {
        Self {
            students: DashMap::new(),
            hold_owner: DashMap::new(),
        }
    }

    pub fn snapshot(&self, student_id: &Ulid) -> StudentSnapshot {
        match self.students.get(student_id) {
            Some(entry) => StudentSnapshot {
                hold_count: entry.holds.len(),
                completed: entry.completed.clone(),
                commitments: entry.commitments.values().cloned().collect(),
            },
            None => StudentSnapshot::default(),
        }
    }

    pub fn completed_count(&self, student_id: &Ulid) -> usize {
        self.students
            .get(student_id)
            .map_or(0, |e| e.completed.len())
    }

    /// Record a completed course. A retake keeps the better grade.
    pub fn record_completion(&self, student_id: Ulid, course_id: String, grade: Grade) {
        let mut entry = self.students.entry(student_id).or_default();
        let best = entry.completed.entry(course_id).or_insert(grade);
        *best = (*best).max(grade);
    }

    pub fn hold_exists(&self, hold_id: &Ulid) -> bool {
        self.hold_owner.contains_key(hold_id)
    }

    pub fn hold_count(&self, student_id: &Ulid) -> usize {
        self.students.get(student_id).map_or(0, |e| e.holds.len())
    }

    pub fn hold_owner(&self, hold_id: &Ulid) -> Option<Ulid> {
        self.hold_owner.get(hold_id).map(|e| *e.value())
    }

    pub fn place_hold(&self, hold_id: Ulid, student_id: Ulid, reason: String) {
        self.students
            .entry(student_id)
            .or_default()
            .holds
            .insert(hold_id, reason);
        self.hold_owner.insert(hold_id, student_id);
    }

    /// Returns the student the hold belonged to.
    pub fn clear_hold(&self, hold_id: &Ulid) -> Option<Ulid> {
        let (_, student_id) = self.hold_owner.remove(hold_id)?;
        if let Some(mut entry) = self.students.get_mut(&student_id) {
            entry.holds.remove(hold_id);
        }
        self.students.remove_if(&student_id, |_, e| e.is_empty());
        Some(student_id)
    }

    pub fn holds(&self, student_id: &Ulid) -> Vec<HoldInfo> {
        self.students
            .get(student_id)
            .map(|e| {
                e.holds
                    .iter()
                    .map(|(id, reason)| HoldInfo {
                        id: *id,
                        student_id: *student_id,
                        reason: reason.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Atomically check the student's seated sections in `term_id` for a
    /// meeting overlap and, if there is none, record a seat in `section_id`.
    /// On conflict returns the section that is in the way.
    pub fn claim_seat(&self, student_id: Ulid, section_id: Ulid, term_id: &str, meetings: &[Span]) -> Result<(), Ulid> {
        let mut entry = self.students.entry(student_id).or_default();
        if let Some(other) = entry
            .commitments
            .values()
            .filter(|c| c.seated && c.section_id != section_id && c.term_id == term_id)
            .find(|c| meetings_overlap(&c.meetings, meetings))
        {
            return Err(other.section_id);
        }
        entry.sections.insert(section_id);
        entry.commitments.insert(
            section_id,
            Commitment {
                section_id,
                term_id: term_id.to_string(),
                meetings: meetings.to_vec(),
                seated: true,
            },
        );
        Ok(())
    }

    /// Record a commitment without checking for conflicts.
    pub fn commit(&self, student_id: Ulid, section_id: Ulid, term_id: &str, meetings: &[Span], seated: bool) {
        let mut entry = self.students.entry(student_id).or_default();
        entry.sections.insert(section_id);
        entry.commitments.insert(
            section_id,
            Commitment {
                section_id,
                term_id: term_id.to_string(),
                meetings: meetings.to_vec(),
                seated,
            },
        );
    }

    /// Remember that `section_id` holds a non-live record about the student.
    pub fn note_section(&self, student_id: Ulid, section_id: Ulid) {
        self.students
            .entry(student_id)
            .or_default()
            .sections
            .insert(section_id);
    }

    /// Remove a commitment; the section stays in the student's history.
    pub fn release(&self, student_id: &Ulid, section_id: &Ulid) {
        if let Some(mut entry) = self.students.get_mut(student_id) {
            entry.commitments.remove(section_id);
        }
    }

    /// Forget a section entirely (term archival).
    pub fn forget_section(&self, student_id: &Ulid, section_id: &Ulid) {
        if let Some(mut entry) = self.students.get_mut(student_id) {
            entry.commitments.remove(section_id);
            entry.sections.remove(section_id);
        }
        self.students.remove_if(student_id, |_, e| e.is_empty());
    }

    /// Sections holding records about the student, in id order.
    pub fn sections_of(&self, student_id: &Ulid) -> Vec<Ulid> {
        self.students
            .get(student_id)
            .map(|e| e.sections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Directory data that is not derivable from sections, for compaction.
    pub fn export(&self) -> Vec<(Ulid, Vec<(String, Grade)>, Vec<(Ulid, String)>)> {
        let mut out: Vec<_> = self
            .students
            .iter()
            .filter(|e| !e.completed.is_empty() || !e.holds.is_empty())
            .map(|e| {
                let mut completed: Vec<(String, Grade)> =
                    e.completed.iter().map(|(c, g)| (c.clone(), *g)).collect();
                completed.sort();
                let holds = e.holds.iter().map(|(id, r)| (*id, r.clone())).collect();
                (*e.key(), completed, holds)
            })
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    pub fn restore(&self, student_id: Ulid, completed: Vec<(String, Grade)>, holds: Vec<(Ulid, String)>) {
        let mut entry = self.students.entry(student_id).or_default();
        entry.completed.extend(completed);
        for (hold_id, reason) in holds {
            self.hold_owner.insert(hold_id, student_id);
            entry.holds.insert(hold_id, reason);
        }
    }
}

impl Engine {
    /// Record a completed course for a student (externally supplied history).
    pub async fn record_completion(&self, student_id: Ulid, course_id: &str, grade: Grade) -> Result<(), EngineError> {
        let course_id = normalize_code(course_id);
        if course_id.is_empty() {
            return Err(EngineError::Invalid("course_id must not be empty".into()));
        }
        if course_id.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("code too long"));
        }
        if grade > Grade::MAX {
            return Err(EngineError::Invalid(format!("grade {grade} above 4.00")));
        }

        let _directory = self.catalog_lock.lock().await;
        let known = self.students.snapshot(&student_id).completed.contains_key(&course_id);
        if !known && self.students.completed_count(&student_id) >= MAX_COMPLETED_COURSES_PER_STUDENT {
            return Err(EngineError::LimitExceeded("too many completed courses"));
        }
        let _gate = self.gate.read().await;
        let event = Event::CourseCompleted {
            student_id,
            course_id,
            grade,
        };
        self.wal_append(vec![event.clone()]).await?;
        self.apply_directory(&event);
        Ok(())
    }

    pub async fn place_hold(&self, id: Ulid, student_id: Ulid, reason: &str) -> Result<HoldInfo, EngineError> {
        if reason.len() > MAX_HOLD_REASON_LEN {
            return Err(EngineError::LimitExceeded("hold reason too long"));
        }

        let _directory = self.catalog_lock.lock().await;
        if self.students.hold_exists(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.students.hold_count(&student_id) >= MAX_HOLDS_PER_STUDENT {
            return Err(EngineError::LimitExceeded("too many holds on student"));
        }
        let _gate = self.gate.read().await;
        let event = Event::HoldPlaced {
            id,
            student_id,
            reason: reason.to_string(),
        };
        self.wal_append(vec![event.clone()]).await?;
        self.apply_directory(&event);
        info!(hold_id = %id, %student_id, "hold placed");
        Ok(HoldInfo {
            id,
            student_id,
            reason: reason.to_string(),
        })
    }

    /// Lift a hold. Returns the student it belonged to.
    pub async fn clear_hold(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _directory = self.catalog_lock.lock().await;
        let student_id = self.students.hold_owner(&id).ok_or(EngineError::NotFound(id))?;
        let _gate = self.gate.read().await;
        let event = Event::HoldCleared { id };
        self.wal_append(vec![event.clone()]).await?;
        self.apply_directory(&event);
        info!(hold_id = %id, %student_id, "hold cleared");
        Ok(student_id)
    }

    /// Apply a directory event (history, holds).
    pub(super) fn apply_directory(&self, event: &Event) {
        match event {
            Event::CourseCompleted {
                student_id,
                course_id,
                grade,
            } => self
                .students
                .record_completion(*student_id, course_id.clone(), *grade),
            Event::HoldPlaced {
                id,
                student_id,
                reason,
            } => self.students.place_hold(*id, *student_id, reason.clone()),
            Event::HoldCleared { id } => {
                self.students.clear_hold(id);
            }
            Event::StudentRestored {
                student_id,
                completed,
                holds,
            } => self
                .students
                .restore(*student_id, completed.clone(), holds.clone()),
            _ => {}
        }
    }
}
