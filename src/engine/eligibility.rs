use std::collections::HashMap;

use ulid::Ulid;

use crate::model::{meetings_overlap, Grade, Prerequisite, RejectReason, SectionState, SectionStatus, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(RejectReason),
}

/// Which rules apply. A promotion re-check skips the section-status and
/// duplicate-request rules: closing a section stops intake, not promotion,
/// and the student's live record is the one being promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Request,
    Promotion,
}

/// A section the student is Enrolled or Waitlisted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub section_id: Ulid,
    pub term_id: String,
    pub meetings: Vec<Span>,
    /// Enrolled (true) or only Waitlisted (false).
    pub seated: bool,
}

/// Point-in-time copy of what the checker needs to know about a student.
#[derive(Debug, Clone, Default)]
pub struct StudentSnapshot {
    pub hold_count: usize,
    pub completed: HashMap<String, Grade>,
    pub commitments: Vec<Commitment>,
}

impl StudentSnapshot {
    /// First seated section in `term_id`, other than `section_id`, whose
    /// meetings overlap. Sections of different terms never conflict.
    pub fn conflicting_section(&self, section_id: Ulid, term_id: &str, meetings: &[Span]) -> Option<Ulid> {
        self.commitments
            .iter()
            .filter(|c| c.seated && c.section_id != section_id && c.term_id == term_id)
            .find(|c| meetings_overlap(&c.meetings, meetings))
            .map(|c| c.section_id)
    }
}

/// The slice of a section the checker reads.
#[derive(Debug, Clone, Copy)]
pub struct SectionView<'a> {
    pub section_id: Ulid,
    pub term_id: &'a str,
    pub status: SectionStatus,
    pub has_live_record: bool,
    pub prerequisites: &'a Prerequisite,
    pub meetings: &'a [Span],
}

impl<'a> SectionView<'a> {
    pub fn of(rs: &'a SectionState, student_id: &Ulid) -> Self {
        Self {
            section_id: rs.id,
            term_id: &rs.term_id,
            status: rs.status,
            has_live_record: rs.live.contains_key(student_id),
            prerequisites: &rs.prerequisites,
            meetings: &rs.meetings,
        }
    }
}

/// Evaluate the eligibility rules in order; the first failure wins.
pub fn check(student: &StudentSnapshot, section: &SectionView<'_>, mode: CheckMode) -> Eligibility {
    use Eligibility::Ineligible;

    if student.hold_count > 0 {
        return Ineligible(RejectReason::HoldBlocked);
    }
    if mode == CheckMode::Request {
        if section.status != SectionStatus::Open {
            return Ineligible(RejectReason::SectionClosed);
        }
        if section.has_live_record {
            return Ineligible(RejectReason::AlreadyRequested);
        }
    }
    if !section.prerequisites.is_satisfied_by(&student.completed) {
        return Ineligible(RejectReason::PrerequisiteUnmet);
    }
    if student
        .conflicting_section(section.section_id, section.term_id, section.meetings)
        .is_some()
    {
        return Ineligible(RejectReason::ScheduleConflict);
    }
    Eligibility::Eligible
}
