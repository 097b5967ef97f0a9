use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{SeatLedger, WaitEntry, Waitlist};

/// Unix milliseconds. Used for record timestamps.
pub type Ms = i64;

/// Minutes since Monday 00:00 of a teaching week.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;
pub const MINUTES_PER_WEEK: Minute = 7 * MINUTES_PER_DAY;

const DAYS: [&str; 7] = ["MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid meeting block: {0}")]
    Meeting(String),
    #[error("invalid grade: {0}")]
    Grade(String),
    #[error("invalid section status: {0}")]
    Status(String),
}

/// Half-open weekly interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day = (self.start / MINUTES_PER_DAY) as usize;
        let offset = day as Minute * MINUTES_PER_DAY;
        let (start, end) = (self.start - offset, self.end - offset);
        write!(
            f,
            "{} {:02}:{:02}-{:02}:{:02}",
            DAYS[day.min(6)],
            start / 60,
            start % 60,
            end / 60,
            end % 60
        )
    }
}

/// Parse `"MON/WED 09:00-10:15, FRI 13:00-14:00"` into sorted, merged spans.
/// An empty string means the section has no meeting blocks.
pub fn parse_meetings(text: &str) -> Result<Vec<Span>, ParseError> {
    let mut spans = Vec::new();
    for block in text.split(',').map(str::trim).filter(|b| !b.is_empty()) {
        let bad = || ParseError::Meeting(block.to_string());
        let (days, times) = block.split_once(char::is_whitespace).ok_or_else(bad)?;
        let (start, end) = times.trim().split_once('-').ok_or_else(bad)?;
        let start = parse_clock(start.trim()).ok_or_else(bad)?;
        let end = parse_clock(end.trim()).ok_or_else(bad)?;
        if start >= end {
            return Err(bad());
        }
        for day in days.split('/') {
            let idx = DAYS
                .iter()
                .position(|d| d.eq_ignore_ascii_case(day.trim()))
                .ok_or_else(bad)?;
            let offset = idx as Minute * MINUTES_PER_DAY;
            spans.push(Span::new(offset + start, offset + end));
        }
    }
    Ok(normalize_meetings(spans))
}

fn parse_clock(s: &str) -> Option<Minute> {
    let (h, m) = s.split_once(':')?;
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if m >= 60 {
        return None;
    }
    let total = h.checked_mul(60)?.checked_add(m)?;
    (total <= MINUTES_PER_DAY).then_some(total)
}

/// Sort by start and merge overlapping blocks. Adjacent blocks stay separate
/// so no span ever crosses midnight.
pub fn normalize_meetings(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| (s.start, s.end));
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start < last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

pub fn format_meetings(spans: &[Span]) -> String {
    spans
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Overlap test for two normalized meeting lists. Linear sweep.
pub fn meetings_overlap(a: &[Span], b: &[Span]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].overlaps(&b[j]) {
            return true;
        }
        if a[i].end <= b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    false
}

/// Grade points in hundredths: A = 400, B+ = 330, F = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Grade(pub u16);

impl Grade {
    pub const MAX: Grade = Grade(400);
    pub const F: Grade = Grade(0);

    /// Anything above F earns credit.
    pub fn is_passing(self) -> bool {
        self > Grade::F
    }

    pub fn from_letter(letter: &str) -> Option<Self> {
        let letter = letter.trim().to_ascii_uppercase();
        let mut chars = letter.chars();
        let base: i32 = match chars.next()? {
            'A' => 400,
            'B' => 300,
            'C' => 200,
            'D' => 100,
            'F' => 0,
            _ => return None,
        };
        let adjust = match chars.as_str() {
            "" => 0,
            "+" => 30,
            "-" => -30,
            _ => return None,
        };
        if base == 0 && adjust != 0 {
            return None;
        }
        Some(Grade((base + adjust).clamp(0, 400) as u16))
    }

    pub fn from_points(points: f64) -> Option<Self> {
        if !points.is_finite() || !(0.0..=4.0).contains(&points) {
            return None;
        }
        Some(Grade((points * 100.0).round() as u16))
    }
}

impl FromStr for Grade {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Grade::from_letter(s)
            .or_else(|| s.trim().parse::<f64>().ok().and_then(Grade::from_points))
            .ok_or_else(|| ParseError::Grade(s.to_string()))
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Course codes compare case-insensitively and without surrounding blanks.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Prerequisite rule over a student's completed courses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Prerequisite {
    #[default]
    None,
    Course {
        course_id: String,
        min_grade: Option<Grade>,
    },
    All(Vec<Prerequisite>),
    Any(Vec<Prerequisite>),
}

impl Prerequisite {
    /// A course without a minimum grade needs a passing grade.
    pub fn is_satisfied_by(&self, completed: &HashMap<String, Grade>) -> bool {
        match self {
            Prerequisite::None => true,
            Prerequisite::Course {
                course_id,
                min_grade,
            } => completed.get(course_id).is_some_and(|g| match min_grade {
                Some(min) => g >= min,
                None => g.is_passing(),
            }),
            Prerequisite::All(parts) => parts.iter().all(|p| p.is_satisfied_by(completed)),
            Prerequisite::Any(parts) => parts.iter().any(|p| p.is_satisfied_by(completed)),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Prerequisite::None | Prerequisite::Course { .. } => 1,
            Prerequisite::All(parts) | Prerequisite::Any(parts) => {
                1 + parts.iter().map(Prerequisite::depth).max().unwrap_or(0)
            }
        }
    }
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prerequisite::None => Ok(()),
            Prerequisite::Course {
                course_id,
                min_grade,
            } => {
                write_code(f, course_id)?;
                if let Some(min) = min_grade {
                    write!(f, " >= {min}")?;
                }
                Ok(())
            }
            Prerequisite::All(parts) => write_group(f, parts, " AND "),
            Prerequisite::Any(parts) => write_group(f, parts, " OR "),
        }
    }
}

fn write_code(f: &mut fmt::Formatter<'_>, code: &str) -> fmt::Result {
    let plain = code
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !["AND", "OR", "NOT"].iter().any(|k| k.eq_ignore_ascii_case(code));
    if plain {
        f.write_str(code)
    } else {
        write!(f, "\"{code}\"")
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, parts: &[Prerequisite], sep: &str) -> fmt::Result {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        match part {
            Prerequisite::All(_) | Prerequisite::Any(_) => write!(f, "({part})")?,
            _ => write!(f, "{part}")?,
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionStatus {
    Open,
    Closed,
    Cancelled,
}

impl SectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionStatus::Open => "open",
            SectionStatus::Closed => "closed",
            SectionStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SectionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(SectionStatus::Open),
            "closed" => Ok(SectionStatus::Closed),
            "cancelled" | "canceled" => Ok(SectionStatus::Cancelled),
            _ => Err(ParseError::Status(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    HoldBlocked,
    SectionClosed,
    AlreadyRequested,
    PrerequisiteUnmet,
    ScheduleConflict,
    CancelledByAdmin,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::HoldBlocked => "hold_blocked",
            RejectReason::SectionClosed => "section_closed",
            RejectReason::AlreadyRequested => "already_requested",
            RejectReason::PrerequisiteUnmet => "prerequisite_unmet",
            RejectReason::ScheduleConflict => "schedule_conflict",
            RejectReason::CancelledByAdmin => "cancelled_by_admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentState {
    Enrolled,
    Waitlisted,
    Dropped,
    Rejected(RejectReason),
}

impl EnrollmentState {
    /// Enrolled and Waitlisted records are live; at most one per (student, section).
    pub fn is_live(&self) -> bool {
        matches!(self, EnrollmentState::Enrolled | EnrollmentState::Waitlisted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentState::Enrolled => "enrolled",
            EnrollmentState::Waitlisted => "waitlisted",
            EnrollmentState::Dropped => "dropped",
            EnrollmentState::Rejected(_) => "rejected",
        }
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            EnrollmentState::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub id: Ulid,
    pub student_id: Ulid,
    pub section_id: Ulid,
    pub state: EnrollmentState,
    /// Waitlist intake sequence; set only while Waitlisted.
    pub seq: Option<u64>,
    pub requested_at: Ms,
    pub updated_at: Ms,
}

/// Everything a section's serialization domain owns.
#[derive(Debug)]
pub struct SectionState {
    pub id: Ulid,
    pub course_id: String,
    pub term_id: String,
    pub meetings: Vec<Span>,
    pub prerequisites: Prerequisite,
    pub status: SectionStatus,
    pub ledger: SeatLedger,
    pub waitlist: Waitlist,
    pub records: HashMap<Ulid, EnrollmentRecord>,
    /// student → live record id.
    pub live: HashMap<Ulid, Ulid>,
    /// Set after an invariant violation; the section then refuses mutations.
    pub halted: Option<String>,
    /// Set when the term is archived, for transactions that raced the removal.
    pub archived: bool,
}

impl SectionState {
    pub fn new(
        id: Ulid,
        course_id: String,
        term_id: String,
        capacity: u32,
        meetings: Vec<Span>,
        prerequisites: Prerequisite,
    ) -> Self {
        Self {
            id,
            course_id,
            term_id,
            meetings,
            prerequisites,
            status: SectionStatus::Open,
            ledger: SeatLedger::new(capacity),
            waitlist: Waitlist::new(),
            records: HashMap::new(),
            live: HashMap::new(),
            halted: None,
            archived: false,
        }
    }

    pub fn live_record(&self, student_id: &Ulid) -> Option<&EnrollmentRecord> {
        self.live.get(student_id).and_then(|id| self.records.get(id))
    }

    pub fn info(&self) -> SectionInfo {
        SectionInfo {
            id: self.id,
            course_id: self.course_id.clone(),
            term_id: self.term_id.clone(),
            capacity: self.ledger.capacity(),
            occupied: self.ledger.occupied(),
            waitlist_length: self.waitlist.len(),
            status: self.status,
            meetings: self.meetings.clone(),
            prerequisites: self.prerequisites.clone(),
        }
    }

    pub fn status_info(&self) -> SectionStatusInfo {
        SectionStatusInfo {
            section_id: self.id,
            occupied: self.ledger.occupied(),
            capacity: self.ledger.capacity(),
            waitlist_length: self.waitlist.len(),
            status: self.status,
            halted: self.halted.is_some(),
        }
    }

    pub fn record_info(&self, record: &EnrollmentRecord) -> EnrollmentInfo {
        let position = match record.state {
            EnrollmentState::Waitlisted => self.waitlist.position_of(&record.student_id),
            _ => None,
        };
        EnrollmentInfo {
            record_id: record.id,
            student_id: record.student_id,
            section_id: record.section_id,
            course_id: self.course_id.clone(),
            state: record.state,
            position,
            requested_at: record.requested_at,
            updated_at: record.updated_at,
        }
    }

    pub fn snapshot(&self) -> SectionSnapshot {
        let mut records: Vec<EnrollmentRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        SectionSnapshot {
            id: self.id,
            course_id: self.course_id.clone(),
            term_id: self.term_id.clone(),
            meetings: self.meetings.clone(),
            prerequisites: self.prerequisites.clone(),
            status: self.status,
            capacity: self.ledger.capacity(),
            occupied: self.ledger.occupied(),
            waitlist: self.waitlist.iter().copied().collect(),
            next_seq: self.waitlist.next_seq(),
            records,
        }
    }

    /// Rebuild from a compaction snapshot, cross-checking ledger and queue
    /// against the records.
    pub fn restore(snapshot: SectionSnapshot) -> Result<Self, String> {
        let mut rs = SectionState::new(
            snapshot.id,
            snapshot.course_id,
            snapshot.term_id,
            snapshot.capacity,
            snapshot.meetings,
            snapshot.prerequisites,
        );
        rs.status = snapshot.status;
        rs.ledger = SeatLedger::restore(snapshot.capacity, snapshot.occupied);
        rs.waitlist = Waitlist::restore(snapshot.waitlist, snapshot.next_seq)?;

        let mut enrolled = 0u32;
        for record in snapshot.records {
            if record.state.is_live() {
                if rs.live.insert(record.student_id, record.id).is_some() {
                    return Err(format!("two live records for student {}", record.student_id));
                }
                match record.state {
                    EnrollmentState::Enrolled => enrolled += 1,
                    _ if rs.waitlist.position_of(&record.student_id).is_none() => {
                        return Err(format!("waitlisted record {} not queued", record.id));
                    }
                    _ => {}
                }
            }
            rs.records.insert(record.id, record);
        }
        if enrolled != rs.ledger.occupied() {
            return Err(format!(
                "ledger occupancy {} != {enrolled} enrolled records",
                rs.ledger.occupied()
            ));
        }
        Ok(rs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSnapshot {
    pub id: Ulid,
    pub course_id: String,
    pub term_id: String,
    pub meetings: Vec<Span>,
    pub prerequisites: Prerequisite,
    pub status: SectionStatus,
    pub capacity: u32,
    pub occupied: u32,
    pub waitlist: Vec<WaitEntry>,
    pub next_seq: u64,
    pub records: Vec<EnrollmentRecord>,
}

/// WAL record format. One committed transaction is a `Vec<Event>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SectionPublished {
        id: Ulid,
        course_id: String,
        term_id: String,
        capacity: u32,
        meetings: Vec<Span>,
        prerequisites: Prerequisite,
    },
    CapacityRevised {
        section_id: Ulid,
        capacity: u32,
    },
    StatusChanged {
        section_id: Ulid,
        status: SectionStatus,
    },
    SectionCancelled {
        section_id: Ulid,
        at: Ms,
    },
    TermArchived {
        term_id: String,
    },
    Enrolled {
        section_id: Ulid,
        record_id: Ulid,
        student_id: Ulid,
        at: Ms,
    },
    Waitlisted {
        section_id: Ulid,
        record_id: Ulid,
        student_id: Ulid,
        seq: u64,
        at: Ms,
    },
    Dropped {
        section_id: Ulid,
        record_id: Ulid,
        at: Ms,
    },
    Promoted {
        section_id: Ulid,
        record_id: Ulid,
        at: Ms,
    },
    PromotionRejected {
        section_id: Ulid,
        record_id: Ulid,
        reason: RejectReason,
        at: Ms,
    },
    CourseCompleted {
        student_id: Ulid,
        course_id: String,
        grade: Grade,
    },
    HoldPlaced {
        id: Ulid,
        student_id: Ulid,
        reason: String,
    },
    HoldCleared {
        id: Ulid,
    },
    SectionRestored {
        snapshot: Box<SectionSnapshot>,
    },
    StudentRestored {
        student_id: Ulid,
        completed: Vec<(String, Grade)>,
        holds: Vec<(Ulid, String)>,
    },
}

impl Event {
    /// The section whose domain this event belongs to, if any.
    pub fn section_id(&self) -> Option<Ulid> {
        match self {
            Event::SectionPublished { id, .. } => Some(*id),
            Event::CapacityRevised { section_id, .. }
            | Event::StatusChanged { section_id, .. }
            | Event::SectionCancelled { section_id, .. }
            | Event::Enrolled { section_id, .. }
            | Event::Waitlisted { section_id, .. }
            | Event::Dropped { section_id, .. }
            | Event::Promoted { section_id, .. }
            | Event::PromotionRejected { section_id, .. } => Some(*section_id),
            Event::SectionRestored { snapshot } => Some(snapshot.id),
            Event::TermArchived { .. }
            | Event::CourseCompleted { .. }
            | Event::HoldPlaced { .. }
            | Event::HoldCleared { .. }
            | Event::StudentRestored { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Event::SectionPublished { .. } => "section_published",
            Event::CapacityRevised { .. } => "capacity_revised",
            Event::StatusChanged { .. } => "status_changed",
            Event::SectionCancelled { .. } => "section_cancelled",
            Event::TermArchived { .. } => "term_archived",
            Event::Enrolled { .. } => "enrolled",
            Event::Waitlisted { .. } => "waitlisted",
            Event::Dropped { .. } => "dropped",
            Event::Promoted { .. } => "promoted",
            Event::PromotionRejected { .. } => "promotion_rejected",
            Event::CourseCompleted { .. } => "course_completed",
            Event::HoldPlaced { .. } => "hold_placed",
            Event::HoldCleared { .. } => "hold_cleared",
            Event::SectionRestored { .. } => "section_restored",
            Event::StudentRestored { .. } => "student_restored",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub id: Ulid,
    pub course_id: String,
    pub term_id: String,
    pub capacity: u32,
    pub occupied: u32,
    pub waitlist_length: usize,
    pub status: SectionStatus,
    pub meetings: Vec<Span>,
    pub prerequisites: Prerequisite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionStatusInfo {
    pub section_id: Ulid,
    pub occupied: u32,
    pub capacity: u32,
    pub waitlist_length: usize,
    pub status: SectionStatus,
    pub halted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentInfo {
    pub record_id: Ulid,
    pub student_id: Ulid,
    pub section_id: Ulid,
    pub course_id: String,
    pub state: EnrollmentState,
    /// 1-based, only while Waitlisted.
    pub position: Option<usize>,
    pub requested_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitlistInfo {
    pub position: usize,
    pub seq: u64,
    pub student_id: Ulid,
    pub record_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInfo {
    pub id: Ulid,
    pub student_id: Ulid,
    pub reason: String,
}

/// Synchronous answer to a registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Enrolled { record_id: Ulid },
    Waitlisted { record_id: Ulid, position: usize },
    Rejected { reason: RejectReason },
}

impl RegistrationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationOutcome::Enrolled { .. } => "enrolled",
            RegistrationOutcome::Waitlisted { .. } => "waitlisted",
            RegistrationOutcome::Rejected { .. } => "rejected",
        }
    }

    pub fn record_id(&self) -> Option<Ulid> {
        match self {
            RegistrationOutcome::Enrolled { record_id }
            | RegistrationOutcome::Waitlisted { record_id, .. } => Some(*record_id),
            RegistrationOutcome::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropOutcome {
    pub record_id: Ulid,
    /// Records moved from the waitlist into a seat by this drop.
    pub promoted: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Live records turned into `Rejected(CancelledByAdmin)`; 0 on a repeat cancel.
    pub rejected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grades(pairs: &[(&str, &str)]) -> HashMap<String, Grade> {
        pairs
            .iter()
            .map(|(c, g)| (c.to_string(), g.parse().unwrap()))
            .collect()
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert_eq!(a.duration(), 100);
    }

    #[test]
    fn parse_meetings_expands_days() {
        let spans = parse_meetings("MON/WED 09:00-10:15, fri 13:00-14:00").unwrap();
        assert_eq!(
            spans,
            vec![
                Span::new(540, 615),
                Span::new(2 * 1440 + 540, 2 * 1440 + 615),
                Span::new(4 * 1440 + 780, 4 * 1440 + 840),
            ]
        );
        assert_eq!(
            format_meetings(&spans),
            "MON 09:00-10:15, WED 09:00-10:15, FRI 13:00-14:00"
        );
    }

    #[test]
    fn parse_meetings_merges_overlaps() {
        let spans = parse_meetings("TUE 10:00-11:00, TUE 10:30-12:00").unwrap();
        assert_eq!(spans, vec![Span::new(1440 + 600, 1440 + 720)]);
    }

    #[test]
    fn parse_meetings_allows_midnight_end() {
        let spans = parse_meetings("SUN 23:00-24:00").unwrap();
        assert_eq!(spans, vec![Span::new(6 * 1440 + 1380, MINUTES_PER_WEEK)]);
        assert_eq!(spans[0].to_string(), "SUN 23:00-24:00");
    }

    #[test]
    fn parse_meetings_rejects_garbage() {
        assert!(parse_meetings("MON 10:00").is_err());
        assert!(parse_meetings("XYZ 10:00-11:00").is_err());
        assert!(parse_meetings("MON 11:00-10:00").is_err());
        assert!(parse_meetings("MON 10:61-11:00").is_err());
        assert!(parse_meetings("MON 23:00-24:30").is_err());
        assert_eq!(parse_meetings("  ").unwrap(), vec![]);
    }

    #[test]
    fn meetings_overlap_sweep() {
        let a = parse_meetings("MON/WED 09:00-10:15").unwrap();
        let b = parse_meetings("WED 10:00-11:00").unwrap();
        let c = parse_meetings("MON/WED 10:15-11:30, FRI 09:00-10:00").unwrap();
        assert!(meetings_overlap(&a, &b));
        assert!(meetings_overlap(&b, &a));
        assert!(!meetings_overlap(&a, &c));
        assert!(!meetings_overlap(&a, &[]));
    }

    #[test]
    fn grade_parsing() {
        assert_eq!("A".parse::<Grade>().unwrap(), Grade(400));
        assert_eq!("A+".parse::<Grade>().unwrap(), Grade(400));
        assert_eq!("b+".parse::<Grade>().unwrap(), Grade(330));
        assert_eq!("C-".parse::<Grade>().unwrap(), Grade(170));
        assert_eq!("F".parse::<Grade>().unwrap(), Grade(0));
        assert_eq!("2.7".parse::<Grade>().unwrap(), Grade(270));
        assert!("F+".parse::<Grade>().is_err());
        assert!("4.5".parse::<Grade>().is_err());
        assert!("E".parse::<Grade>().is_err());
        assert_eq!(Grade(330).to_string(), "3.30");
    }

    #[test]
    fn prerequisite_evaluation() {
        let rule = Prerequisite::All(vec![
            Prerequisite::Course {
                course_id: "CS101".into(),
                min_grade: Some(Grade(200)),
            },
            Prerequisite::Any(vec![
                Prerequisite::Course {
                    course_id: "MATH200".into(),
                    min_grade: None,
                },
                Prerequisite::Course {
                    course_id: "MATH210".into(),
                    min_grade: Some(Grade(270)),
                },
            ]),
        ]);
        assert!(rule.is_satisfied_by(&grades(&[("CS101", "B"), ("MATH200", "D")])));
        assert!(rule.is_satisfied_by(&grades(&[("CS101", "C"), ("MATH210", "B-")])));
        assert!(!rule.is_satisfied_by(&grades(&[("CS101", "C-"), ("MATH200", "A")])));
        assert!(!rule.is_satisfied_by(&grades(&[("CS101", "A"), ("MATH210", "C+")])));
        assert!(!rule.is_satisfied_by(&grades(&[])));
        // A failed course does not meet a bare requirement.
        assert!(!rule.is_satisfied_by(&grades(&[("CS101", "B"), ("MATH200", "F")])));
        assert!(Prerequisite::None.is_satisfied_by(&grades(&[])));
        assert_eq!(rule.depth(), 3);
        assert_eq!(
            rule.to_string(),
            "CS101 >= 2.00 AND (MATH200 OR MATH210 >= 2.70)"
        );
    }

    #[test]
    fn prerequisite_display_quotes_odd_codes() {
        let rule = Prerequisite::Course {
            course_id: "CS-101".into(),
            min_grade: None,
        };
        assert_eq!(rule.to_string(), "\"CS-101\"");
        assert_eq!(Prerequisite::None.to_string(), "");
    }

    #[test]
    fn status_parsing() {
        assert_eq!("Open".parse::<SectionStatus>().unwrap(), SectionStatus::Open);
        assert_eq!(
            "canceled".parse::<SectionStatus>().unwrap(),
            SectionStatus::Cancelled
        );
        assert!("paused".parse::<SectionStatus>().is_err());
    }

    #[test]
    fn snapshot_restore_checks_occupancy() {
        let mut rs = SectionState::new(
            Ulid::new(),
            "CS201".into(),
            "2026FA".into(),
            2,
            vec![],
            Prerequisite::None,
        );
        let student = Ulid::new();
        let record = EnrollmentRecord {
            id: Ulid::new(),
            student_id: student,
            section_id: rs.id,
            state: EnrollmentState::Enrolled,
            seq: None,
            requested_at: 1,
            updated_at: 1,
        };
        rs.live.insert(student, record.id);
        rs.records.insert(record.id, record);

        // Ledger says 0 occupied but one Enrolled record exists.
        assert!(SectionState::restore(rs.snapshot()).is_err());

        rs.ledger.try_occupy();
        let restored = SectionState::restore(rs.snapshot()).unwrap();
        assert_eq!(restored.ledger.occupied(), 1);
        assert!(restored.live_record(&student).is_some());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SectionPublished {
            id: Ulid::new(),
            course_id: "CS201".into(),
            term_id: "2026FA".into(),
            capacity: 30,
            meetings: parse_meetings("MON 09:00-10:00").unwrap(),
            prerequisites: Prerequisite::Course {
                course_id: "CS101".into(),
                min_grade: Some(Grade(200)),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
