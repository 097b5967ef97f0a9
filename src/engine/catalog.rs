use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, StudentDirectory};

/// Everything needed to publish a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpec {
    pub id: Ulid,
    pub course_id: String,
    pub term_id: String,
    pub capacity: u32,
    pub meetings: Vec<Span>,
    pub prerequisites: Prerequisite,
}

fn validate_code(code: &str, what: &'static str) -> Result<String, EngineError> {
    let code = normalize_code(code);
    if code.is_empty() {
        return Err(EngineError::Invalid(format!("{what} must not be empty")));
    }
    if code.len() > MAX_CODE_LEN {
        return Err(EngineError::LimitExceeded("code too long"));
    }
    Ok(code)
}

fn normalize_prerequisite(rule: Prerequisite) -> Result<Prerequisite, EngineError> {
    Ok(match rule {
        Prerequisite::None => Prerequisite::None,
        Prerequisite::Course {
            course_id,
            min_grade,
        } => Prerequisite::Course {
            course_id: validate_code(&course_id, "prerequisite course")?,
            min_grade,
        },
        Prerequisite::All(parts) => Prerequisite::All(
            parts
                .into_iter()
                .map(normalize_prerequisite)
                .collect::<Result<_, _>>()?,
        ),
        Prerequisite::Any(parts) => Prerequisite::Any(
            parts
                .into_iter()
                .map(normalize_prerequisite)
                .collect::<Result<_, _>>()?,
        ),
    })
}

/// Mark a section archived and drop it from every student's schedule and
/// history. The caller removes it from the section table.
fn retire_section(rs: &mut SectionState, students: &StudentDirectory) {
    rs.archived = true;
    for record in rs.records.values() {
        students.forget_section(&record.student_id, &rs.id);
    }
}

impl Engine {
    pub async fn publish_section(&self, spec: SectionSpec) -> Result<SectionInfo, EngineError> {
        if spec.capacity == 0 {
            return Err(EngineError::InvalidCapacity(0));
        }
        if spec.capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if spec.meetings.len() > MAX_MEETINGS_PER_SECTION {
            return Err(EngineError::LimitExceeded("too many meeting blocks"));
        }
        if spec.prerequisites.depth() > MAX_PREREQUISITE_DEPTH {
            return Err(EngineError::LimitExceeded("prerequisite rule too deep"));
        }
        let course_id = validate_code(&spec.course_id, "course_id")?;
        let term_id = validate_code(&spec.term_id, "term_id")?;
        let prerequisites = normalize_prerequisite(spec.prerequisites)?;
        let meetings = normalize_meetings(spec.meetings);

        let _catalog = self.catalog_lock.lock().await;
        let _gate = self.gate.read().await;
        if self.sections.contains_key(&spec.id) {
            return Err(EngineError::AlreadyExists(spec.id));
        }
        if self.sections.len() >= MAX_SECTIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many sections"));
        }

        let event = Event::SectionPublished {
            id: spec.id,
            course_id,
            term_id,
            capacity: spec.capacity,
            meetings,
            prerequisites,
        };
        self.wal_append(vec![event.clone()]).await?;
        self.apply_catalog(&event);
        self.notify.send(spec.id, &event);

        let shared = self
            .get_section(&spec.id)
            .ok_or(EngineError::NotFound(spec.id))?;
        let info = shared.read().await.info();
        info!(section_id = %info.id, course = %info.course_id, term = %info.term_id, capacity = info.capacity, "section published");
        Ok(info)
    }

    /// Destroy every section of a term. Waits for in-flight transactions on
    /// those sections, then frees the affected students' schedule entries.
    pub async fn archive_term(&self, term_id: &str) -> Result<usize, EngineError> {
        let term_id = normalize_code(term_id);
        let _catalog = self.catalog_lock.lock().await;
        let _gate = self.gate.read().await;

        let ids: Vec<Ulid> = self
            .terms
            .get(&term_id)
            .map(|ids| ids.iter().copied().collect())
            .ok_or_else(|| EngineError::TermNotFound(term_id.clone()))?;

        // Hold every section of the term so nothing commits between the WAL
        // append and the removal.
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(shared) = self.get_section(id) {
                guards.push(shared.write_owned().await);
            }
        }

        let event = Event::TermArchived {
            term_id: term_id.clone(),
        };
        self.wal_append(vec![event.clone()]).await?;

        for mut rs in guards {
            retire_section(&mut rs, &self.students);
            self.sections.remove(&rs.id);
            self.notify.send(rs.id, &event);
            self.notify.remove(&rs.id);
        }
        self.terms.remove(&term_id);
        info!(term = %term_id, sections = ids.len(), "term archived");
        Ok(ids.len())
    }

    /// Apply a catalog event to the section table (publish, restore, archive).
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::SectionPublished {
                id,
                course_id,
                term_id,
                capacity,
                meetings,
                prerequisites,
            } => {
                let rs = SectionState::new(
                    *id,
                    course_id.clone(),
                    term_id.clone(),
                    *capacity,
                    meetings.clone(),
                    prerequisites.clone(),
                );
                self.insert_section(rs);
            }
            Event::SectionRestored { snapshot } => {
                let snapshot = (**snapshot).clone();
                let rs = match SectionState::restore(snapshot.clone()) {
                    Ok(rs) => rs,
                    Err(detail) => {
                        let mut rs = SectionState::new(
                            snapshot.id,
                            snapshot.course_id,
                            snapshot.term_id,
                            snapshot.capacity,
                            snapshot.meetings,
                            snapshot.prerequisites,
                        );
                        self.halt(&mut rs, format!("restore: {detail}"));
                        rs
                    }
                };
                for record in rs.records.values() {
                    match record.state {
                        EnrollmentState::Enrolled => {
                            self.students.commit(record.student_id, rs.id, &rs.term_id, &rs.meetings, true)
                        }
                        EnrollmentState::Waitlisted => {
                            self.students.commit(record.student_id, rs.id, &rs.term_id, &rs.meetings, false)
                        }
                        _ => self.students.note_section(record.student_id, rs.id),
                    }
                }
                self.insert_section(rs);
            }
            Event::TermArchived { term_id } => {
                let Some((_, ids)) = self.terms.remove(term_id) else { return };
                for id in ids {
                    let Some((_, shared)) = self.sections.remove(&id) else { continue };
                    match shared.try_write() {
                        Ok(mut rs) => retire_section(&mut rs, &self.students),
                        Err(_) => error!(section_id = %id, "replay: archived section still locked"),
                    }
                    self.notify.remove(&id);
                }
            }
            _ => {}
        }
    }

    fn insert_section(&self, rs: SectionState) {
        self.terms.entry(rs.term_id.clone()).or_default().insert(rs.id);
        self.sections.insert(rs.id, Arc::new(RwLock::new(rs)));
    }
}
