use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedSectionState};

impl Engine {
    fn section_or_not_found(&self, section_id: &Ulid) -> Result<SharedSectionState, EngineError> {
        self.get_section(section_id)
            .ok_or(EngineError::NotFound(*section_id))
    }

    pub async fn section_status(&self, section_id: Ulid) -> Result<SectionStatusInfo, EngineError> {
        let shared = self.section_or_not_found(&section_id)?;
        let rs = shared.read().await;
        Ok(rs.status_info())
    }

    pub async fn section_info(&self, section_id: Ulid) -> Result<SectionInfo, EngineError> {
        let shared = self.section_or_not_found(&section_id)?;
        let rs = shared.read().await;
        Ok(rs.info())
    }

    /// All sections, or those of one term, ordered by course then id.
    pub async fn list_sections(&self, term_id: Option<&str>) -> Vec<SectionInfo> {
        // Collect Arcs first so no DashMap guard is held across an await.
        let shared: Vec<SharedSectionState> = match term_id {
            Some(term) => self
                .terms
                .get(&normalize_code(term))
                .map(|ids| ids.iter().filter_map(|id| self.get_section(id)).collect())
                .unwrap_or_default(),
            None => self.sections.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            out.push(rs.read().await.info());
        }
        out.sort_by(|a, b| a.course_id.cmp(&b.course_id).then(a.id.cmp(&b.id)));
        out
    }

    /// Queue in order with dense 1-based positions.
    pub async fn waitlist(&self, section_id: Ulid) -> Result<Vec<WaitlistInfo>, EngineError> {
        let shared = self.section_or_not_found(&section_id)?;
        let rs = shared.read().await;
        Ok(rs
            .waitlist
            .iter()
            .enumerate()
            .map(|(i, entry)| WaitlistInfo {
                position: i + 1,
                seq: entry.seq,
                student_id: entry.student_id,
                record_id: entry.record_id,
            })
            .collect())
    }

    /// Every record about a section, oldest first.
    pub async fn section_records(&self, section_id: Ulid) -> Result<Vec<EnrollmentInfo>, EngineError> {
        let shared = self.section_or_not_found(&section_id)?;
        let rs = shared.read().await;
        let mut out: Vec<EnrollmentInfo> = rs.records.values().map(|r| rs.record_info(r)).collect();
        out.sort_by_key(|r| (r.requested_at, r.record_id));
        Ok(out)
    }

    /// Every record about a student across sections, oldest first.
    pub async fn student_records(&self, student_id: Ulid) -> Vec<EnrollmentInfo> {
        let shared: Vec<SharedSectionState> = self
            .students
            .sections_of(&student_id)
            .iter()
            .filter_map(|id| self.get_section(id))
            .collect();
        let mut out = Vec::new();
        for section in shared {
            let rs = section.read().await;
            out.extend(
                rs.records
                    .values()
                    .filter(|r| r.student_id == student_id)
                    .map(|r| rs.record_info(r)),
            );
        }
        out.sort_by_key(|r| (r.requested_at, r.record_id));
        out
    }

    /// The student's live record in a section, if any.
    pub async fn registration(&self, student_id: Ulid, section_id: Ulid) -> Result<Option<EnrollmentInfo>, EngineError> {
        let shared = self.section_or_not_found(&section_id)?;
        let rs = shared.read().await;
        Ok(rs.live_record(&student_id).map(|r| rs.record_info(r)))
    }

    pub fn holds(&self, student_id: Ulid) -> Vec<HoldInfo> {
        self.students.holds(&student_id)
    }
}
