use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("term not found: {0}")]
    TermNotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid capacity {0}: must be at least 1")]
    InvalidCapacity(u32),
    #[error("no active registration for student {student_id} in section {section_id}")]
    NoActiveRegistration { student_id: Ulid, section_id: Ulid },
    #[error("section {0} is cancelled")]
    SectionCancelled(Ulid),
    #[error("timed out waiting for section {0}")]
    Timeout(Ulid),
    #[error("invariant violation in section {section_id}: {detail}")]
    InvariantViolation { section_id: Ulid, detail: String },
    #[error("section {0} is halted after an invariant violation")]
    SectionHalted(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("WAL error: {0}")]
    WalError(String),
}
