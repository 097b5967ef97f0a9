use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::eligibility::{check, CheckMode, Eligibility, SectionView};
use super::{now_ms, Engine, EngineError, SectionTxn};

impl Engine {
    /// Request a seat. Ineligible requests are answered with `Rejected` and
    /// leave no record behind.
    pub async fn register(&self, student_id: Ulid, section_id: Ulid) -> Result<RegistrationOutcome, EngineError> {
        let mut txn = self.begin(section_id).await?;
        let student = self.students.snapshot(&student_id);
        let eligibility = check(&student, &SectionView::of(&txn, &student_id), CheckMode::Request);
        let outcome = match eligibility {
            Eligibility::Ineligible(reason) => RegistrationOutcome::Rejected { reason },
            Eligibility::Eligible => self.admit(&mut txn, student_id)?,
        };
        self.commit(txn).await?;

        metrics::counter!(observability::REGISTRATIONS_TOTAL, "outcome" => outcome.label()).increment(1);
        debug!(%student_id, %section_id, outcome = ?outcome, "registration");
        Ok(outcome)
    }

    /// Seat the student if the ledger has room, otherwise queue them.
    fn admit(&self, txn: &mut SectionTxn<'_>, student_id: Ulid) -> Result<RegistrationOutcome, EngineError> {
        if txn.live.len() >= MAX_LIVE_RECORDS_PER_SECTION {
            return Err(EngineError::LimitExceeded("too many live records in section"));
        }
        let section_id = txn.id;
        let record_id = Ulid::new();
        let at = now_ms();

        if txn.ledger.has_free_seat() {
            // The snapshot may be stale: another section can have seated this
            // student in a conflicting slot since. The claim settles it.
            if let Err(conflicting) = self
                .students
                .claim_seat(student_id, section_id, &txn.term_id, &txn.meetings)
            {
                debug!(%student_id, %section_id, %conflicting, "seat claim lost to a concurrent enrollment");
                return Ok(RegistrationOutcome::Rejected {
                    reason: RejectReason::ScheduleConflict,
                });
            }
            let staged = self.stage(
                txn,
                Event::Enrolled {
                    section_id,
                    record_id,
                    student_id,
                    at,
                },
            );
            if let Err(e) = staged {
                self.students.release(&student_id, &section_id);
                return Err(e);
            }
            return Ok(RegistrationOutcome::Enrolled { record_id });
        }

        if txn.waitlist.len() >= MAX_WAITLIST_LEN {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }
        let seq = txn.waitlist.next_seq();
        self.stage(
            txn,
            Event::Waitlisted {
                section_id,
                record_id,
                student_id,
                seq,
                at,
            },
        )?;
        let position = txn
            .waitlist
            .position_of(&student_id)
            .unwrap_or(txn.waitlist.len());
        Ok(RegistrationOutcome::Waitlisted { record_id, position })
    }

    /// Withdraw a student's live registration. A seat released from a section
    /// that was at capacity promotes from the waitlist in the same transaction.
    pub async fn drop_registration(&self, student_id: Ulid, section_id: Ulid) -> Result<DropOutcome, EngineError> {
        let mut txn = self.begin(section_id).await?;
        let record_id = match txn.live_record(&student_id) {
            Some(record) => record.id,
            None => {
                return Err(EngineError::NoActiveRegistration {
                    student_id,
                    section_id,
                });
            }
        };
        let released = self.stage(
            &mut txn,
            Event::Dropped {
                section_id,
                record_id,
                at: now_ms(),
            },
        )?;
        let promoted = if released == Some(txn.ledger.capacity()) {
            self.promote(&mut txn)?
        } else {
            Vec::new()
        };
        self.commit(txn).await?;

        debug!(%student_id, %section_id, %record_id, promoted = promoted.len(), "registration dropped");
        Ok(DropOutcome { record_id, promoted })
    }

    /// Fill free seats from the head of the waitlist. Each head is re-checked;
    /// an ineligible head is rejected and the seat stays free for the next.
    fn promote(&self, txn: &mut SectionTxn<'_>) -> Result<Vec<Ulid>, EngineError> {
        let section_id = txn.id;
        let mut promoted = Vec::new();

        while txn.ledger.has_free_seat() {
            let Some(head) = txn.waitlist.peek_head().copied() else { break };
            let student = self.students.snapshot(&head.student_id);
            let eligibility = check(&student, &SectionView::of(txn, &head.student_id), CheckMode::Promotion);
            let rejection = match eligibility {
                Eligibility::Ineligible(reason) => Some(reason),
                Eligibility::Eligible => self
                    .students
                    .claim_seat(head.student_id, section_id, &txn.term_id, &txn.meetings)
                    .err()
                    .map(|_| RejectReason::ScheduleConflict),
            };

            let at = now_ms();
            match rejection {
                None => {
                    let staged = self.stage(
                        txn,
                        Event::Promoted {
                            section_id,
                            record_id: head.record_id,
                            at,
                        },
                    );
                    if let Err(e) = staged {
                        self.students.release(&head.student_id, &section_id);
                        return Err(e);
                    }
                    metrics::counter!(observability::PROMOTIONS_TOTAL, "outcome" => "promoted").increment(1);
                    info!(%section_id, student_id = %head.student_id, record_id = %head.record_id, "promoted from waitlist");
                    promoted.push(head.record_id);
                }
                Some(reason) => {
                    self.stage(
                        txn,
                        Event::PromotionRejected {
                            section_id,
                            record_id: head.record_id,
                            reason,
                            at,
                        },
                    )?;
                    metrics::counter!(observability::PROMOTIONS_TOTAL, "outcome" => "rejected").increment(1);
                    info!(%section_id, student_id = %head.student_id, reason = reason.as_str(), "waitlist head failed re-check");
                }
            }
        }
        Ok(promoted)
    }

    /// Change a section's capacity. A decrease below occupancy is accepted
    /// and only blocks new seats; an increase promotes from the waitlist.
    pub async fn revise_capacity(&self, section_id: Ulid, capacity: u32) -> Result<SectionStatusInfo, EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidCapacity(capacity));
        }
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        let mut txn = self.begin(section_id).await?;
        if txn.status == SectionStatus::Cancelled {
            return Err(EngineError::SectionCancelled(section_id));
        }
        let previous = txn.ledger.capacity();
        if previous == capacity {
            return Ok(txn.status_info());
        }

        self.stage(&mut txn, Event::CapacityRevised { section_id, capacity })?;
        let promoted = if capacity > previous {
            self.promote(&mut txn)?
        } else {
            Vec::new()
        };
        let status = txn.status_info();
        self.commit(txn).await?;

        info!(%section_id, previous, capacity, occupied = status.occupied, promoted = promoted.len(), "capacity revised");
        Ok(status)
    }

    /// Open or close a section. Closing stops intake; reopening promotes.
    pub async fn set_status(&self, section_id: Ulid, status: SectionStatus) -> Result<SectionStatusInfo, EngineError> {
        if status == SectionStatus::Cancelled {
            return Err(EngineError::Invalid(
                "cancellation is a separate operation".into(),
            ));
        }
        let mut txn = self.begin(section_id).await?;
        if txn.status == SectionStatus::Cancelled {
            return Err(EngineError::SectionCancelled(section_id));
        }
        if txn.status == status {
            return Ok(txn.status_info());
        }

        self.stage(&mut txn, Event::StatusChanged { section_id, status })?;
        if status == SectionStatus::Open {
            self.promote(&mut txn)?;
        }
        let info = txn.status_info();
        self.commit(txn).await?;

        info!(%section_id, status = status.as_str(), "section status changed");
        Ok(info)
    }

    /// Cancel a section: every live record becomes `Rejected(CancelledByAdmin)`,
    /// the queue and ledger are emptied. Cancelling twice is a no-op.
    pub async fn cancel_section(&self, section_id: Ulid) -> Result<CancelOutcome, EngineError> {
        let mut txn = self.begin(section_id).await?;
        if txn.status == SectionStatus::Cancelled {
            return Ok(CancelOutcome { rejected: 0 });
        }
        let rejected = txn.live.len();
        self.stage(
            &mut txn,
            Event::SectionCancelled {
                section_id,
                at: now_ms(),
            },
        )?;
        self.commit(txn).await?;

        info!(%section_id, rejected, "section cancelled");
        Ok(CancelOutcome { rejected })
    }
}
