use tokio::sync::oneshot;
use tracing::info;

use crate::model::*;

use super::{Engine, EngineError, SharedSectionState, WalCommand};

impl Engine {
    /// Rewrite the WAL as one snapshot event per student and per section.
    /// Holds the gate exclusively, so no transaction is half-applied while the
    /// snapshot is taken. Refuses while any section is halted: its in-memory
    /// state is not trustworthy and the log is the only good copy.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;

        let mut events: Vec<Event> = self
            .students
            .export()
            .into_iter()
            .map(|(student_id, completed, holds)| Event::StudentRestored {
                student_id,
                completed,
                holds,
            })
            .collect();

        let sections: Vec<SharedSectionState> = self.sections.iter().map(|e| e.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(sections.len());
        for shared in sections {
            let rs = shared.read().await;
            if rs.halted.is_some() {
                return Err(EngineError::SectionHalted(rs.id));
            }
            snapshots.push(rs.snapshot());
        }
        snapshots.sort_by_key(|s| s.id);
        let section_count = snapshots.len();
        events.extend(snapshots.into_iter().map(|snapshot| Event::SectionRestored {
            snapshot: Box::new(snapshot),
        }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        info!(sections = section_count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
