use marshal_tools::RunId;

use crate::agents::{HistoryEntry, RunStatus, TerminalReason};

/// Progress of any run in a session, for passive observers.
#[derive(Debug, Clone, PartialEq)]
pub enum RunNotice {
    Started {
        run_id: RunId,
        parent_id: Option<RunId>,
        agent_type: String,
        depth: u32,
    },
    Appended {
        run_id: RunId,
        entry: HistoryEntry,
    },
    StatusChanged {
        run_id: RunId,
        status: RunStatus,
    },
    Finished {
        run_id: RunId,
        parent_id: Option<RunId>,
        reason: TerminalReason,
    },
}

impl RunNotice {
    pub fn run_id(&self) -> RunId {
        match self {
            RunNotice::Started { run_id, .. }
            | RunNotice::Appended { run_id, .. }
            | RunNotice::StatusChanged { run_id, .. }
            | RunNotice::Finished { run_id, .. } => *run_id,
        }
    }
}
