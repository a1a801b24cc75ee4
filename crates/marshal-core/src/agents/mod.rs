pub mod definition;
pub mod program;
pub mod run;

pub use definition::{AgentCatalog, AgentDefinition};
pub use program::{
    ControlSignal, ProgramStep, ProgramView, Resume, RunToCompletion, StepDirective, StepProgram,
    program_fn,
};
pub use run::{
    AgentRun, CallOrigin, FailureKind, HistoryEntry, RunEvent, RunHistory, RunOutcome, RunStatus,
    SnapshotPhase, StepBudget, TerminalReason,
};
