use crate::solvers::active::{ConvergenceEntry, Phase, TerminalStatus};

/// Events emitted by the controller to the main thread.
#[derive(Debug, Clone)]
pub enum SolverEvent {
    /// Diagnostic log message.
    Log(String),

    /// The controller moved to another phase of its state machine.
    PhaseChanged(Phase),

    /// A retrain succeeded. Carries the new generation and the number of samples fitted.
    GenerationFitted { generation: u64, samples: usize },

    /// A completed outer iteration with full statistics.
    IterationUpdate(ConvergenceEntry),

    /// Controller has finished its run.
    Finished(TerminalStatus),
}

pub mod active;
pub mod neb;
pub mod policy;
