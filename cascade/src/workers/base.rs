use std::fmt;

/// Classification of cascade workers, used in logs and metric labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerType {
    /// The main consumer of a node.
    Main,
    /// A copy worker bulk loading one table.
    Copy { table: String },
}

impl WorkerType {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerType::Main => "main",
            WorkerType::Copy { .. } => "copy",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Main => f.write_str("main"),
            WorkerType::Copy { table } => write!(f, "copy({table})"),
        }
    }
}

/// Why a worker loop returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested.
    Shutdown,
    /// The worker has nothing left to do, which only happens to copy workers.
    Finished,
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopStep {
    /// A batch was processed, the next one is fetched right away.
    Worked,
    /// Nothing to do, sleep before polling again.
    Idle(std::time::Duration),
    Exit(WorkerExit),
}
