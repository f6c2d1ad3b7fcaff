use thiserror::Error;

/// Result type for stream plumbing operations
pub type Result<T> = std::result::Result<T, PlumbingError>;

/// Errors that can occur while wiring or running a topology
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlumbingError {
    /// Topology has already been started
    #[error("Topology has already been started")]
    AlreadyStarted,

    /// A barrier needs at least one input stream
    #[error("Cannot build a barrier with no input streams")]
    NoStreams,

    /// The concurrent composer needs at least one pipeline
    #[error("Cannot run concurrent analytics with no pipelines")]
    NoPipelines,

    /// The queue, slot or buffer feeding a stage has been closed
    #[error("Stage input is closed")]
    Closed,

    /// A blocking wait or sleep was interrupted by shutdown
    #[error("Blocking operation interrupted by shutdown")]
    Interrupted,

    /// A concurrent mapper produced no result for a tuple
    #[error("Mapper index {index} returned no result")]
    MissingResult { index: usize },

    /// Stage execution error
    #[error("Stage execution failed: {0}")]
    StageError(String),

    /// Worker thread could not be spawned or panicked
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Shutdown error
    #[error("Topology shutdown error: {0}")]
    ShutdownError(String),
}

impl PlumbingError {
    /// True for the errors a worker sees when its topology is torn down
    pub fn is_teardown(&self) -> bool {
        matches!(self, PlumbingError::Closed | PlumbingError::Interrupted)
    }
}
