//! Decoded build engine events

/// Message level the engine uses for fatal errors
pub const LEVEL_ERROR: i64 = 0;

/// One event from the structured log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Aggregate for all path copies of one operation
    StartCopyPaths { id: i64, parent: i64 },
    /// Aggregate for all builds of one operation
    StartBuilds { id: i64, parent: i64 },
    /// Copy of a single store path between stores
    StartCopyPath {
        id: i64,
        path: String,
        from: String,
        to: String,
        text: String,
    },
    /// Build of a single derivation
    StartBuild { id: i64, path: String, text: String },
    /// Network transfer belonging to a copy
    StartFileTransfer {
        id: i64,
        parent: i64,
        path: String,
        text: String,
    },
    ResultProgress {
        id: i64,
        done: i64,
        expected: i64,
        running: i64,
        failed: i64,
    },
    ResultSetPhase { id: i64, phase: String },
    ResultBuildLogLine { id: i64, text: String },
    Stop { id: i64 },
    /// Free-form log message, level 0 is fatal
    Message { text: String, level: i64 },
}

impl Event {
    /// Whether this is a fatal error message
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::Message { level, .. } if *level == LEVEL_ERROR)
    }
}
