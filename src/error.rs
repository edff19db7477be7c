use thiserror::Error;

/// Everything that can go wrong talking to a [`Clock`][crate::Clock].
#[derive(Debug, Error)]
pub enum Error {
    /// An `adjust`/`gettime` argument was malformed: a bad modes mask, a
    /// subsec value that overflows its unit, or (in strict mode) an
    /// unrecognized flag.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The instance is not `Running` (either not yet started or already
    /// stopping/destroyed).
    #[error("clock instance is not running")]
    NotRunning,

    /// A log file or the reference clock could not be read/written.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A structured event or session manifest failed to serialize.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The event ring was full; the event was dropped, not an error the
    /// caller needs to act on, but surfaced for completeness where an
    /// operation specifically measures ring pressure.
    #[error("event ring is full, event dropped")]
    RingFull,

    /// An invariant the clock depends on was violated; fatal to the
    /// session.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
