//! The always-on logging core: a lock-free event ring feeding a writer
//! thread that maintains a sealed CSV file of servo state (component H)
//! and a JSON-lines structured event stream (component I), finalized
//! into a session manifest on shutdown (component J).

pub mod csv;
pub mod event_log;
pub mod ring;
pub mod session;
pub mod stream;

pub use ring::EventRing;
pub use session::{ManifestFile, SessionFinalizer, SessionManifest};

/// The kinds of event this crate ever records. Kept as a closed enum
/// (rather than a free-form string) so the structured stream and the
/// ring agree on what a "kind" is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    SessionCreated,
    SessionStarted,
    SessionStopping,
    SessionDestroyed,
    PiEnable,
    PiDisable,
    PiStep,
    FrequencyClamp,
    Step,
    SlewBegin,
    SlewComplete,
    AdjustCall,
    AdjustReturn,
    ThresholdCross,
    Rotate,
    RingOverflow,
    Error,
}

/// Size of an [`Event`]'s inline detail buffer, matching the binary event
/// log's fixed `payload` field (component G: "the event ring is a single
/// fixed allocation; no per-event heap traffic" — the in-memory record and
/// its on-disk counterpart share one size so no copy needs to resize).
pub const DETAIL_LEN: usize = 48;

/// A `std::fmt::Write` sink over a fixed buffer, so a push site can format
/// detail text directly into an [`Event`] without an intermediate heap
/// `String`. Excess bytes beyond the buffer are silently truncated, the
/// same policy the binary event log already applies to overlong detail.
struct DetailWriter<'a> {
    buf: &'a mut [u8; DETAIL_LEN],
    len: usize,
}

impl std::fmt::Write for DetailWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let remaining = DETAIL_LEN - self.len;
        let n = s.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// One entry in the event ring / structured stream. `Copy` and free of any
/// heap allocation of its own, so pushing one onto the [`EventRing`] never
/// touches the allocator (component G: "the event ring is a single fixed
/// allocation; no per-event heap traffic").
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub timestamp_ns: i64,
    pub kind: EventKind,
    /// Free-form human-readable detail, inline and fixed-size; the
    /// structured stream also carries `kind` and `timestamp_ns` as
    /// first-class fields so this never needs to be machine-parsed.
    detail: [u8; DETAIL_LEN],
    detail_len: u8,
}

impl Event {
    /// Copies `detail` into the event's inline buffer, truncating at
    /// [`DETAIL_LEN`] bytes. For a detail string already in hand; use
    /// [`Event::with_detail`] to format one without a heap allocation.
    pub fn new(timestamp_ns: i64, kind: EventKind, detail: &str) -> Self {
        let mut buf = [0u8; DETAIL_LEN];
        let n = detail.len().min(DETAIL_LEN);
        buf[..n].copy_from_slice(&detail.as_bytes()[..n]);
        Self {
            timestamp_ns,
            kind,
            detail: buf,
            detail_len: n as u8,
        }
    }

    /// Builds an event whose detail is formatted straight into the inline
    /// buffer from `args` (pass `format_args!(...)` at the call site),
    /// rather than allocating a `String` via `format!()` first and copying
    /// it in. The only allocation-free way to carry a dynamic detail
    /// message through the always-on event ring's hot path.
    pub fn with_detail(timestamp_ns: i64, kind: EventKind, args: std::fmt::Arguments<'_>) -> Self {
        use std::fmt::Write;
        let mut buf = [0u8; DETAIL_LEN];
        let mut writer = DetailWriter { buf: &mut buf, len: 0 };
        let _ = writer.write_fmt(args);
        let len = writer.len;
        Self {
            timestamp_ns,
            kind,
            detail: buf,
            detail_len: len as u8,
        }
    }

    /// The detail text, decoded from the inline buffer. Used by sinks that
    /// need human-readable text (the structured stream, the error path);
    /// the binary event log instead copies `detail_bytes()` directly.
    pub fn detail_str(&self) -> &str {
        std::str::from_utf8(&self.detail[..self.detail_len as usize]).unwrap_or("")
    }

    /// The raw, zero-padded 48-byte detail buffer, exactly what the binary
    /// event log's fixed-size `payload` field stores.
    pub fn detail_bytes(&self) -> &[u8; DETAIL_LEN] {
        &self.detail
    }
}
