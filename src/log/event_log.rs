//! Event binary log (spec.md §6): the on-disk persistence of the events
//! drained from the [`EventRing`](super::EventRing) (component G) — a
//! small header (`magic`, `version`, `record_size`) followed by one
//! fixed-size record per event, `{ timestamp_ns: i64, type: u16, _pad:
//! u16, payload: [u8; 48] }`.
//!
//! This is always written regardless of the `DISABLE_STRUCTURED_LOG` /
//! `DISABLE_SERVO_LOG` toggles (SPEC_FULL.md §1): those gate the
//! higher-level CSV and JSON-lines products, not the ring's own raw
//! persistence, which spec.md §1 calls "always-on, low-overhead".

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::log::{Event, EventKind, DETAIL_LEN};

const MAGIC: &[u8; 4] = b"SWCL";
const VERSION: u16 = 1;
/// `timestamp_ns` (8) + `type` (2) + `_pad` (2) + `payload` (48).
const RECORD_SIZE: u16 = 60;

/// Maps an [`EventKind`] to the fixed `type` code persisted in each
/// record. Spec.md §4.G's own vocabulary (`PI_STEP`, `FREQUENCY_CLAMP`,
/// ...) is a subset of [`EventKind`]; this crate's extra kinds (`Step`,
/// `RingOverflow`) get the next free codes rather than being folded into
/// an existing one, so no information is lost on disk.
fn kind_code(kind: EventKind) -> u16 {
    match kind {
        EventKind::AdjustCall => 1,
        EventKind::AdjustReturn => 2,
        EventKind::PiEnable => 3,
        EventKind::PiDisable => 4,
        EventKind::PiStep => 5,
        EventKind::SlewBegin => 6,
        EventKind::SlewComplete => 7,
        EventKind::FrequencyClamp => 8,
        EventKind::ThresholdCross => 9,
        EventKind::SessionCreated => 10,
        EventKind::SessionStarted => 11,
        EventKind::SessionStopping => 12,
        EventKind::SessionDestroyed => 13,
        EventKind::Rotate => 14,
        EventKind::Error => 15,
        EventKind::Step => 16,
        EventKind::RingOverflow => 17,
    }
}

/// Writes the binary event log. Like [`CsvWriter`](super::csv::CsvWriter),
/// hashes every record as it is written rather than re-reading the file.
pub struct EventLogWriter {
    file: BufWriter<File>,
    hasher: Sha256,
    records_written: u64,
}

impl EventLogWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        let mut hasher = Sha256::new();

        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.extend_from_slice(&RECORD_SIZE.to_le_bytes());
        file.write_all(&header)?;
        hasher.update(&header);

        Ok(Self {
            file,
            hasher,
            records_written: 0,
        })
    }

    pub fn write_event(&mut self, event: &Event) -> Result<()> {
        let mut record = [0u8; RECORD_SIZE as usize];
        record[0..8].copy_from_slice(&event.timestamp_ns.to_le_bytes());
        record[8..10].copy_from_slice(&kind_code(event.kind).to_le_bytes());
        // record[10..12] is `_pad`, left zeroed.
        debug_assert_eq!(12 + DETAIL_LEN, RECORD_SIZE as usize);
        record[12..12 + DETAIL_LEN].copy_from_slice(event.detail_bytes());

        self.file.write_all(&record)?;
        self.hasher.update(&record);
        self.records_written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flushes the file and returns the SHA-256 hex of the header plus
    /// every record written (manifest entries hash the whole file, per
    /// SPEC_FULL.md §2's "manifest `sha256` per logged file").
    pub fn finish(mut self) -> Result<String> {
        self.file.flush()?;
        let digest = self.hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}
