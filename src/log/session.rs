//! Session Finalizer (component J): on clock destruction, closes the CSV,
//! event-binary-log, and structured-stream files and writes a manifest
//! tying them together with the run's identity (spec.md §6 "Manifest").
//!
//! `uuid`/`num_cpus`/`hostname` are the same trio the distillation's host
//! environment capture leans on elsewhere in the pack
//! (`seanchatmangpt/knhk`'s workspace carries all three for exactly this
//! "what ran where" bookkeeping).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::servo::ServoKind;

/// One entry in the manifest's `files` array, matching spec.md §6's
/// `{ path, bytes, sha256, sealed }` literally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub sealed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionManifest {
    pub run_uuid: String,
    pub servo_kind: String,
    pub hostname: String,
    pub cpu_count: usize,
    pub start_iso: String,
    pub end_iso: String,
    pub files: Vec<ManifestFile>,
    pub dropped_events: u64,
    pub rows_written: u64,
    pub events_written: u64,
}

/// Generates the identity a session is created with: a fresh run id and
/// the host facts that go unchanged into the eventual manifest.
pub struct SessionFinalizer {
    pub run_uuid: String,
    pub hostname: String,
    pub cpu_count: usize,
    pub started_at_rfc3339: String,
}

impl SessionFinalizer {
    pub fn begin(servo_kind: ServoKind) -> Self {
        let _ = servo_kind;
        Self {
            run_uuid: uuid::Uuid::new_v4().to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            cpu_count: num_cpus::get(),
            started_at_rfc3339: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Writes `manifest_path` and returns the manifest written, called
    /// once every log file's writer has flushed and sealed (or, for a
    /// disabled log, simply omitted from `files`).
    pub fn finish(
        &self,
        manifest_path: impl AsRef<Path>,
        servo_kind: ServoKind,
        files: Vec<ManifestFile>,
        rows_written: u64,
        events_written: u64,
        dropped_events: u64,
    ) -> Result<SessionManifest> {
        let manifest = SessionManifest {
            run_uuid: self.run_uuid.clone(),
            servo_kind: match servo_kind {
                ServoKind::Pi => "pi".to_string(),
                ServoKind::Ekf => "ekf".to_string(),
            },
            hostname: self.hostname.clone(),
            cpu_count: self.cpu_count,
            start_iso: self.started_at_rfc3339.clone(),
            end_iso: chrono::Utc::now().to_rfc3339(),
            files,
            dropped_events,
            rows_written,
            events_written,
        };
        let file = std::fs::File::create(manifest_path)?;
        serde_json::to_writer_pretty(file, &manifest)?;
        Ok(manifest)
    }
}
