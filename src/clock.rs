//! Instance Lifecycle (component K): `Clock` ties the timebase, servo,
//! adjustment router, poll loop and logging writer together behind the
//! `Created -> Running -> Stopping -> Destroyed` state machine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::adjust::{AdjustReply, AdjustRequest, AdjustRouter, Modes, Status};
use crate::consts::{
    DEFAULT_TICK_USEC, KI_PPM_PER_S2, KP_PPM_PER_S, MAX_PPM, PHASE_EPSILON_NS, POLL_NS,
    PPM_SCALE, TAI_DEFAULT_S,
};
use crate::error::{Error, Result};
use crate::log::csv::{self, CsvMeta, CsvRow, CsvWriter};
use crate::log::event_log::EventLogWriter;
use crate::log::stream::{classify, EventStreamWriter, StreamContext};
use crate::log::{Event, EventKind, EventRing, ManifestFile, SessionFinalizer, SessionManifest};
use crate::poll::{LockTracker, PollLoop};
use crate::reference::{host_info, now_ref_ns};
use crate::servo::{AnyServo, Servo, ServoKind};
use crate::timebase::{ClockId, Timebase};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    Created,
    Running,
    Stopping,
    Destroyed,
}

/// Where a session's artifacts land and which servo disciplines it.
#[derive(Clone, Debug)]
pub struct ClockConfig {
    pub test_name: String,
    pub servo_kind: ServoKind,
    pub poll_ns: i64,
    pub tai_offset_s: i32,
    pub csv_path: PathBuf,
    pub event_bin_path: PathBuf,
    pub stream_path: PathBuf,
    pub manifest_path: PathBuf,
    pub ring_capacity: usize,
    /// spec.md §4.H "Rotation": once the servo-state CSV crosses this
    /// size, it is sealed, renamed with a rotation suffix, and a fresh
    /// file is opened at `csv_path`. `0` disables rotation.
    pub csv_max_size_mb: u64,
    /// spec.md §4.E "strict-mode toggle": reject unrecognized `modes`
    /// bits instead of silently ignoring them.
    pub strict_mode: bool,
    /// Whether the servo-state CSV (component H) is written at all.
    /// Captured once at `create`, per SPEC_FULL.md §1 — never re-read
    /// from the environment after this.
    pub servo_log_enabled: bool,
    /// Whether the structured JSON-lines event stream (component I) is
    /// written at all. Same capture-once discipline as above.
    pub structured_log_enabled: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            test_name: "swclock-session".to_string(),
            servo_kind: ServoKind::Pi,
            poll_ns: POLL_NS,
            tai_offset_s: TAI_DEFAULT_S,
            csv_path: PathBuf::from("swclock.csv"),
            event_bin_path: PathBuf::from("swclock.events.bin"),
            stream_path: PathBuf::from("swclock.jsonl"),
            manifest_path: PathBuf::from("swclock.manifest.json"),
            ring_capacity: 4096,
            csv_max_size_mb: crate::consts::DEFAULT_CSV_MAX_SIZE_MB,
            strict_mode: false,
            servo_log_enabled: true,
            structured_log_enabled: true,
        }
    }
}

impl ClockConfig {
    /// Applies the four recognized environment toggles of spec.md §6 on
    /// top of whatever `self` already carries, then returns `self`. Must
    /// be called at most once, at `Clock::create` time — reading the
    /// environment anywhere else (e.g. lazily per call) is exactly the
    /// "thread-function static caching of env" bug spec.md §9 warns
    /// against.
    pub fn with_env_overrides(mut self) -> Self {
        let set = |name: &str| std::env::var_os(name).is_some();

        if set("DISABLE_SERVO_LOG") {
            self.servo_log_enabled = false;
        }
        if set("ENABLE_SERVO_LOG") {
            // ENABLE wins over DISABLE if both happen to be set, since it
            // is the more specific ask.
            self.servo_log_enabled = true;
        }
        if set("DISABLE_STRUCTURED_LOG") {
            self.structured_log_enabled = false;
        }

        if let Some(dir) = std::env::var_os("LOG_DIR") {
            let dir = PathBuf::from(dir);
            let rebase = |p: &PathBuf| dir.join(p.file_name().unwrap_or_default());
            self.csv_path = rebase(&self.csv_path);
            self.event_bin_path = rebase(&self.event_bin_path);
            self.stream_path = rebase(&self.stream_path);
            self.manifest_path = rebase(&self.manifest_path);
        }

        self
    }
}

struct WriterOutcome {
    rows_written: u64,
    events_written: u64,
    csv_sha256: Option<String>,
    event_bin_sha256: Option<String>,
    stream_sha256: Option<String>,
    /// Sealed-and-renamed CSV files produced by rotation before the final
    /// (still-open-at-shutdown) one, oldest first.
    rotated_csv_files: Vec<ManifestFile>,
    /// Set once a write failure degraded that product mid-session (as
    /// opposed to it never having been enabled at all). Drives whether an
    /// unsealed manifest entry is owed for it (spec.md §7).
    csv_failed: bool,
    stream_failed: bool,
    event_log_failed: bool,
}

/// Everything the writer thread needs that doesn't change for the life
/// of the session; bundled so `spawn_writer`/the no-start fallback in
/// `destroy` share one code path instead of two.
struct WriterParams {
    ring: Arc<EventRing>,
    timebase: Arc<Timebase>,
    servo: Arc<Mutex<AnyServo>>,
    adjust: Arc<Mutex<AdjustRouter>>,
    lock: Arc<LockTracker>,
    csv_path: PathBuf,
    event_bin_path: PathBuf,
    stream_path: PathBuf,
    run_uuid: String,
    servo_log_enabled: bool,
    structured_log_enabled: bool,
    csv_meta_fixed: CsvMetaFixed,
    csv_max_size_mb: u64,
}

/// The parts of [`CsvMeta`] that are plain owned data rather than
/// borrows, so they can be stashed on `Clock` and reborrowed per write.
#[derive(Clone)]
struct CsvMetaFixed {
    test_name: String,
    servo_kind: &'static str,
    started_at_rfc3339: String,
    poll_ns: i64,
    tai_offset_s: i32,
    host: String,
    kernel: String,
    arch: String,
    cpu_count: usize,
}

fn build_stream_context(timebase: &Timebase, servo: &Mutex<AnyServo>, lock: &LockTracker) -> StreamContext {
    let snapshot = timebase.snapshot();
    let servo_guard = servo.lock().unwrap();
    StreamContext {
        freq_bias_ppm: snapshot.freq_bias_ppm,
        phase_residual_ns: snapshot.phase_residual_ns,
        servo_output_ppm: servo_guard.last_output_ppm(),
        servo_enabled: servo_guard.enabled(),
        integ_error_s: servo_guard.integral_error_s(),
        locked: lock.is_locked(),
    }
}

/// Drains the ring into whichever writers are still alive. A write
/// failure on any single product degrades just that product — it is
/// dropped to `None` and its failure flag set — rather than aborting the
/// whole writer thread, per spec.md §7: "Log-subsystem IO errors are
/// recorded and cause the session to degrade gracefully: unsealed files
/// remain on disk and are marked unsealed in the manifest."
fn drain_once(
    params: &WriterParams,
    csv: &mut Option<CsvWriter>,
    event_log: &mut Option<EventLogWriter>,
    stream: &mut Option<EventStreamWriter>,
    csv_failed: &mut bool,
    stream_failed: &mut bool,
    event_log_failed: &mut bool,
) {
    while let Some(event) = params.ring.pop() {
        if let Some(w) = event_log.as_mut() {
            if let Err(err) = w.write_event(&event) {
                tracing::error!(error = %err, "event binary log write failed; disabling for remainder of session");
                *event_log = None;
                *event_log_failed = true;
            }
        }

        if let Some(w) = stream.as_mut() {
            let ctx = build_stream_context(&params.timebase, &params.servo, &params.lock);
            let record = classify(&event, &params.run_uuid, &ctx);
            if let Err(err) = w.write_record(&record) {
                tracing::error!(error = %err, "structured event stream write failed; disabling for remainder of session");
                *stream = None;
                *stream_failed = true;
            }
        }

        if event.kind == EventKind::PiStep {
            if let Some(w) = csv.as_mut() {
                let snapshot = params.timebase.snapshot();
                let servo_guard = params.servo.lock().unwrap();
                let adjust_guard = params.adjust.lock().unwrap();
                let row = CsvRow {
                    timestamp_ns: event.timestamp_ns,
                    base_rt_ns: snapshot.base_rt_ns,
                    base_mono_ns: snapshot.base_mono_ns,
                    freq_scaled_ppm: (snapshot.freq_bias_ppm * PPM_SCALE).round() as i64,
                    pi_freq_ppm: servo_guard.last_output_ppm(),
                    pi_int_error_s: servo_guard.integral_error_s(),
                    remaining_phase_ns: snapshot.phase_residual_ns,
                    pi_servo_enabled: servo_guard.enabled(),
                    maxerror: adjust_guard.maxerror_us(),
                    esterror: adjust_guard.esterror_us(),
                    constant: adjust_guard.timeconst(),
                    tick: DEFAULT_TICK_USEC,
                    tai: snapshot.tai_offset_s,
                };
                drop(servo_guard);
                drop(adjust_guard);
                if let Err(err) = w.write_row(row) {
                    tracing::error!(error = %err, "servo-state csv write failed; disabling for remainder of session");
                    *csv = None;
                    *csv_failed = true;
                }
            }
        }
    }
}

/// A running clock instance: the public surface of this crate.
pub struct Clock {
    state: Mutex<ClockState>,
    timebase: Arc<Timebase>,
    servo: Arc<Mutex<AnyServo>>,
    ring: Arc<EventRing>,
    adjust: Arc<Mutex<AdjustRouter>>,
    lock: Arc<LockTracker>,
    poll_loop: Mutex<Option<PollLoop>>,
    writer_running: Arc<AtomicBool>,
    writer_handle: Mutex<Option<JoinHandle<Result<WriterOutcome>>>>,
    finalizer: SessionFinalizer,
    config: ClockConfig,
    csv_meta_fixed: CsvMetaFixed,
}

impl Clock {
    /// `create()`, spec.md §4.K: allocates everything but starts no
    /// threads. The state machine starts in `Created`. Applies the
    /// environment toggles of spec.md §6 on top of `config` exactly
    /// once.
    pub fn create(config: ClockConfig) -> Result<Self> {
        let config = config.with_env_overrides();
        let now = now_ref_ns()?;
        let timebase = Arc::new(Timebase::new(now, config.tai_offset_s));
        let servo = Arc::new(Mutex::new(AnyServo::new(config.servo_kind)));
        let ring = Arc::new(EventRing::with_capacity(config.ring_capacity));
        let finalizer = SessionFinalizer::begin(config.servo_kind);
        let host = host_info();

        let csv_meta_fixed = CsvMetaFixed {
            test_name: config.test_name.clone(),
            servo_kind: match config.servo_kind {
                ServoKind::Pi => "pi",
                ServoKind::Ekf => "ekf",
            },
            started_at_rfc3339: finalizer.started_at_rfc3339.clone(),
            poll_ns: config.poll_ns,
            tai_offset_s: config.tai_offset_s,
            host: finalizer.hostname.clone(),
            kernel: host.kernel,
            arch: host.arch,
            cpu_count: finalizer.cpu_count,
        };

        ring.push(Event::new(now, EventKind::SessionCreated, &finalizer.run_uuid));
        tracing::info!(run_uuid = %finalizer.run_uuid, servo = ?config.servo_kind, "clock session created");

        Ok(Self {
            state: Mutex::new(ClockState::Created),
            timebase,
            servo,
            ring,
            adjust: Arc::new(Mutex::new(AdjustRouter::with_strict(config.strict_mode))),
            lock: Arc::new(LockTracker::new()),
            poll_loop: Mutex::new(None),
            writer_running: Arc::new(AtomicBool::new(false)),
            writer_handle: Mutex::new(None),
            finalizer,
            config,
            csv_meta_fixed,
        })
    }

    /// `start()`, spec.md §4.K: spawns the poll thread and the writer
    /// thread. Idempotent no-op if already `Running`.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state == ClockState::Running {
            return Ok(());
        }
        if *state == ClockState::Stopping || *state == ClockState::Destroyed {
            return Err(Error::NotRunning);
        }

        let poll_loop = PollLoop::spawn(
            Arc::clone(&self.timebase),
            Arc::clone(&self.servo),
            Arc::clone(&self.ring),
            Arc::clone(&self.lock),
            self.config.poll_ns,
        );
        *self.poll_loop.lock().unwrap() = Some(poll_loop);

        self.writer_running.store(true, Ordering::Release);
        let handle = self.spawn_writer();
        *self.writer_handle.lock().unwrap() = Some(handle);

        let now = now_ref_ns().unwrap_or(0);
        self.ring
            .push(Event::new(now, EventKind::SessionStarted, "started"));

        *state = ClockState::Running;
        tracing::info!(poll_ns = self.config.poll_ns, "clock started");
        Ok(())
    }

    fn writer_params(&self) -> WriterParams {
        WriterParams {
            ring: Arc::clone(&self.ring),
            timebase: Arc::clone(&self.timebase),
            servo: Arc::clone(&self.servo),
            adjust: Arc::clone(&self.adjust),
            lock: Arc::clone(&self.lock),
            csv_path: self.config.csv_path.clone(),
            event_bin_path: self.config.event_bin_path.clone(),
            stream_path: self.config.stream_path.clone(),
            run_uuid: self.finalizer.run_uuid.clone(),
            servo_log_enabled: self.config.servo_log_enabled,
            structured_log_enabled: self.config.structured_log_enabled,
            csv_meta_fixed: self.csv_meta_fixed.clone(),
            csv_max_size_mb: self.config.csv_max_size_mb,
        }
    }

    /// The rotated sibling path for `path`'s `index`-th rotation, e.g.
    /// `swclock.csv` -> `swclock.csv.1` (spec.md §4.H "rename with a
    /// rotation suffix").
    fn rotated_csv_path(path: &std::path::Path, index: u32) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// Seals `writer`, renames the sealed file aside, and opens a fresh
    /// `CsvWriter` at `csv_path` for the next rotation generation. Emits
    /// `ROTATE` into the ring so the event log/structured stream also
    /// record it.
    fn rotate_csv(
        writer: CsvWriter,
        csv_path: &std::path::Path,
        meta: &CsvMeta<'_>,
        rotation_index: &mut u32,
        ring: &EventRing,
    ) -> Result<(CsvWriter, ManifestFile)> {
        let sha256 = writer.finish()?;
        let bytes = std::fs::metadata(csv_path).map(|m| m.len()).unwrap_or(0);
        *rotation_index += 1;
        let rotated_path = Self::rotated_csv_path(csv_path, *rotation_index);
        std::fs::rename(csv_path, &rotated_path)?;

        let now = now_ref_ns().unwrap_or(0);
        ring.push(Event::with_detail(
            now,
            EventKind::Rotate,
            format_args!("rotated {} -> {}", csv_path.display(), rotated_path.display()),
        ));

        let manifest_file = ManifestFile {
            path: rotated_path,
            bytes,
            sha256,
            sealed: true,
        };
        let fresh = CsvWriter::create(csv_path, meta)?;
        Ok((fresh, manifest_file))
    }

    /// The writer thread body: opens the always-on event binary log plus
    /// whichever of the CSV/stream are enabled, drains the ring at a
    /// short fixed cadence until `running` flips (or, if it is already
    /// false on entry, just once), then seals everything. Shared between
    /// the real writer thread and `destroy()`'s never-started fallback.
    fn run_writer(params: WriterParams, running: Arc<AtomicBool>) -> Result<WriterOutcome> {
        let meta = CsvMeta {
            test_name: &params.csv_meta_fixed.test_name,
            run_uuid: &params.run_uuid,
            servo_kind: params.csv_meta_fixed.servo_kind,
            started_at_rfc3339: &params.csv_meta_fixed.started_at_rfc3339,
            kp_ppm_per_s: KP_PPM_PER_S,
            ki_ppm_per_s2: KI_PPM_PER_S2,
            max_ppm: MAX_PPM,
            poll_interval_ns: params.csv_meta_fixed.poll_ns,
            phase_epsilon_ns: PHASE_EPSILON_NS,
            tai_offset_s: params.csv_meta_fixed.tai_offset_s,
            host: &params.csv_meta_fixed.host,
            kernel: &params.csv_meta_fixed.kernel,
            arch: &params.csv_meta_fixed.arch,
            cpu_count: params.csv_meta_fixed.cpu_count,
        };

        let mut csv = params
            .servo_log_enabled
            .then(|| CsvWriter::create(&params.csv_path, &meta))
            .transpose()?;
        let mut event_log = Some(EventLogWriter::create(&params.event_bin_path)?);
        let mut stream = params
            .structured_log_enabled
            .then(|| EventStreamWriter::create(&params.stream_path))
            .transpose()?;

        let mut rotation_index = 0u32;
        let mut rotated_csv_files = Vec::new();
        let mut rows_before_current: u64 = 0;
        let mut csv_failed = false;
        let mut stream_failed = false;
        let mut event_log_failed = false;

        // A rotation failure (e.g. the rename hits a full disk) degrades
        // the same way a plain write failure does: the CSV product is
        // dropped for the remainder of the session rather than aborting
        // the writer thread.
        let mut maybe_rotate = |csv: &mut Option<CsvWriter>, csv_failed: &mut bool| {
            let needs_rotation = csv
                .as_ref()
                .is_some_and(|c| c.should_rotate(params.csv_max_size_mb));
            if !needs_rotation {
                return;
            }
            let writer = csv.take().expect("checked Some above");
            let rows = writer.rows_written();
            match Self::rotate_csv(writer, &params.csv_path, &meta, &mut rotation_index, &params.ring) {
                Ok((fresh, manifest_file)) => {
                    rows_before_current += rows;
                    *csv = Some(fresh);
                    rotated_csv_files.push(manifest_file);
                }
                Err(err) => {
                    tracing::error!(error = %err, "csv rotation failed; disabling servo-state csv for remainder of session");
                    rows_before_current += rows;
                    *csv_failed = true;
                }
            }
        };

        while running.load(Ordering::Acquire) {
            drain_once(
                &params,
                &mut csv,
                &mut event_log,
                &mut stream,
                &mut csv_failed,
                &mut stream_failed,
                &mut event_log_failed,
            );
            maybe_rotate(&mut csv, &mut csv_failed);
            thread::sleep(Duration::from_millis(5));
        }
        // Final drain after the stop flag flips, so nothing queued
        // between the last loop check and shutdown is lost.
        drain_once(
            &params,
            &mut csv,
            &mut event_log,
            &mut stream,
            &mut csv_failed,
            &mut stream_failed,
            &mut event_log_failed,
        );
        maybe_rotate(&mut csv, &mut csv_failed);

        let rows_written = rows_before_current + csv.as_ref().map(CsvWriter::rows_written).unwrap_or(0);
        let events_written = stream
            .as_ref()
            .map(EventStreamWriter::events_written)
            .unwrap_or(0);
        // Sealing can itself fail (the final flush hits a full disk); that
        // degrades the same product the same way a mid-session write
        // failure would, rather than failing `destroy()` outright.
        let stream_sha256 = match stream {
            Some(w) => match w.finish() {
                Ok(hash) => Some(hash),
                Err(err) => {
                    tracing::error!(error = %err, "failed to seal structured event stream");
                    stream_failed = true;
                    None
                }
            },
            None => None,
        };
        let csv_sha256 = match csv {
            Some(w) => match w.finish() {
                Ok(hash) => Some(hash),
                Err(err) => {
                    tracing::error!(error = %err, "failed to seal servo-state csv");
                    csv_failed = true;
                    None
                }
            },
            None => None,
        };
        let event_bin_sha256 = match event_log {
            Some(w) => match w.finish() {
                Ok(hash) => Some(hash),
                Err(err) => {
                    tracing::error!(error = %err, "failed to seal event binary log");
                    event_log_failed = true;
                    None
                }
            },
            None => None,
        };

        Ok(WriterOutcome {
            rows_written,
            events_written,
            csv_sha256,
            event_bin_sha256,
            stream_sha256,
            rotated_csv_files,
            csv_failed,
            stream_failed,
            event_log_failed,
        })
    }

    fn spawn_writer(&self) -> JoinHandle<Result<WriterOutcome>> {
        let params = self.writer_params();
        let running = Arc::clone(&self.writer_running);

        thread::Builder::new()
            .name("swclock-writer".into())
            .spawn(move || Self::run_writer(params, running))
            .expect("failed to spawn writer thread")
    }

    /// `stop()`, spec.md §4.K: stops disciplining but keeps artifacts
    /// open. Moves to `Stopping`.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != ClockState::Running {
            return Err(Error::NotRunning);
        }
        let now = now_ref_ns().unwrap_or(0);
        self.ring
            .push(Event::new(now, EventKind::SessionStopping, "stopping"));

        if let Some(poll_loop) = self.poll_loop.lock().unwrap().take() {
            poll_loop.stop();
        }

        *state = ClockState::Stopping;
        tracing::info!("clock stopped");
        Ok(())
    }

    /// `destroy()`, spec.md §4.K: joins the writer thread, seals every
    /// log file, and writes the session manifest. Terminal; further
    /// calls fail.
    pub fn destroy(self) -> Result<SessionManifest> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ClockState::Destroyed {
                return Err(Error::NotRunning);
            }
            if *state == ClockState::Running {
                if let Some(poll_loop) = self.poll_loop.lock().unwrap().take() {
                    poll_loop.stop();
                }
            }
            *state = ClockState::Destroyed;
        }

        let destroy_now = now_ref_ns().unwrap_or(0);
        {
            let mut servo = self.servo.lock().unwrap();
            if servo.enabled() {
                servo.disable();
                self.ring
                    .push(Event::new(destroy_now, EventKind::PiDisable, "servo disabled"));
            }
        }
        self.ring.push(Event::new(
            destroy_now,
            EventKind::SessionDestroyed,
            "destroyed",
        ));

        self.writer_running.store(false, Ordering::Release);
        let outcome = match self.writer_handle.lock().unwrap().take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Internal("writer thread panicked"))??,
            None => {
                // `destroy()` called before `start()`: run the writer
                // body synchronously (it is already told to not loop) so
                // the manifest still describes well-formed, sealed files.
                let params = self.writer_params();
                Self::run_writer(params, Arc::new(AtomicBool::new(false)))?
            }
        };

        // A file earns a manifest entry whenever it was ever opened: sealed
        // (with its hash) on the happy path, or unsealed (spec.md §7: "...
        // remain on disk and are marked unsealed in the manifest") when a
        // write or seal failure degraded it mid-session.
        let file_entry = |path: &PathBuf, sha256: Option<String>| -> ManifestFile {
            let bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            match sha256 {
                Some(sha256) => ManifestFile { path: path.clone(), bytes, sha256, sealed: true },
                None => ManifestFile { path: path.clone(), bytes, sha256: String::new(), sealed: false },
            }
        };

        let mut files = Vec::new();
        if self.config.servo_log_enabled {
            files.extend(outcome.rotated_csv_files);
            if outcome.csv_sha256.is_some() || outcome.csv_failed {
                files.push(file_entry(&self.config.csv_path, outcome.csv_sha256));
            }
        }
        if outcome.event_bin_sha256.is_some() || outcome.event_log_failed {
            files.push(file_entry(&self.config.event_bin_path, outcome.event_bin_sha256));
        }
        if self.config.structured_log_enabled {
            if outcome.stream_sha256.is_some() || outcome.stream_failed {
                files.push(file_entry(&self.config.stream_path, outcome.stream_sha256));
            }
        }

        let events_dropped = self.ring.dropped_count();
        if events_dropped > 0 {
            tracing::warn!(events_dropped, "event ring dropped events during session");
        }
        tracing::info!("clock destroyed");
        self.finalizer.finish(
            &self.config.manifest_path,
            self.config.servo_kind,
            files,
            outcome.rows_written,
            outcome.events_written,
            events_dropped,
        )
    }

    /// `gettime(clock_id)`, spec.md §4.B, exposed through the instance.
    pub fn gettime(&self, id: ClockId) -> Result<i64> {
        let now = now_ref_ns()?;
        Ok(self.timebase.gettime(id, now))
    }

    /// `adjust(request)`, spec.md §4.E, exposed through the instance.
    /// Brackets the call with `ADJTIME_CALL`/`ADJTIME_RETURN` events
    /// (spec.md §4.G) so the event stream can reconstruct call latency
    /// and distinguish a request from its applied effect.
    pub fn adjust(&self, request: &AdjustRequest) -> Result<AdjustReply> {
        if *self.state.lock().unwrap() != ClockState::Running {
            return Err(Error::NotRunning);
        }
        let now = now_ref_ns()?;
        self.ring.push(Event::with_detail(
            now,
            EventKind::AdjustCall,
            format_args!("{request:?}"),
        ));

        if request.modes.contains(Modes::FREQUENCY) {
            let mut servo = self.servo.lock().unwrap();
            if !servo.enabled() {
                servo.enable();
                self.ring
                    .push(Event::new(now, EventKind::PiEnable, "servo enabled"));
            }
        }

        let outcome = self
            .adjust
            .lock()
            .unwrap()
            .adjust(&self.timebase, request, now);

        let (reply, effects) = match outcome {
            Ok(v) => v,
            Err(err) => {
                self.ring.push(Event::with_detail(
                    now,
                    EventKind::Error,
                    format_args!("{err}"),
                ));
                return Err(err);
            }
        };
        if let Some(offset_s) = effects.slew_begun_s {
            self.servo.lock().unwrap().nudge_phase(offset_s);
            self.ring.push(Event::with_detail(
                now,
                EventKind::SlewBegin,
                format_args!("offset_s={offset_s}"),
            ));
        }
        if let Some((requested_ppm, applied_ppm)) = effects.freq_clamped {
            tracing::warn!(requested_ppm, applied_ppm, "adjust frequency request clamped");
            self.ring.push(Event::with_detail(
                now,
                EventKind::FrequencyClamp,
                format_args!("requested={requested_ppm:.3}ppm applied={applied_ppm:.3}ppm"),
            ));
        }
        self.ring.push(Event::with_detail(
            now,
            EventKind::AdjustReturn,
            format_args!("{reply:?}"),
        ));
        Ok(reply)
    }

    /// Frequency-multiplier convenience (SPEC_FULL.md §2): composes
    /// `delta_ppm` on top of whatever frequency bias is currently
    /// applied, rather than replacing it outright.
    pub fn adjust_frequency_multiplier(&self, delta_ppm: f64) -> Result<f64> {
        if *self.state.lock().unwrap() != ClockState::Running {
            return Err(Error::NotRunning);
        }
        let now = now_ref_ns()?;
        let current = self.timebase.frequency_ppm();
        Ok(self.timebase.set_frequency(current + delta_ppm, now))
    }

    pub fn state(&self) -> ClockState {
        *self.state.lock().unwrap()
    }

    pub fn servo_frequency_ppm(&self) -> f64 {
        self.timebase.frequency_ppm()
    }

    /// The inert-but-readable `STATUS` bits last written via `adjust`
    /// (spec.md §4.E).
    pub fn status(&self) -> Status {
        self.adjust.lock().unwrap().status()
    }

    /// Whether the clock-wide phase error has stayed within
    /// `PHASE_EPSILON_NS` for enough consecutive poll ticks to call the
    /// clock locked (SPEC_FULL.md §2).
    pub fn locked(&self) -> bool {
        self.lock.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> ClockConfig {
        ClockConfig {
            csv_path: dir.join("run.csv"),
            event_bin_path: dir.join("run.events.bin"),
            stream_path: dir.join("run.jsonl"),
            manifest_path: dir.join("run.manifest.json"),
            poll_ns: 1_000_000,
            ..ClockConfig::default()
        }
    }

    #[test]
    fn lifecycle_create_start_stop_destroy() {
        let dir = tempdir().unwrap();
        let clock = Clock::create(config_in(dir.path())).unwrap();
        assert_eq!(clock.state(), ClockState::Created);

        clock.start().unwrap();
        assert_eq!(clock.state(), ClockState::Running);
        thread::sleep(Duration::from_millis(20));

        clock.stop().unwrap();
        assert_eq!(clock.state(), ClockState::Stopping);

        let manifest = clock.destroy().unwrap();
        assert!(manifest.rows_written > 0 || manifest.events_written > 0);
        assert!(csv::verify_seal(dir.path().join("run.csv")).unwrap());
        assert!(manifest.files.iter().any(|f| f.path.ends_with("run.events.bin")));
    }

    #[test]
    fn adjust_before_start_is_rejected() {
        let dir = tempdir().unwrap();
        let clock = Clock::create(config_in(dir.path())).unwrap();
        let req = AdjustRequest::default();
        assert!(clock.adjust(&req).is_err());
        clock.destroy().unwrap();
    }

    #[test]
    fn csv_rotation_seals_renames_and_reopens_at_the_original_path() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("run.csv");
        let meta = CsvMeta {
            test_name: "rotation-test",
            run_uuid: "run-rotate",
            servo_kind: "pi",
            started_at_rfc3339: "2026-01-01T00:00:00Z",
            kp_ppm_per_s: KP_PPM_PER_S,
            ki_ppm_per_s2: KI_PPM_PER_S2,
            max_ppm: MAX_PPM,
            poll_interval_ns: POLL_NS,
            phase_epsilon_ns: PHASE_EPSILON_NS,
            tai_offset_s: TAI_DEFAULT_S,
            host: "test-host",
            kernel: "test-kernel",
            arch: "x86_64",
            cpu_count: 1,
        };

        let mut writer = CsvWriter::create(&csv_path, &meta).unwrap();
        writer
            .write_row(CsvRow {
                timestamp_ns: 1,
                base_rt_ns: 2,
                base_mono_ns: 3,
                freq_scaled_ppm: 0,
                pi_freq_ppm: 0.0,
                pi_int_error_s: 0.0,
                remaining_phase_ns: 0,
                pi_servo_enabled: false,
                maxerror: 0,
                esterror: 0,
                constant: 0,
                tick: DEFAULT_TICK_USEC,
                tai: 37,
            })
            .unwrap();
        let rows_before_rotation = writer.rows_written();

        let ring = EventRing::with_capacity(8);
        let mut rotation_index = 0u32;
        let (fresh, manifest_file) =
            Clock::rotate_csv(writer, &csv_path, &meta, &mut rotation_index, &ring).unwrap();

        assert_eq!(rotation_index, 1);
        assert!(manifest_file.path.ends_with("run.csv.1"));
        assert!(manifest_file.sealed);
        assert!(csv::verify_seal(&manifest_file.path).unwrap());
        // The original path is free again for the fresh writer.
        assert!(csv_path.exists());
        assert_eq!(fresh.rows_written(), 0);
        assert_eq!(rows_before_rotation, 1);

        let rotate_event = ring.pop().expect("rotation pushes a ROTATE event");
        assert_eq!(rotate_event.kind, EventKind::Rotate);
    }

    #[test]
    fn destroy_without_start_still_produces_valid_manifest() {
        let dir = tempdir().unwrap();
        let clock = Clock::create(config_in(dir.path())).unwrap();
        let manifest = clock.destroy().unwrap();
        assert_eq!(manifest.rows_written, 0);
        // The always-on event binary log is still sealed even if the
        // poll loop never ran.
        assert_eq!(manifest.files.len(), 3);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn a_failing_log_write_degrades_that_product_instead_of_failing_destroy() {
        // `/dev/full` opens fine but fails every write with ENOSPC, so the
        // structured stream degrades on its first record while the CSV
        // and event-binary-log products keep sealing normally. Before the
        // graceful-degradation fix this made `destroy()` itself return
        // `Err`, discarding the manifest entirely (spec.md §7).
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.stream_path = PathBuf::from("/dev/full");
        config.poll_ns = 1_000_000;
        let clock = Clock::create(config).unwrap();
        clock.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        clock.stop().unwrap();

        let manifest = clock.destroy().expect("destroy must degrade, not fail");
        let stream_entry = manifest
            .files
            .iter()
            .find(|f| f.path == std::path::Path::new("/dev/full"))
            .expect("degraded stream still gets a manifest entry");
        assert!(!stream_entry.sealed);
        assert!(stream_entry.sha256.is_empty());

        assert!(manifest.files.iter().any(|f| f.path.ends_with("run.csv") && f.sealed));
        assert!(manifest
            .files
            .iter()
            .any(|f| f.path.ends_with("run.events.bin") && f.sealed));
    }

    #[test]
    fn disabled_logs_are_omitted_from_the_manifest() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.servo_log_enabled = false;
        config.structured_log_enabled = false;
        let clock = Clock::create(config).unwrap();
        let manifest = clock.destroy().unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert!(manifest.files[0].path.ends_with("run.events.bin"));
    }
}
