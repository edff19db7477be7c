//! A user-space software-disciplined clock.
//!
//! This crate synthesizes a realtime and monotonic timebase from a
//! hardware reference clock plus a frequency bias and an in-progress
//! phase slew ([`timebase`]), disciplines that bias with a choice of a
//! PI or EKF servo ([`servo`]), and exposes a `timex`-compatible
//! adjustment surface ([`adjust`]) on top. Every run is logged: a
//! lock-free event ring feeds a writer thread that maintains a
//! SHA-256-sealed CSV of servo state and a JSON-lines event stream,
//! finalized into a manifest when the clock is destroyed ([`log`]).
//!
//! ```no_run
//! use swclock::{Clock, ClockConfig, ClockId};
//!
//! let clock = Clock::create(ClockConfig::default())?;
//! clock.start()?;
//! let now_ns = clock.gettime(ClockId::Realtime)?;
//! clock.stop()?;
//! let manifest = clock.destroy()?;
//! println!("wrote {} rows across {} sealed files", manifest.rows_written, manifest.files.len());
//! # Ok::<(), swclock::Error>(())
//! ```

pub mod adjust;
pub mod clock;
pub mod consts;
pub mod error;
pub mod log;
pub mod poll;
pub mod reference;
pub mod servo;
pub mod timebase;

pub use adjust::{AdjustReply, AdjustRequest, Modes, Status};
pub use clock::{Clock, ClockConfig, ClockState};
pub use error::{Error, Result};
pub use log::{ManifestFile, SessionManifest};
pub use servo::ServoKind;
pub use timebase::ClockId;
