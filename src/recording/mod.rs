//! Offline decoding of recordings written to the device's SD card.
//!
//! [`format`] describes the fixed binary layout, [`Recording`] loads a whole
//! file into equal-length channel columns with timestamps rebased onto the
//! boot clock and, for synchronized trials, aligned to the master clock.

pub mod format;
pub mod reader;

pub use format::RecordingHeader;
pub use reader::{Recording, SyncAnchor, align_timestamp};
