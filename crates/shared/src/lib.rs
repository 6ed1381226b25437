//! # Shared
//! The components shared by the backup crates.
//!

#![warn(missing_docs)]

mod cadence;
mod cancellation;
mod clock;
mod logger;
mod path_segment;

pub use cadence::Cadence;
pub use cancellation::{CancellationToken, Cancelled, CheckCancelled};
pub use clock::{Clock, SystemClock};
pub use logger::{LogConfig, LoggerError, init_logger};
pub use path_segment::{PathSegment, PathSegmentError};
