//! # drift-detector
//!
//! FastTrack happens-before data race detection.
//!
//! The instrumentation layer reports every monitored event through a
//! [`RaceDetector`]: thread fork/join, lock acquire/release, one-shot ordering
//! arcs, memory accesses, call/return and heap allocation. Each thread carries
//! a vector clock; each accessed location carries the epochs of its last
//! unordered accesses. An access that is not ordered after a conflicting
//! earlier one is handed to the race callback together with both call stacks.
//!
//! ```ignore
//! use drift_config::Config;
//! use drift_detector::RaceDetector;
//!
//! let detector = RaceDetector::new(&Config::default(), |race| {
//!     eprintln!("{:?} race at {:#x}", race.kind, race.current.address);
//! });
//! let main = detector.fork(0, 1)?;
//! let worker = detector.fork(1, 2)?;
//! detector.write(&main, 0x400000, 0x1000, 8);
//! detector.read(&worker, 0x400010, 0x1000, 8); // reported: unordered
//! ```

pub mod engine;
pub mod epoch;
pub mod error;
mod eviction;
pub mod report;
pub mod stack_depot;
pub mod stats;
pub mod sync;
pub mod thread_state;
pub mod var_state;
pub mod var_table;
pub mod vector_clock;

pub use engine::RaceDetector;
pub use epoch::{Epoch, ThreadId, ThreadNumber};
pub use error::{DetectorError, Result};
pub use report::{AccessEntry, Race, RaceCallback, MAX_STACK_DEPTH};
pub use stats::StatsSnapshot;
pub use thread_state::{ThreadHandle, ThreadState};
pub use var_state::RaceKind;
pub use vector_clock::VectorClock;
