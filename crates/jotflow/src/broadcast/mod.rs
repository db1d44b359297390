//! Broadcasting module for real-time job lifecycle events.
//!
//! The presentation layer (indicator badge, dropdown, review screen)
//! subscribes here; it receives read-only snapshots and never mutates
//! records directly.

pub mod job_events;

pub use job_events::{JobEvent, JobEventBroadcaster};
