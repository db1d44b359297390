//! The background worker driving jobs through analysis, one at a time.

pub mod processor;

pub use processor::Processor;
