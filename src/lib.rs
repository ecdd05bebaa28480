//! Timeline Harvester - social timeline crawl and reply thread reconstruction
//!
//! The engine is fed by a host-provided page observer, accepts posts through a
//! resume gate, dedup and translation deferral, stops itself when the page is
//! exhausted and rebuilds reply threads from the flat DOM stream.

#![allow(clippy::uninlined_format_args)]

// Module declarations
pub mod crawling;
pub mod domain;
pub mod infrastructure;

pub use crawling::{
    EngineParts, EngineStart, HarvestEngine, HarvestEngineHandle, HarvestSink, Navigator, PageObserver, TickReport,
};
pub use domain::{FinalizedOutput, ObservedPost, OutputRow, PostId, RunStatus, StopReason};
pub use infrastructure::{ConfigManager, HarvestConfig};
