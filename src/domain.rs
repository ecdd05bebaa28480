//! Domain module - post identity, page context and output records
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod events;
pub mod output;
pub mod page;
pub mod post;
pub mod search_range;

// Re-export commonly used items for convenience
pub use events::{RunStatus, StopReason};
pub use output::{FinalizedOutput, OutputRow, Pairing};
pub use page::{handle_to_export_key, PageMode, RunContext};
pub use post::{extract_rest_id, normalize_status_url, ObservedPost, PostId, PostSideData, DEFAULT_ORIGIN};
pub use search_range::{shifted_search_url, SearchDateRange, SearchRangeError, ShiftDirection};
