pub mod core;
pub mod features;
pub mod pipeline;
pub mod scraping;
pub mod server;
pub mod storage;

// --- Primary core exports ---
pub use core::error::ScrapeError;
pub use core::types;
pub use core::types::*;
pub use core::AppState;

pub use pipeline::Orchestrator;
pub use scraping::browser_manager::ChromiumAutomation;
pub use storage::{ArtifactStore, OccupancyStore};
