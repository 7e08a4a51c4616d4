pub mod artifacts;
pub mod occupancy_store;

pub use artifacts::{import_artifact, ArtifactStore, ImportReport};
pub use occupancy_store::{LocationHistory, OccupancyStore};
