pub mod automation;
pub mod block_policy;
pub mod browser_manager;
pub mod extract;
pub mod occupancy;
pub mod opening_hours;
pub mod resource_pool;

pub use automation::{Automation, PageHandle, Session};
pub use resource_pool::{PageLease, ResourcePool};
