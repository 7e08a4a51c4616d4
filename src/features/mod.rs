pub mod access_log;
pub mod filters;
pub mod geo_cache;

pub use filters::{CallerPreferences, FilterInfo, ResultFilter};
pub use geo_cache::{GeoCache, GeoInfo};
