mod duration;
mod inflight;
mod media_cache;

pub use duration::DurationResolver;
pub use inflight::{InflightCache, Lookup};
pub use media_cache::MediaCache;
