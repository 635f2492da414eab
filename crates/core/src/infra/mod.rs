pub mod cache;
pub mod media;
pub mod metrics;
pub mod source;
pub mod timer;
