mod http;
mod memory;

pub use http::HttpAudioSource;
pub use memory::StaticAudioSource;
