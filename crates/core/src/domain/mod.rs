pub mod error;
pub mod key;
pub mod media;
pub mod settings;
pub mod state;
pub mod step;
