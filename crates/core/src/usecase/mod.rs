pub mod sequencer;
pub mod state_store;

pub use sequencer::{SessionChange, Sequencer};
pub use state_store::StateStore;
