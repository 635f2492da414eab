pub mod clock;
#[cfg(feature = "device-output")]
pub mod device;
pub mod wav;

pub use clock::ClockMediaPlayer;
#[cfg(feature = "device-output")]
pub use device::DeviceMediaPlayer;
