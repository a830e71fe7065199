//! Engine module: control side of the tone engine.
//!
//! `backend` hides the platform audio APIs behind trait objects,
//! `controller` owns the stream lifecycle, `restart` recovers from device
//! loss, and `playback` ties them together into [`PlaybackEngine`].

pub mod backend;
pub mod controller;
pub mod playback;
pub mod restart;

#[cfg(target_os = "android")]
pub use backend::OboeBackend;
#[cfg(not(target_os = "android"))]
pub use backend::CpalBackend;
pub use backend::{
    AudioPlatform, PlatformStream, SimulatedBackend, SimulatedControls, StreamInfo, StreamRequest,
};
pub use controller::{RestartOutcome, StreamController};
pub use playback::PlaybackEngine;
pub use restart::{NotificationReport, RestartGuard, RestartRequest, RestartSignal};
