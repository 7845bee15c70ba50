pub mod controller;
pub mod devices;
pub mod track;

pub use controller::{LocalMediaState, MediaController, MediaEvent};
pub use devices::MediaDevices;
pub use track::{LocalStream, LocalTrack, MediaKind, TrackSource, TrackState};
