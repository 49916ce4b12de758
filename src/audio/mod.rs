//! Audio capture and playback via `cpal`.

pub mod capture;
pub mod playback;
