//! Audio capture and playback via cpal, and the frame types that flow
//! through the pipeline.

pub mod capture;
pub mod playback;

pub use capture::{CpalFrameSource, downsample, to_mono};
pub use playback::CpalPlayback;

use std::time::Instant;

use crate::error::Result;

/// Frame length used throughout the pipeline, in milliseconds.
pub const FRAME_MS: u32 = 30;

/// One fixed-duration chunk of mono PCM from the input device.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Mono samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the chunk left the capture callback.
    pub captured_at: Instant,
}

/// Samples per frame at the given rate.
#[must_use]
pub fn frame_samples(sample_rate: u32) -> usize {
    (sample_rate as usize * FRAME_MS as usize) / 1000
}

/// A blocking source of capture frames.
///
/// `next_frame` parks the calling thread until a full frame is available,
/// so a consumer that does nothing but call it in a loop drains the device
/// at capture rate.
pub trait FrameSource: Send {
    /// Block until the next frame arrives.
    ///
    /// # Errors
    ///
    /// Returns `DeviceLost` when the input device disappears mid-stream.
    fn next_frame(&mut self) -> Result<Frame>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn frame_samples_match_rate() {
        assert_eq!(frame_samples(16_000), 480);
        assert_eq!(frame_samples(8000), 240);
        assert_eq!(frame_samples(48_000), 1440);
    }
}
