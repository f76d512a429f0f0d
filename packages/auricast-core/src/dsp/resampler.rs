//! Streaming sample-rate conversion.
//!
//! Wraps a polyphase sinc resampler behind a block accumulator: rubato wants
//! fixed-size input blocks, the pipeline delivers whatever chunk the source
//! sent. Input is accumulated per channel and fed through in whole blocks;
//! the remainder carries over to the next call, so steady-state output length
//! tracks `input_frames × ratio` within one block of latency.

use rubato::{Resampler, SincFixedIn, WindowFunction};

use crate::error::{RouteError, RouteResult};

/// Source frames fed to the resampler per `process()` call.
///
/// Tradeoff: larger blocks = better throughput; smaller blocks = lower
/// latency. One Scream chunk at 48 kHz stereo is 288 frames, so 256 keeps
/// per-chunk latency under two chunks.
const INPUT_BLOCK_FRAMES: usize = 256;

pub struct StreamResampler {
    inner: SincFixedIn<f32>,
    channels: usize,
    /// Per-channel accumulation of not-yet-resampled input.
    pending: Vec<Vec<f32>>,
    /// Scratch block handed to rubato.
    block: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// Creates a converter from `input_rate` to `output_rate`.
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> RouteResult<Self> {
        let inner = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            2.0,
            rubato::SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: rubato::SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            },
            INPUT_BLOCK_FRAMES,
            channels,
        )
        .map_err(|e| RouteError::Internal(format!("resampler init failed: {e}")))?;

        Ok(Self {
            inner,
            channels,
            pending: vec![Vec::new(); channels],
            block: vec![vec![0.0; INPUT_BLOCK_FRAMES]; channels],
        })
    }

    /// Pushes interleaved input and appends whatever output is ready,
    /// interleaved, to `out`.
    pub fn process(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> RouteResult<()> {
        // Deinterleave into the per-channel accumulators
        for frame in interleaved.chunks_exact(self.channels) {
            for (ch, sample) in frame.iter().enumerate() {
                self.pending[ch].push(*sample);
            }
        }

        let in_frames = self.inner.input_frames_max();
        while self.pending[0].len() >= in_frames {
            for ch in 0..self.channels {
                self.block[ch].clear();
                self.block[ch].extend(self.pending[ch].drain(..in_frames));
            }

            let output = self
                .inner
                .process(&self.block, None)
                .map_err(|e| RouteError::Internal(format!("resampler process failed: {e}")))?;

            let out_frames = output[0].len();
            out.reserve(out_frames * self.channels);
            for f in 0..out_frames {
                for channel in output.iter() {
                    out.push(channel[f]);
                }
            }
        }
        Ok(())
    }

    /// Frames currently buffered waiting for a full input block.
    pub fn pending_frames(&self) -> usize {
        self.pending[0].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_tracks_ratio() {
        let mut rs = StreamResampler::new(48000, 24000, 2).unwrap();
        let mut out = Vec::new();

        // Feed 4800 stereo frames of a sine in ~chunk-sized pieces
        let input: Vec<f32> = (0..4800)
            .flat_map(|n| {
                let s = (2.0 * std::f32::consts::PI * 440.0 * n as f32 / 48000.0).sin() * 0.5;
                [s, s]
            })
            .collect();
        for piece in input.chunks(288 * 2) {
            rs.process(piece, &mut out).unwrap();
        }

        // 2:1 downsample: expect ~2400 frames, allow one block of latency
        let out_frames = out.len() / 2;
        assert!(
            (out_frames as i64 - 2400).unsigned_abs() as usize <= INPUT_BLOCK_FRAMES,
            "got {out_frames} frames"
        );
    }

    #[test]
    fn remainder_carries_between_calls() {
        let mut rs = StreamResampler::new(44100, 48000, 1).unwrap();
        let mut out = Vec::new();

        // A sub-block push produces no output yet but is not lost
        rs.process(&[0.1; 100], &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(rs.pending_frames(), 100);

        rs.process(&[0.1; INPUT_BLOCK_FRAMES], &mut out).unwrap();
        assert!(!out.is_empty());
        assert_eq!(rs.pending_frames(), 100);
    }
}
