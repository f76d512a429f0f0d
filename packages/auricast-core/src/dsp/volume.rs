//! Gain staging: smoothed volume, target-RMS normalization, and the delay
//! line.
//!
//! Volume changes are slewed through a one-pole filter so a parameter update
//! between chunks cannot produce a single-sample jump (zipper noise). The
//! AGC runs per chunk with separate attack/decay smoothing and is disabled by
//! default.

/// Gain error below which the smoother snaps to its target and reports
/// settled.
const SETTLE_EPSILON: f32 = 1e-4;

/// One-pole smoothed gain.
pub struct VolumeSmoother {
    current: f32,
    target: f32,
    /// Per-sample smoothing coefficient.
    alpha: f32,
}

impl VolumeSmoother {
    pub fn new(initial: f32, alpha: f32) -> Self {
        Self {
            current: initial,
            target: initial,
            alpha,
        }
    }

    /// Sets the target gain; the output ramps toward it over the following
    /// samples.
    pub fn set_target(&mut self, target: f32) {
        self.target = target.max(0.0);
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// True when the gain has reached its target exactly.
    pub fn is_settled(&self) -> bool {
        self.current == self.target
    }

    /// Applies the gain ramp to interleaved samples in place.
    ///
    /// The ramp advances once per frame, not per sample, so all channels of
    /// one frame see the same gain.
    pub fn process_interleaved(&mut self, samples: &mut [f32], channels: usize) {
        if self.is_settled() && self.current == 1.0 {
            return;
        }
        for frame in samples.chunks_exact_mut(channels) {
            if self.current != self.target {
                self.current += self.alpha * (self.target - self.current);
                if (self.current - self.target).abs() < SETTLE_EPSILON {
                    self.current = self.target;
                }
            }
            for sample in frame {
                *sample *= self.current;
            }
        }
    }
}

/// Target-RMS automatic gain control.
///
/// Gain reductions (attack) track faster than gain recovery (decay) so a
/// sudden loud passage is caught quickly without pumping on the way back up.
pub struct AgcNormalizer {
    enabled: bool,
    target_rms: f32,
    attack_alpha: f32,
    decay_alpha: f32,
    gain: f32,
}

/// Bounds on the AGC gain to keep silence from winding the gain to the moon.
const AGC_GAIN_MIN: f32 = 0.1;
const AGC_GAIN_MAX: f32 = 8.0;

/// RMS below this is treated as silence: the AGC holds its gain.
const AGC_SILENCE_FLOOR: f32 = 1e-4;

impl AgcNormalizer {
    pub fn new(target_rms: f32) -> Self {
        Self {
            enabled: false,
            target_rms,
            attack_alpha: 0.5,
            decay_alpha: 0.05,
            gain: 1.0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            self.gain = 1.0;
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Applies AGC to one chunk in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled || samples.is_empty() {
            return;
        }

        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        if rms > AGC_SILENCE_FLOOR {
            let desired = (self.target_rms / rms).clamp(AGC_GAIN_MIN, AGC_GAIN_MAX);
            let alpha = if desired < self.gain {
                self.attack_alpha
            } else {
                self.decay_alpha
            };
            self.gain += alpha * (desired - self.gain);
        }

        for sample in samples {
            *sample *= self.gain;
        }
    }
}

/// Fixed-delay circular buffer, interleaved.
pub struct DelayLine {
    buffer: Vec<f32>,
    write_pos: usize,
}

impl DelayLine {
    /// A delay of `delay_frames` frames across `channels` channels.
    /// `delay_frames == 0` yields a transparent line.
    pub fn new(delay_frames: usize, channels: usize) -> Self {
        Self {
            buffer: vec![0.0; delay_frames * channels],
            write_pos: 0,
        }
    }

    pub fn is_transparent(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Runs samples through the delay in place: each sample is exchanged
    /// with the one written `delay_frames` ago.
    pub fn process(&mut self, samples: &mut [f32]) {
        if self.buffer.is_empty() {
            return;
        }
        for sample in samples {
            let delayed = self.buffer[self.write_pos];
            self.buffer[self.write_pos] = *sample;
            *sample = delayed;
            self.write_pos = (self.write_pos + 1) % self.buffer.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_ramps_monotonically_without_jumps() {
        let mut vol = VolumeSmoother::new(0.0, 0.02);
        vol.set_target(1.0);

        let mut samples = vec![1.0f32; 2 * 512];
        vol.process_interleaved(&mut samples, 2);

        // Envelope (every other sample = left channel) never decreases and
        // never jumps more than alpha of peak input
        let mut prev = 0.0f32;
        for pair in samples.chunks_exact(2) {
            assert!(pair[0] >= prev - 1e-6, "envelope must be non-decreasing");
            assert!(pair[0] - prev <= 0.02 + 1e-6, "jump exceeds smoothing bound");
            assert_eq!(pair[0], pair[1], "both channels share the frame gain");
            prev = pair[0];
        }
    }

    #[test]
    fn settled_unity_volume_is_transparent() {
        let mut vol = VolumeSmoother::new(1.0, 0.02);
        let mut samples = vec![0.123f32, -0.456];
        vol.process_interleaved(&mut samples, 2);
        assert_eq!(samples, vec![0.123, -0.456]);
    }

    #[test]
    fn delay_line_shifts_by_exact_frames() {
        let mut delay = DelayLine::new(2, 1);
        let mut samples = vec![1.0, 2.0, 3.0, 4.0];
        delay.process(&mut samples);
        assert_eq!(samples, vec![0.0, 0.0, 1.0, 2.0]);

        let mut next = vec![5.0, 6.0];
        delay.process(&mut next);
        assert_eq!(next, vec![3.0, 4.0]);
    }

    #[test]
    fn agc_pulls_level_toward_target() {
        let mut agc = AgcNormalizer::new(0.25);
        agc.set_enabled(true);

        // Quiet signal at RMS 0.05: gain should rise over successive chunks
        for _ in 0..100 {
            let mut chunk = vec![0.05f32; 256];
            agc.process(&mut chunk);
        }
        let mut chunk = vec![0.05f32; 256];
        agc.process(&mut chunk);
        let rms = (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt();
        assert!(rms > 0.15, "rms after agc = {rms}");
    }

    #[test]
    fn agc_holds_gain_through_silence() {
        let mut agc = AgcNormalizer::new(0.25);
        agc.set_enabled(true);
        let mut chunk = vec![0.5f32; 256];
        agc.process(&mut chunk);
        let gain_before = agc.gain;

        let mut silence = vec![0.0f32; 256];
        agc.process(&mut silence);
        assert_eq!(agc.gain, gain_before);
    }
}
