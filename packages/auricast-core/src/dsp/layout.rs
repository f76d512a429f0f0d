//! Speaker-layout remapping.
//!
//! A remap is a plain mixing matrix, rows = output channels, columns = input
//! channels. Paths either supply an explicit matrix per input channel count
//! or ask for `auto_mode`, which resolves against the fixed mapping table
//! below. The table is deliberately static; the engine never infers layouts
//! from the opaque channel-layout bytes.
//!
//! Fixed auto table:
//! - equal counts -> identity
//! - mono -> N: duplicated into front left/right
//! - stereo -> mono: averaged
//! - 5.1 / 7.1 -> stereo: ITU-style downmix (centre and surrounds at -3 dB,
//!   LFE discarded), scaled to keep unity headroom
//! - anything else -> identity over the first `min(in, out)` channels

/// -3 dB pan law coefficient used in the downmix rows.
const MINUS_3DB: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Returns the identity matrix for `channels`.
pub fn identity_matrix(channels: usize) -> Vec<Vec<f32>> {
    (0..channels)
        .map(|o| (0..channels).map(|i| if i == o { 1.0 } else { 0.0 }).collect())
        .collect()
}

/// True when `matrix` is square identity (within float noise).
pub fn is_identity(matrix: &[Vec<f32>]) -> bool {
    matrix.iter().enumerate().all(|(o, row)| {
        row.len() == matrix.len()
            && row
                .iter()
                .enumerate()
                .all(|(i, &v)| (v - if i == o { 1.0 } else { 0.0 }).abs() < 1e-6)
    })
}

/// The fixed auto-mode mapping table.
pub fn default_matrix(input_channels: usize, output_channels: usize) -> Vec<Vec<f32>> {
    if input_channels == output_channels {
        return identity_matrix(input_channels);
    }

    match (input_channels, output_channels) {
        // Mono duplicated into the front pair; additional outputs silent
        (1, out) => (0..out).map(|o| vec![if o < 2 { 1.0 } else { 0.0 }]).collect(),

        // Stereo averaged down to mono
        (2, 1) => vec![vec![0.5, 0.5]],

        // 5.1 (FL FR C LFE SL SR) -> stereo, ITU-style
        (6, 2) => {
            let scale = 1.0 / (1.0 + 2.0 * MINUS_3DB);
            vec![
                vec![scale, 0.0, MINUS_3DB * scale, 0.0, MINUS_3DB * scale, 0.0],
                vec![0.0, scale, MINUS_3DB * scale, 0.0, 0.0, MINUS_3DB * scale],
            ]
        }

        // 7.1 (FL FR C LFE SL SR RL RR) -> stereo
        (8, 2) => {
            let scale = 1.0 / (1.0 + 3.0 * MINUS_3DB);
            vec![
                vec![
                    scale,
                    0.0,
                    MINUS_3DB * scale,
                    0.0,
                    MINUS_3DB * scale,
                    0.0,
                    MINUS_3DB * scale,
                    0.0,
                ],
                vec![
                    0.0,
                    scale,
                    MINUS_3DB * scale,
                    0.0,
                    0.0,
                    MINUS_3DB * scale,
                    0.0,
                    MINUS_3DB * scale,
                ],
            ]
        }

        // Fallback: pass the first min(in, out) channels through
        (inp, out) => (0..out)
            .map(|o| (0..inp).map(|i| if i == o { 1.0 } else { 0.0 }).collect())
            .collect(),
    }
}

/// Resolves the matrix a path applies for `input_channels`, honoring
/// `auto_mode` and validating explicit matrix dimensions.
pub fn resolve_matrix(
    layout: Option<&crate::state::SpeakerLayout>,
    input_channels: usize,
    output_channels: usize,
) -> Vec<Vec<f32>> {
    match layout {
        Some(layout) if !layout.auto_mode => {
            let valid = layout.matrix.len() == output_channels
                && layout.matrix.iter().all(|row| row.len() == input_channels);
            if valid {
                layout.matrix.clone()
            } else {
                log::warn!(
                    "[Layout] Explicit matrix is {}x{} but path needs {}x{}; using auto table",
                    layout.matrix.len(),
                    layout.matrix.first().map_or(0, Vec::len),
                    output_channels,
                    input_channels
                );
                default_matrix(input_channels, output_channels)
            }
        }
        _ => default_matrix(input_channels, output_channels),
    }
}

/// Applies `matrix` to interleaved input, producing interleaved output.
pub fn apply_matrix(
    matrix: &[Vec<f32>],
    input: &[f32],
    input_channels: usize,
    output: &mut Vec<f32>,
) {
    let output_channels = matrix.len();
    let frames = input.len() / input_channels;
    output.clear();
    output.reserve(frames * output_channels);

    for frame in input.chunks_exact(input_channels) {
        for row in matrix {
            let mut acc = 0.0f32;
            for (coef, sample) in row.iter().zip(frame.iter()) {
                acc += coef * sample;
            }
            output.push(acc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SpeakerLayout;

    #[test]
    fn equal_counts_are_identity() {
        let m = default_matrix(2, 2);
        assert!(is_identity(&m));
    }

    #[test]
    fn mono_duplicates_to_front_pair() {
        let m = default_matrix(1, 2);
        let mut out = Vec::new();
        apply_matrix(&m, &[0.5, -0.25], 1, &mut out);
        assert_eq!(out, vec![0.5, 0.5, -0.25, -0.25]);
    }

    #[test]
    fn five_one_downmix_keeps_headroom() {
        let m = default_matrix(6, 2);
        // Full-scale on every contributing channel must not exceed 1.0
        let mut out = Vec::new();
        apply_matrix(&m, &[1.0; 6], 6, &mut out);
        assert!(out.iter().all(|s| *s <= 1.0 + 1e-6));
        // LFE (index 3) contributes nothing
        assert!(m.iter().all(|row| row[3] == 0.0));
    }

    #[test]
    fn explicit_matrix_wins_over_auto() {
        let layout = SpeakerLayout {
            auto_mode: false,
            matrix: vec![vec![0.0, 1.0], vec![1.0, 0.0]],
        };
        let m = resolve_matrix(Some(&layout), 2, 2);
        let mut out = Vec::new();
        apply_matrix(&m, &[0.1, 0.9], 2, &mut out);
        assert_eq!(out, vec![0.9, 0.1]);
    }

    #[test]
    fn bad_explicit_dimensions_fall_back_to_auto() {
        let layout = SpeakerLayout {
            auto_mode: false,
            matrix: vec![vec![1.0]],
        };
        let m = resolve_matrix(Some(&layout), 2, 2);
        assert!(is_identity(&m));
    }
}
