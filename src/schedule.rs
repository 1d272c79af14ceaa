//! Timestep schedule for flow-matching inference.
//!
//! The schedule runs from 1.0 (pure noise) down to 0.0 (clean image) over
//! `num_steps + 1` points. For the guidance-distilled variant the uniform
//! spacing is reshaped by an exponential time shift whose strength grows with
//! the latent token count, so larger images spend more steps at high noise
//! levels. These functions are pure and reproducible bit for bit; the tests
//! pin exact sequence values.

/// Sequence length at which the shift bottoms out at [`BASE_SHIFT`].
const BASE_IMAGE_SEQ_LEN: usize = 256;
/// Sequence length at which the shift tops out at [`MAX_SHIFT`].
const MAX_IMAGE_SEQ_LEN: usize = 4096;
const BASE_SHIFT: f64 = 0.5;
const MAX_SHIFT: f64 = 1.15;

/// Exponential time shift: maps a uniform timestep to a shifted one.
///
/// Endpoints are fixed points, interior values are pulled towards 1.0 for
/// positive `mu`.
pub fn time_shift(mu: f64, t: f64) -> f64 {
    if t <= 0.0 || t >= 1.0 {
        return t;
    }
    let exp_mu = mu.exp();
    exp_mu / (exp_mu + (1.0 / t - 1.0))
}

/// Shift strength for a given latent token count, interpolated linearly
/// between the base and max anchor points.
pub fn shift_mu(image_seq_len: usize) -> f64 {
    let m = (MAX_SHIFT - BASE_SHIFT) / (MAX_IMAGE_SEQ_LEN - BASE_IMAGE_SEQ_LEN) as f64;
    let b = BASE_SHIFT - m * BASE_IMAGE_SEQ_LEN as f64;
    image_seq_len as f64 * m + b
}

/// Build the denoising schedule: `num_steps + 1` strictly decreasing
/// timesteps from 1.0 to 0.0 inclusive.
///
/// `image_seq_len` is the number of packed latent tokens of the target image
/// and only matters when `shift` is set.
pub fn get_schedule(num_steps: usize, image_seq_len: usize, shift: bool) -> Vec<f64> {
    assert!(num_steps >= 1, "schedule needs at least one step");
    let mut timesteps: Vec<f64> = (0..=num_steps)
        .map(|i| 1.0 - i as f64 / num_steps as f64)
        .collect();
    if shift {
        let mu = shift_mu(image_seq_len);
        for t in timesteps.iter_mut() {
            *t = time_shift(mu, *t);
        }
    }
    timesteps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_and_endpoints() {
        for num_steps in [1, 2, 4, 28, 50] {
            for shift in [false, true] {
                let ts = get_schedule(num_steps, 1024, shift);
                assert_eq!(ts.len(), num_steps + 1);
                assert_eq!(ts[0], 1.0);
                assert_eq!(ts[num_steps], 0.0);
                for pair in ts.windows(2) {
                    assert!(
                        pair[0] > pair[1],
                        "schedule must be strictly decreasing: {:?}",
                        ts
                    );
                }
            }
        }
    }

    #[test]
    fn uniform_without_shift() {
        let ts = get_schedule(4, 4096, false);
        assert_eq!(ts, vec![1.0, 0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn shift_anchors() {
        assert!((shift_mu(256) - 0.5).abs() < 1e-12);
        assert!((shift_mu(4096) - 1.15).abs() < 1e-12);
        assert!((shift_mu(1024) - 0.63).abs() < 1e-12);
    }

    #[test]
    fn shifted_values_match_reference() {
        // Values pinned against the reference PyTorch sampler, (4 steps, 256 tokens).
        let ts = get_schedule(4, 256, true);
        let expected = [
            1.0,
            0.8318243439635804,
            0.6224593312018546,
            0.3546612443924434,
            0.0,
        ];
        for (got, want) in ts.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
        }

        // And for (5 steps, 4096 tokens).
        let ts = get_schedule(5, 4096, true);
        let expected = [
            1.0,
            0.9266473446120875,
            0.8257016621505007,
            0.6779867152174471,
            0.441199748251356,
            0.0,
        ];
        for (got, want) in ts.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
        }
    }

    #[test]
    fn time_shift_fixes_endpoints() {
        assert_eq!(time_shift(1.15, 1.0), 1.0);
        assert_eq!(time_shift(1.15, 0.0), 0.0);
        assert!(time_shift(1.0, 0.5) > 0.5);
        assert_eq!(time_shift(0.0, 0.5), 0.5);
    }
}
