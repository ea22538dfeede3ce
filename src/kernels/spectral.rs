use anyhow::{bail, Result};

/// Metres of range per FFT bin.
pub const RANGE_RESOLUTION_M: f32 = 0.5;

/// In-place iterative radix-2 FFT over interleaved `[re, im, re, im, ..]` data.
pub fn fft_in_place(data: &mut [f32]) -> Result<()> {
    if data.len() % 2 != 0 {
        bail!("complex sample buffer has odd length {}", data.len());
    }
    let n = data.len() / 2;
    if n == 0 || !n.is_power_of_two() {
        bail!("FFT size {} is not a power of two", n);
    }

    // Bit-reversal permutation
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = i.reverse_bits() >> (usize::BITS - bits);
        if j > i {
            data.swap(2 * i, 2 * j);
            data.swap(2 * i + 1, 2 * j + 1);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * std::f32::consts::PI / len as f32;
        let (w_im, w_re) = angle.sin_cos();
        for start in (0..n).step_by(len) {
            let (mut cur_re, mut cur_im) = (1.0f32, 0.0f32);
            for k in 0..len / 2 {
                let a = start + k;
                let b = a + len / 2;
                let (b_re, b_im) = (data[2 * b], data[2 * b + 1]);
                let t_re = b_re * cur_re - b_im * cur_im;
                let t_im = b_re * cur_im + b_im * cur_re;
                let (a_re, a_im) = (data[2 * a], data[2 * a + 1]);
                data[2 * a] = a_re + t_re;
                data[2 * a + 1] = a_im + t_im;
                data[2 * b] = a_re - t_re;
                data[2 * b + 1] = a_im - t_im;

                let next_re = cur_re * w_re - cur_im * w_im;
                cur_im = cur_re * w_im + cur_im * w_re;
                cur_re = next_re;
            }
        }
        len <<= 1;
    }
    Ok(())
}

/// Estimate target distance from one block of beat-signal samples: the bin
/// with the strongest return, scaled by the range resolution.
pub fn estimate_distance(samples: &[f32]) -> Result<f32> {
    let mut data = samples.to_vec();
    fft_in_place(&mut data)?;

    let n = data.len() / 2;
    let mut peak_bin = 0;
    let mut peak_power = f32::MIN;
    // Skip DC; only the positive half of the spectrum carries range.
    for bin in 1..n / 2 {
        let power = data[2 * bin] * data[2 * bin] + data[2 * bin + 1] * data[2 * bin + 1];
        if power > peak_power {
            peak_power = power;
            peak_bin = bin;
        }
    }
    Ok(peak_bin as f32 * RANGE_RESOLUTION_M)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(n: usize, bin: usize) -> Vec<f32> {
        (0..n)
            .flat_map(|i| {
                let phase = 2.0 * std::f32::consts::PI * (bin * i) as f32 / n as f32;
                [phase.cos(), phase.sin()]
            })
            .collect()
    }

    #[test]
    fn test_fft_of_impulse_is_flat() {
        let mut data = vec![0.0f32; 16];
        data[0] = 1.0;
        fft_in_place(&mut data).unwrap();
        for k in 0..8 {
            assert!((data[2 * k] - 1.0).abs() < 1e-6);
            assert!(data[2 * k + 1].abs() < 1e-6);
        }
    }

    #[test]
    fn test_distance_from_tone() {
        let samples = tone(1024, 37);
        let d = estimate_distance(&samples).unwrap();
        assert_eq!(d, 37.0 * RANGE_RESOLUTION_M);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(estimate_distance(&[1.0, 0.0, 1.0]).is_err());
        assert!(estimate_distance(&vec![0.0; 6]).is_err());
        assert!(estimate_distance(&[]).is_err());
    }
}
