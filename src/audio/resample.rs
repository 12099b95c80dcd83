/// Simple linear resampling from `from_rate` to `to_rate`
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as u64 * to_rate as u64).div_ceil(from_rate as u64) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len().saturating_sub(1));
        let frac = src_idx - idx_floor as f64;

        let sample = match samples.get(idx_floor) {
            Some(&s1) => {
                let s2 = samples.get(idx_ceil).copied().unwrap_or(s1);
                s1 + (s2 - s1) * frac as f32
            }
            None => 0.0,
        };

        output.push(sample);
    }

    output
}
