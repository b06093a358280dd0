#![no_main]
use gaitlock_core::{FeatureExtractor, SensorSample};
use libfuzzer_sys::fuzz_target;

// 6 axes x f32 + 1 flag byte per sample
const RECORD: usize = 25;

fuzz_target!(|data: &[u8]| {
    let mut ts = 0u64;
    let samples: Vec<SensorSample> = data
        .chunks_exact(RECORD)
        .map(|chunk| {
            let mut axes = [0.0f64; 6];
            for (i, axis) in axes.iter_mut().enumerate() {
                let bytes = [chunk[i * 4], chunk[i * 4 + 1], chunk[i * 4 + 2], chunk[i * 4 + 3]];
                *axis = f32::from_le_bytes(bytes) as f64;
            }
            ts += 20_000;
            SensorSample::new(
                ts,
                [axes[0], axes[1], axes[2]],
                [axes[3], axes[4], axes[5]],
                chunk[24] & 1 == 0,
            )
        })
        .collect();

    let _ = FeatureExtractor::default().extract(&samples);
});
