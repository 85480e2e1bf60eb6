/// Shared synthetic recordings and energy matrices.
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use spidet::{EnergyMatrix, Trace};

#[allow(unused)]
pub const BURST: std::ops::RangeInclusive<usize> = 40..=50;

/// Activation curve with a slow baseline ripple and one burst at bins 40–50.
#[allow(unused)]
pub fn burst_activation(n_bins: usize) -> Vec<f64> {
    (0..n_bins)
        .map(|t| 0.1 + 0.02 * (t as f64 * 0.3).sin() + if BURST.contains(&t) { 1.0 } else { 0.0 })
        .collect()
}

#[allow(unused)]
/// Exact rank-1 energy: two channels weighted 1.0 and 0.5, 100 bins at 50 Hz.
pub fn rank1_energy() -> EnergyMatrix {
    let a = burst_activation(100);
    let weights = [1.0, 0.5];
    let data = Array2::from_shape_fn((2, 100), |(c, t)| weights[c] * a[t]);
    EnergyMatrix::new(data, vec!["LA1".into(), "LA2".into()], 50.0, 1_700_000_000.0).unwrap()
}

#[allow(unused)]
/// Six channels mixing two activation patterns, plus a little seeded noise.
pub fn two_pattern_energy(seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let w = [[1.0, 0.0], [0.9, 0.1], [0.8, 0.0], [0.0, 1.0], [0.1, 0.8], [0.0, 0.9]];
    Array2::from_shape_fn((6, 80), |(c, t)| {
        let p0 = 0.2 + if t % 20 < 3 { 2.0 } else { 0.0 };
        let p1 = 0.3 + if t % 25 > 21 { 1.5 } else { 0.0 };
        w[c][0] * p0 + w[c][1] * p1 + 0.01 * rng.gen::<f64>()
    })
}

#[allow(unused)]
/// `n_ch` channels of low-amplitude noise at `sfreq`, with sharp transients
/// every 2 s: channels in the first half fire at odd seconds, the rest at
/// even seconds.
pub fn spiky_traces(n_ch: usize, seconds: f64, sfreq: f64, seed: u64) -> Vec<Trace> {
    let n = (seconds * sfreq) as usize;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let spike_len = (0.03 * sfreq) as usize;
    (0..n_ch)
        .map(|c| {
            let offset = if c < n_ch / 2 { 1.0 } else { 2.0 };
            let mut x: Vec<f64> = (0..n).map(|_| 0.05 * (rng.gen::<f64>() - 0.5)).collect();
            let mut t0 = offset;
            while t0 + 0.05 < seconds {
                let s = (t0 * sfreq) as usize;
                for k in 0..spike_len {
                    // Triangular transient, 8 units peak.
                    let phase = k as f64 / spike_len as f64;
                    x[s + k] += 8.0 * (1.0 - (2.0 * phase - 1.0).abs());
                }
                t0 += 2.0;
            }
            Trace::new(format!("ch{c}"), x, sfreq, 1_700_000_000.0)
        })
        .collect()
}
