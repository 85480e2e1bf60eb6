mod common;
use common::two_pattern_energy;
use spidet::{ActivationConsolidator, EnergyMatrix, NmfConfig, NmfEngine};

fn energy() -> EnergyMatrix {
    let names = (1..=6).map(|i| format!("TB{i}")).collect();
    EnergyMatrix::new(two_pattern_energy(21), names, 50.0, 42.0).unwrap()
}

#[test]
fn components_align_and_preserve_product() {
    let e = energy();
    let d = NmfEngine::new(NmfConfig { rank_range: (1, 3), n_runs: 4, ..NmfConfig::default() })
        .decompose(&e)
        .unwrap();
    let all: Vec<usize> = (0..d.ranks.len()).collect();
    let consolidated = ActivationConsolidator::new("p").consolidate_ranks(&d, &all, &e).unwrap();

    for (c, r) in consolidated.iter().zip(&d.ranks) {
        assert_eq!(c.rank, r.rank);
        assert_eq!(c.basis.len(), r.rank);
        assert_eq!(c.activations.len(), r.rank);

        // W·H is invariant under the scaling and permutation.
        let product = c.w().dot(&c.h());
        let original = r.best.reconstruct();
        for (x, y) in product.iter().zip(original.iter()) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-9 * (1.0 + y.abs()));
        }

        let totals: Vec<f64> = c.activations.iter().map(|a| a.data.iter().sum()).collect();
        assert!(totals.windows(2).all(|p| p[0] >= p[1]), "{totals:?}");

        for (i, (b, a)) in c.pairs().enumerate() {
            assert_eq!(b.label, format!("W{i}"));
            assert_eq!(a.label, format!("H{i}"));
            assert_eq!(a.unique_id, format!("p_k{}_H{i}", r.rank));
            let peak = b.data.iter().cloned().fold(0.0, f64::max);
            approx::assert_abs_diff_eq!(peak, 1.0, epsilon = 1e-12);
            assert_eq!(b.channel_names.len(), 6);
            assert_eq!(a.sfreq, 50.0);
            assert_eq!(a.start_timestamp, 42.0);
            assert_eq!(a.len(), 80);
        }
    }
}

#[test]
fn dominant_channels_follow_patterns() {
    let e = energy();
    let d = NmfEngine::new(NmfConfig { rank_range: (2, 2), n_runs: 6, ..NmfConfig::default() })
        .decompose(&e)
        .unwrap();
    let c = ActivationConsolidator::new("p").consolidate(&d.ranks[0].best, &e, false).unwrap();
    let mut dominant: Vec<&str> = c.basis.iter().filter_map(|b| b.dominant_channel()).collect();
    dominant.sort();
    // One pattern is led by TB1, the other by TB4.
    assert_eq!(dominant, vec!["TB1", "TB4"]);
}
