mod common;
use common::spiky_traces;
use spidet::{line_length, std_line_length, LineLengthConfig, SpidetError, Trace};

#[test]
fn spikes_dominate_energy() {
    let traces = spiky_traces(4, 6.0, 200.0, 7);
    let e = line_length(&traces, &LineLengthConfig::default()).unwrap();
    // 8-sample windows, 4-sample hop → 50 Hz.
    assert_eq!(e.n_bins(), (1200 - 8) / 4 + 1);
    approx::assert_abs_diff_eq!(e.sfreq(), 50.0);

    // Channel 0 fires at 1 s, 3 s, 5 s.
    let row = e.data().row(0);
    let peak_bin =
        row.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).map(|(i, _)| i).unwrap();
    let peak_time = e.start_timestamp() + peak_bin as f64 / e.sfreq() - traces[0].start_timestamp;
    let nearest =
        [1.0, 3.0, 5.0].iter().map(|s| (peak_time - s).abs()).fold(f64::INFINITY, f64::min);
    assert!(nearest < 0.06, "peak at {peak_time}s");
}

#[test]
fn channel_order_and_labels_kept() {
    let traces = spiky_traces(3, 1.0, 500.0, 8);
    let e = line_length(&traces, &LineLengthConfig { window: 0.1, step: 0.05 }).unwrap();
    assert_eq!(e.channel_names(), ["ch0", "ch1", "ch2"]);
    assert_eq!(e.n_bins(), (500 - 50) / 25 + 1);
    approx::assert_abs_diff_eq!(
        e.start_timestamp(),
        traces[0].start_timestamp + 0.05,
        epsilon = 1e-6
    );
}

#[test]
fn mismatched_traces_rejected() {
    let a = Trace::new("a", vec![0.0; 100], 200.0, 0.0);
    let b = Trace::new("b", vec![0.0; 100], 250.0, 0.0);
    let c = Trace::new("c", vec![0.0; 90], 200.0, 0.0);
    let d = Trace::new("d", vec![], 200.0, 0.0);
    let cfg = LineLengthConfig::default();
    for bad in [vec![a.clone(), b], vec![a.clone(), c], vec![a, d], vec![]] {
        assert!(matches!(line_length(&bad, &cfg), Err(SpidetError::InvalidInput(_))));
    }
}

#[test]
fn std_line_length_rises_where_channels_disagree() {
    let traces = spiky_traces(4, 4.0, 200.0, 9);
    let e = line_length(&traces, &LineLengthConfig::default()).unwrap();
    let sdf = std_line_length(&e, "rec");
    assert_eq!(sdf.label, "Std Line Length");
    let median = {
        let mut v = sdf.data.clone();
        v.sort_by(f64::total_cmp);
        v[v.len() / 2]
    };
    let max = sdf.data.iter().cloned().fold(0.0, f64::max);
    assert!(max > 10.0 * median, "max {max}, median {median}");
}
