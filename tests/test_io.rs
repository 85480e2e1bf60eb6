mod common;
use common::spiky_traces;
use spidet::io::{
    load_activation_functions, load_basis_functions, load_traces, read_activation_table,
    write_activation_table, write_events, write_functions, write_traces, StWriter,
};
use spidet::{detect_spikes, DetectionConfig, NmfConfig, ThresholdGenerator};

fn small_config() -> DetectionConfig {
    DetectionConfig {
        nmf: NmfConfig { rank_range: (2, 3), n_runs: 4, ..NmfConfig::default() },
        rank_policy: spidet::RankPolicy::All,
        id_prefix: "io".into(),
        ..DetectionConfig::default()
    }
}

#[test]
fn traces_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.safetensors");
    let traces = spiky_traces(4, 2.0, 200.0, 1);
    write_traces(&path, &traces).unwrap();
    let back = load_traces(&path, traces[0].start_timestamp).unwrap();
    assert_eq!(back, traces);
}

#[test]
fn traces_without_names_get_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("raw.safetensors");
    let mut w = StWriter::new();
    w.add_f64("data", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[2, 3]);
    w.add_f64("sfreq", &[250.0], &[1]);
    w.write(&path).unwrap();
    let traces = load_traces(&path, 5.0).unwrap();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[1].label, "ch1");
    assert_eq!(traces[1].data, vec![3.0, 4.0, 5.0]);
    assert_eq!(traces[0].sfreq, 250.0);
    assert_eq!(traces[0].start_timestamp, 5.0);
}

#[test]
fn missing_tensor_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.safetensors");
    let mut w = StWriter::new();
    w.add_f64("data", &[0.0, 1.0], &[1, 2]);
    w.write(&path).unwrap();
    let err = load_traces(&path, 0.0).unwrap_err();
    assert!(format!("{err:#}").contains("sfreq"));
}

#[test]
fn reloaded_functions_give_identical_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("functions.safetensors");
    let traces = spiky_traces(6, 12.0, 200.0, 2);
    let out = detect_spikes(&traces, &small_config()).unwrap();

    let basis: Vec<_> = out.basis().cloned().collect();
    let activations: Vec<_> = out.activations().cloned().collect();
    write_functions(&path, &basis, &activations).unwrap();

    let loaded = load_activation_functions(&path).unwrap();
    assert_eq!(loaded, activations);
    assert_eq!(load_basis_functions(&path).unwrap(), basis);

    let g = ThresholdGenerator::new(small_config().threshold);
    for ((direct, reloaded), events) in activations.iter().zip(&loaded).zip(&out.events) {
        let t = events
            .first()
            .map_or_else(|| g.generate_threshold(direct).unwrap(), |e| e.threshold);
        assert_eq!(&g.find_events(reloaded, t).unwrap(), events);
        assert_eq!(g.detect(reloaded).unwrap(), g.detect(direct).unwrap());
    }
}

#[test]
fn csv_table_path_matches_direct_path() {
    let traces = spiky_traces(6, 12.0, 200.0, 3);
    let out = detect_spikes(&traces, &small_config()).unwrap();
    let activations: Vec<_> = out.activations().cloned().collect();

    let mut buf = Vec::new();
    write_activation_table(&mut buf, &activations).unwrap();
    let first = &activations[0];
    let loaded = read_activation_table(buf.as_slice(), first.start_timestamp, first.sfreq).unwrap();
    assert_eq!(loaded.len(), activations.len());

    let g = ThresholdGenerator::default();
    for (direct, reloaded) in activations.iter().zip(&loaded) {
        assert_eq!(reloaded.label, direct.label);
        assert_eq!(reloaded.data, direct.data);
        let a = g.detect(direct).unwrap();
        let b = g.detect(reloaded).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn events_csv_one_row_per_event() {
    let traces = spiky_traces(6, 12.0, 200.0, 4);
    let out = detect_spikes(&traces, &small_config()).unwrap();
    let events: Vec<_> = out.events.iter().flatten().cloned().collect();
    let mut buf = Vec::new();
    write_events(&mut buf, &events).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert_eq!(text.lines().count(), events.len() + 1);
}
