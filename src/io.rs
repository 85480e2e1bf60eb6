//! Safetensors and CSV I/O around the detection engine.
//!
//! - Recordings: `data` `[C, T]` (F32 or F64), `sfreq` (scalar) and optional
//!   newline-separated `ch_names` (U8), read by [`load_traces`].
//! - Decompositions: basis functions as rows of `W` `[n, C]` and activation
//!   functions as rows of `H` `[n, T]`, both F64, with labels and timing in
//!   the `__metadata__` map ([`write_functions`] / [`load_activation_functions`]).
//! - Activation tables: one CSV row per pattern, `label,v0,v1,...`
//!   ([`write_activation_table`] / [`read_activation_table`]).
//! - Events: one CSV row per [`SpikeEvent`] ([`write_events`]).
//!
//! Everything here returns `anyhow::Result` with file context attached.
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::functions::{ActivationFunction, BasisFunction};
use crate::threshold::SpikeEvent;
use crate::trace::{validate_traces, Trace};

/// `__metadata__` key holding the JSON function index of a decomposition file.
pub const FUNCTIONS_KEY: &str = "spidet.functions";

// ── Low-level safetensors parser ──────────────────────────────────────────────

fn parse_header(bytes: &[u8]) -> Result<(HashMap<String, Value>, usize)> {
    ensure!(bytes.len() >= 8, "safetensors file too small");
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[..8]);
    let n = u64::from_le_bytes(len) as usize;
    let end = 8usize
        .checked_add(n)
        .filter(|&e| e <= bytes.len())
        .context("safetensors header length exceeds file size")?;
    let header: HashMap<String, Value> =
        serde_json::from_slice(&bytes[8..end]).context("failed to parse safetensors header")?;
    Ok((header, end))
}

fn tensor_bytes<'a>(bytes: &'a [u8], data_start: usize, entry: &Value) -> Result<&'a [u8]> {
    let offsets = entry["data_offsets"].as_array().context("tensor without data_offsets")?;
    ensure!(offsets.len() == 2, "data_offsets must hold two entries");
    let s = offsets[0].as_u64().context("bad data offset")? as usize;
    let e = offsets[1].as_u64().context("bad data offset")? as usize;
    ensure!(s <= e && data_start + e <= bytes.len(), "tensor data [{s}, {e}) out of bounds");
    Ok(&bytes[data_start + s..data_start + e])
}

fn shape_of(entry: &Value) -> Result<Vec<usize>> {
    entry["shape"]
        .as_array()
        .context("tensor without shape")?
        .iter()
        .map(|v| v.as_u64().map(|x| x as usize).context("bad tensor shape"))
        .collect()
}

/// Float tensor as `f64`; F32 payloads are widened.
fn read_float_tensor(bytes: &[u8], data_start: usize, entry: &Value) -> Result<Vec<f64>> {
    let raw = tensor_bytes(bytes, data_start, entry)?;
    match entry["dtype"].as_str() {
        Some("F64") => Ok(raw
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect()),
        Some("F32") => Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
            .collect()),
        other => bail!("unsupported float dtype {other:?}"),
    }
}

fn read_matrix(
    bytes: &[u8],
    data_start: usize,
    header: &HashMap<String, Value>,
    name: &str,
) -> Result<Array2<f64>> {
    let entry = header.get(name).with_context(|| format!("missing '{name}' tensor"))?;
    let shape = shape_of(entry)?;
    ensure!(shape.len() == 2, "'{name}' must be 2-D, got shape {shape:?}");
    let data = read_float_tensor(bytes, data_start, entry)?;
    Array2::from_shape_vec((shape[0], shape[1]), data)
        .with_context(|| format!("'{name}' payload does not match its shape"))
}

fn read_lines_tensor(bytes: &[u8], data_start: usize, entry: &Value) -> Result<Vec<String>> {
    let raw = std::str::from_utf8(tensor_bytes(bytes, data_start, entry)?)?;
    Ok(raw.split('\n').filter(|s| !s.is_empty()).map(String::from).collect())
}

fn metadata_value<'a>(header: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    header.get("__metadata__")?.get(key)?.as_str()
}

// ── Generic safetensors builder ───────────────────────────────────────────────

/// Safetensors writer for F64 and U8 tensors plus string metadata.
///
/// ```rust,no_run
/// use spidet::io::StWriter;
/// use std::path::Path;
/// let mut w = StWriter::new();
/// w.add_f64("signal", &[1.0, 2.0, 3.0], &[1, 3]);
/// w.set_metadata("subject", "p07");
/// w.write(Path::new("/tmp/out.safetensors")).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct StWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
    metadata: serde_json::Map<String, Value>,
}

impl StWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_f64(&mut self, name: &str, data: &[f64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F64", shape.to_vec()));
    }

    pub fn add_f64_arr2(&mut self, name: &str, arr: &Array2<f64>) {
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, &[arr.nrows(), arr.ncols()]);
    }

    /// Newline-joined strings as a U8 tensor.
    pub fn add_lines(&mut self, name: &str, lines: &[String]) {
        let bytes = lines.join("\n").into_bytes();
        let n = bytes.len();
        self.entries.push((name.to_string(), bytes, "U8", vec![n]));
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), Value::String(value.into()));
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut header_map = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header_map.insert("__metadata__".into(), Value::Object(self.metadata.clone()));
        }
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(name.clone(), serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [offset, offset + data.len()],
            }));
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;
        let padded: Vec<u8> =
            hdr_bytes.into_iter().chain(std::iter::repeat(b' ').take(pad)).collect();

        let file = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut f = std::io::BufWriter::new(file);
        f.write_all(&(padded.len() as u64).to_le_bytes())?;
        f.write_all(&padded)?;
        for (_, data, _, _) in &self.entries {
            f.write_all(data)?;
        }
        f.flush()?;
        Ok(())
    }
}

// ── Recordings ────────────────────────────────────────────────────────────────

/// Read a `[C, T]` recording into one [`Trace`] per row.
///
/// Channels without a stored name are called `ch0`, `ch1`, ...
pub fn load_traces(path: &Path, start_timestamp: f64) -> Result<Vec<Trace>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let (header, data_start) = parse_header(&bytes)?;

    let data = read_matrix(&bytes, data_start, &header, "data")?;
    let sfreq_entry = header.get("sfreq").context("missing 'sfreq' tensor")?;
    let sfreq = *read_float_tensor(&bytes, data_start, sfreq_entry)?
        .first()
        .context("'sfreq' tensor is empty")?;

    let mut names = match header.get("ch_names") {
        Some(e) => read_lines_tensor(&bytes, data_start, e)?,
        None => vec![],
    };
    if names.len() != data.nrows() {
        ensure!(names.is_empty(), "{} channel names for {} channels", names.len(), data.nrows());
        names = (0..data.nrows()).map(|i| format!("ch{i}")).collect();
    }

    Ok(data
        .rows()
        .into_iter()
        .zip(names)
        .map(|(row, name)| Trace::new(name, row.to_vec(), sfreq, start_timestamp))
        .collect())
}

/// Write traces in the layout [`load_traces`] reads.
pub fn write_traces(path: &Path, traces: &[Trace]) -> Result<()> {
    let (sfreq, n) = validate_traces(traces)?;
    let mut w = StWriter::new();
    let data: Vec<f64> = traces.iter().flat_map(|t| t.data.iter().copied()).collect();
    w.add_f64("data", &data, &[traces.len(), n]);
    w.add_f64("sfreq", &[sfreq], &[1]);
    w.add_lines("ch_names", &traces.iter().map(|t| t.label.clone()).collect::<Vec<_>>());
    w.write(path)
}

// ── Decompositions ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct BasisMeta {
    label: String,
    unique_id: String,
    rank: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivationMeta {
    label: String,
    unique_id: String,
    rank: usize,
    sfreq: f64,
    start_timestamp: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FunctionIndex {
    channel_names: Vec<String>,
    basis: Vec<BasisMeta>,
    activations: Vec<ActivationMeta>,
}

/// Persist basis and activation functions to one safetensors file.
///
/// All basis functions must share their channel labels and all activation
/// functions their length.
pub fn write_functions(
    path: &Path,
    basis: &[BasisFunction],
    activations: &[ActivationFunction],
) -> Result<()> {
    let channel_names = basis.first().map(|b| b.channel_names.clone()).unwrap_or_default();
    for b in basis {
        ensure!(
            b.channel_names == channel_names,
            "basis function {} has different channels",
            b.unique_id
        );
        ensure!(
            b.data.len() == channel_names.len(),
            "basis function {} has {} weights for {} channels",
            b.unique_id,
            b.data.len(),
            channel_names.len()
        );
    }
    let n_t = activations.first().map_or(0, |a| a.len());
    for a in activations {
        ensure!(
            a.len() == n_t,
            "activation function {} has {} samples, expected {n_t}",
            a.unique_id,
            a.len()
        );
    }

    let index = FunctionIndex {
        channel_names: channel_names.clone(),
        basis: basis
            .iter()
            .map(|b| BasisMeta {
                label: b.label.clone(),
                unique_id: b.unique_id.clone(),
                rank: b.rank,
            })
            .collect(),
        activations: activations
            .iter()
            .map(|a| ActivationMeta {
                label: a.label.clone(),
                unique_id: a.unique_id.clone(),
                rank: a.rank,
                sfreq: a.sfreq,
                start_timestamp: a.start_timestamp,
            })
            .collect(),
    };

    let mut w = StWriter::new();
    let w_data: Vec<f64> = basis.iter().flat_map(|b| b.data.iter().copied()).collect();
    w.add_f64("W", &w_data, &[basis.len(), channel_names.len()]);
    let h_data: Vec<f64> = activations.iter().flat_map(|a| a.data.iter().copied()).collect();
    w.add_f64("H", &h_data, &[activations.len(), n_t]);
    w.set_metadata(FUNCTIONS_KEY, serde_json::to_string(&index)?);
    w.write(path)
}

fn read_index(path: &Path) -> Result<(Vec<u8>, HashMap<String, Value>, usize, FunctionIndex)> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let (header, data_start) = parse_header(&bytes)?;
    let raw = metadata_value(&header, FUNCTIONS_KEY)
        .with_context(|| format!("{} has no '{FUNCTIONS_KEY}' metadata", path.display()))?;
    let index: FunctionIndex = serde_json::from_str(raw).context("malformed function index")?;
    Ok((bytes, header, data_start, index))
}

/// Activation functions stored by [`write_functions`], in file order.
pub fn load_activation_functions(path: &Path) -> Result<Vec<ActivationFunction>> {
    let (bytes, header, data_start, index) = read_index(path)?;
    let h = read_matrix(&bytes, data_start, &header, "H")?;
    ensure!(
        h.nrows() == index.activations.len(),
        "'H' has {} rows for {} activation functions",
        h.nrows(),
        index.activations.len()
    );
    Ok(index
        .activations
        .into_iter()
        .zip(h.rows())
        .map(|(m, row)| ActivationFunction {
            label: m.label,
            unique_id: m.unique_id,
            rank: m.rank,
            sfreq: m.sfreq,
            start_timestamp: m.start_timestamp,
            data: row.to_vec(),
        })
        .collect())
}

/// Basis functions stored by [`write_functions`], in file order.
pub fn load_basis_functions(path: &Path) -> Result<Vec<BasisFunction>> {
    let (bytes, header, data_start, index) = read_index(path)?;
    let w = read_matrix(&bytes, data_start, &header, "W")?;
    ensure!(
        w.nrows() == index.basis.len(),
        "'W' has {} rows for {} basis functions",
        w.nrows(),
        index.basis.len()
    );
    let channel_names = index.channel_names;
    Ok(index
        .basis
        .into_iter()
        .zip(w.rows())
        .map(|(m, row)| BasisFunction {
            label: m.label,
            unique_id: m.unique_id,
            rank: m.rank,
            channel_names: channel_names.clone(),
            data: row.to_vec(),
        })
        .collect())
}

// ── CSV tables ────────────────────────────────────────────────────────────────

/// One `label,v0,v1,...` row per activation function.
///
/// Values use Rust's shortest round-trip float formatting, so reading the
/// table back reproduces the samples bit for bit.
pub fn write_activation_table<W: Write>(mut writer: W, afs: &[ActivationFunction]) -> Result<()> {
    for af in afs {
        ensure!(!af.label.contains(','), "label '{}' contains a comma", af.label);
        write!(writer, "{}", af.label)?;
        for v in &af.data {
            write!(writer, ",{v}")?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Rebuild activation functions from a row-per-pattern table.
///
/// The table carries no timing, so every row gets `start_timestamp` and
/// `sfreq`; the label doubles as unique id.  Blank lines are skipped.
pub fn read_activation_table<R: BufRead>(
    reader: R,
    start_timestamp: f64,
    sfreq: f64,
) -> Result<Vec<ActivationFunction>> {
    ensure!(sfreq.is_finite() && sfreq > 0.0, "sample rate must be positive, got {sfreq}");
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let label = fields.next().unwrap_or_default().trim().to_string();
        let data = fields
            .map(|f| {
                f.trim()
                    .parse::<f64>()
                    .with_context(|| format!("line {}: bad value '{f}'", lineno + 1))
            })
            .collect::<Result<Vec<f64>>>()?;
        out.push(ActivationFunction {
            unique_id: label.clone(),
            label,
            rank: 0,
            sfreq,
            start_timestamp,
            data,
        });
    }
    Ok(out)
}

const EVENT_COLUMNS: &str =
    "label,start_index,end_index,start_time,end_time,duration,peak_value,peak_time,threshold";

/// Events as CSV with a header row.
pub fn write_events<W: Write>(mut writer: W, events: &[SpikeEvent]) -> Result<()> {
    writeln!(writer, "{EVENT_COLUMNS}")?;
    for e in events {
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{}",
            e.label,
            e.start_index,
            e.end_index,
            e.start_time,
            e.end_time,
            e.duration,
            e.peak_value,
            e.peak_time,
            e.threshold
        )?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_checked() {
        let mut bytes = 1000u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(parse_header(&bytes).is_err());
        assert!(parse_header(&[0u8; 4]).is_err());
    }

    #[test]
    fn table_round_trip_is_exact() {
        let af = ActivationFunction {
            label: "H0".into(),
            unique_id: "H0".into(),
            rank: 0,
            sfreq: 50.0,
            start_timestamp: 12.5,
            data: vec![0.1, 1.0 / 3.0, 2.5e-300, 0.0],
        };
        let mut buf = Vec::new();
        write_activation_table(&mut buf, std::slice::from_ref(&af)).unwrap();
        let back = read_activation_table(buf.as_slice(), 12.5, 50.0).unwrap();
        assert_eq!(back, vec![af]);
    }

    #[test]
    fn bad_table_value_reported() {
        let err = read_activation_table("H0,1.0,abc\n".as_bytes(), 0.0, 50.0).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
    }

    #[test]
    fn events_csv_has_header() {
        let mut buf = Vec::new();
        write_events(&mut buf, &[]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap().trim(), EVENT_COLUMNS);
    }
}
