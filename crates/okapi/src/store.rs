use crate::model::Model;
use okapi_core::{bail, Backend, Context, Error, HostData, HostMatrix, Matrix, Result};
use okapi_nn::Observer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

// Parameter container: an 8-byte little-endian header length, a JSON header
// mapping each tensor name to its dtype, shape, and payload byte range, then
// the raw column-major payload. Paired with the JSON model definition this
// reconstructs a trained graph.

#[derive(Debug, Serialize, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: [usize; 2],
    data_offsets: [usize; 2],
}

fn io_err(path: &Path, e: std::io::Error) -> Error {
    Error::msg(format!("{}: {e}", path.display()))
}

/// Write named matrices to `path`. `ctx` must be the stream that last wrote
/// them (for a model under training, the optimizer's context).
pub fn save_params<B: Backend>(
    path: &Path,
    params: &[(String, Matrix<B>)],
    ctx: &Context<B>,
) -> Result<()> {
    let mut header = BTreeMap::new();
    let mut payload = Vec::new();
    for (name, matrix) in params {
        let host = matrix.to_host(ctx)?;
        let start = payload.len();
        match host.data() {
            HostData::F32(v) => {
                for x in v {
                    payload.extend_from_slice(&x.to_le_bytes());
                }
            }
            HostData::I32(v) => {
                for x in v {
                    payload.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
        header.insert(
            name.clone(),
            TensorInfo {
                dtype: host.dtype().to_string(),
                shape: [host.nrows(), host.ncols()],
                data_offsets: [start, payload.len()],
            },
        );
    }
    let header_bytes =
        serde_json::to_vec(&header).map_err(|e| Error::msg(format!("param header: {e}")))?;
    let mut file = File::create(path).map_err(|e| io_err(path, e))?;
    file.write_all(&(header_bytes.len() as u64).to_le_bytes())
        .map_err(|e| io_err(path, e))?;
    file.write_all(&header_bytes).map_err(|e| io_err(path, e))?;
    file.write_all(&payload).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Read every tensor in a parameter container back as host matrices.
pub fn load_params(path: &Path) -> Result<BTreeMap<String, HostMatrix>> {
    let mut bytes = Vec::new();
    File::open(path)
        .map_err(|e| io_err(path, e))?
        .read_to_end(&mut bytes)
        .map_err(|e| io_err(path, e))?;
    if bytes.len() < 8 {
        bail!("{}: truncated parameter file", path.display());
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    if bytes.len() < 8 + header_len {
        bail!("{}: truncated parameter header", path.display());
    }
    let header: BTreeMap<String, TensorInfo> = serde_json::from_slice(&bytes[8..8 + header_len])
        .map_err(|e| Error::msg(format!("param header: {e}")))?;
    let payload = &bytes[8 + header_len..];

    let mut out = BTreeMap::new();
    for (name, info) in header {
        let [start, end] = info.data_offsets;
        if end < start || end > payload.len() {
            bail!("{}: tensor '{name}' has out-of-range offsets", path.display());
        }
        let raw = &payload[start..end];
        let [nrows, ncols] = info.shape;
        let host = match info.dtype.as_str() {
            "f32" => {
                let vals: Vec<f32> = raw
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                HostMatrix::from_f32(nrows, ncols, vals)?
            }
            "i32" => {
                let vals: Vec<i32> = raw
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                HostMatrix::from_i32(nrows, ncols, vals)?
            }
            other => bail!("{}: tensor '{name}' has unknown dtype '{other}'", path.display()),
        };
        out.insert(name, host);
    }
    Ok(out)
}

/// Upload saved parameters into a built model, matching by name and
/// checking shape and dtype. `ctx` is the stream the uploads are queued on;
/// the call synchronizes it before returning.
pub fn restore_params<B: Backend>(
    model: &Model<B>,
    path: &Path,
    ctx: &Context<B>,
) -> Result<()> {
    let saved = load_params(path)?;
    for (name, param) in model.named_params() {
        let host = saved
            .get(&name)
            .ok_or_else(|| Error::msg(format!("parameter '{name}' missing from {}", path.display())))?;
        param.to_device_async(ctx, host)?;
    }
    ctx.synchronize()
}

/// Observer that checkpoints the model's parameters every `period`
/// iterations.
pub struct Saver<B: Backend> {
    params: Vec<(String, Matrix<B>)>,
    ctx: Context<B>,
    period: u64,
    path: PathBuf,
    definition_json: Option<(PathBuf, String)>,
}

impl<B: Backend> Saver<B> {
    /// `ctx` must be the stream that applies parameter updates (the
    /// optimizer's context).
    pub fn new(model: &Model<B>, ctx: Context<B>, period: u64, path: impl Into<PathBuf>) -> Result<Self> {
        if period == 0 {
            bail!("saver period must be at least 1");
        }
        Ok(Saver {
            params: model.named_params(),
            ctx,
            period,
            path: path.into(),
            definition_json: None,
        })
    }

    /// Also write the model definition JSON to `path` on every checkpoint.
    pub fn with_definition(mut self, path: impl Into<PathBuf>, json: String) -> Self {
        self.definition_json = Some((path.into(), json));
        self
    }
}

impl<B: Backend> Observer for Saver<B> {
    fn notify(&mut self, iteration: u64) -> Result<()> {
        if iteration == 0 || iteration % self.period != 0 {
            return Ok(());
        }
        save_params(&self.path, &self.params, &self.ctx)?;
        if let Some((path, json)) = &self.definition_json {
            std::fs::write(path, json).map_err(|e| io_err(path, e))?;
        }
        tracing::info!(iteration, path = %self.path.display(), "saved parameters");
        Ok(())
    }
}
