//! Binary checkpoints of weights and optimizer state.
//!
//! One file per network, all integers and floats big-endian:
//!
//! ```text
//! "NNCK"  u32 version  u32 name_len  name bytes  u32 epoch  u32 count
//! per weights node, in execution order:
//!   i32 rows  i32 cols  f64 weights[rows * cols]          (row-major)
//!   u8 tag    0 = SGD: f64 learning_rate
//!             1 = Ada: u32 capacity
//!                      f64 learning_rate[rows * cols]
//!                      f64 momentum[rows * cols]
//!                      f64 last_delta[rows * cols]
//!                      u32 history_len, then history_len matrices, oldest first
//! ```
//!
//! `epoch` is the number of completed training epochs, zero for a network saved
//! outside a trainer. Only trained state is stored; the graph itself is rebuilt by
//! the caller and restore checks that the file describes it (name, node count,
//! shapes, optimizer kinds and history capacity). Nothing is modified unless the
//! whole file decodes.

use log::info;
use ndarray::Array2;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::{Ada, Network, Sgd, WeightsOptimizer};
use crate::error::{NetError, NetResult};

const MAGIC: &[u8; 4] = b"NNCK";
pub const FORMAT_VERSION: u32 = 1;

const TAG_SGD: u8 = 0;
const TAG_ADA: u8 = 1;

/// `dir/{root}_{network}.{extension}`
pub fn checkpoint_path(dir: &Path, root: &str, network: &str, extension: &str) -> PathBuf {
    dir.join(format!("{root}_{network}.{extension}"))
}

/// Save `network` after `epoch` completed epochs to `path`, creating parent
/// directories.
///
/// The file is written next to `path` and renamed over it, so an interrupted save
/// never replaces a valid checkpoint.
///
/// # Errors
/// `Io` if the directory, temporary file or rename fails.
pub fn save_checkpoint(network: &Network, path: &Path, epoch: usize) -> NetResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| NetError::io(parent, e))?;
    }

    let bytes = encode(network, epoch)?;
    let tmp = temp_path(path);
    if let Err(err) = write_synced(&tmp, &bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        NetError::io(path, e)
    })?;

    info!(
        "saved checkpoint of `{}` at epoch {epoch} ({} bytes) to {}",
        network.name(),
        bytes.len(),
        path.display()
    );
    Ok(())
}

/// Restore weights and optimizer state of `network` from `path` and return the
/// number of completed epochs stored with them.
///
/// # Errors
/// `Io` if the file cannot be read; `MalformedCheckpoint` for a bad header,
/// another network's name, a different node count, optimizer kind or history
/// capacity, an out-of-range learning rate or momentum, truncated or trailing
/// bytes; `ShapeMismatch` when a matrix has a different shape.
pub fn restore_checkpoint(network: &mut Network, path: &Path) -> NetResult<usize> {
    let bytes = fs::read(path).map_err(|e| NetError::io(path, e))?;
    let mut reader = Reader::new(&bytes, path);

    if reader.take(4)? != MAGIC {
        return Err(reader.malformed("not a network checkpoint"));
    }
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(reader.malformed(&format!("unsupported version {version}")));
    }
    let name = reader.string()?;
    if name != network.name() {
        return Err(reader.malformed(&format!(
            "checkpoint belongs to network `{name}`, not `{}`",
            network.name()
        )));
    }
    let epoch = reader.u32()? as usize;

    let ids = network.weights_nodes();
    let count = reader.u32()? as usize;
    if count != ids.len() {
        return Err(reader.malformed(&format!(
            "{count} weights nodes stored, network has {}",
            ids.len()
        )));
    }

    let mut sections = Vec::with_capacity(count);
    for &id in &ids {
        let live = network.weights_node(id)?;
        let (rows, cols) = live.weights().dim();

        let stored_rows = reader.dim()?;
        let stored_cols = reader.dim()?;
        if stored_rows != rows {
            return Err(NetError::shape(format!("checkpoint rows of node {}", id.index()), rows, stored_rows));
        }
        if stored_cols != cols {
            return Err(NetError::shape(format!("checkpoint columns of node {}", id.index()), cols, stored_cols));
        }
        let len = rows * cols;
        let weights = Array2::from_shape_vec((rows, cols), reader.f64s(len)?)
            .map_err(|e| reader.malformed(&e.to_string()))?;

        let tag = reader.u8()?;
        let optimizer = match tag {
            TAG_SGD => {
                let rate = reader.f64()?;
                let sgd = Sgd::try_new(rate).map_err(|e| reader.malformed(&e.to_string()))?;
                WeightsOptimizer::Sgd(sgd)
            }
            TAG_ADA => {
                let capacity = reader.u32()? as usize;
                if let WeightsOptimizer::Ada(live_ada) = live.optimizer() {
                    if live_ada.capacity() != capacity {
                        return Err(reader.malformed(&format!(
                            "stored history capacity {capacity} where the network uses {}",
                            live_ada.capacity()
                        )));
                    }
                }
                let learning_rate = reader.f64s(len)?;
                let momentum = reader.f64s(len)?;
                let last_delta = reader.f64s(len)?;
                let history_len = reader.u32()? as usize;
                if history_len > capacity {
                    return Err(reader.malformed(&format!(
                        "history of {history_len} exceeds capacity {capacity}"
                    )));
                }
                let history = (0..history_len)
                    .map(|_| reader.f64s(len))
                    .collect::<NetResult<Vec<_>>>()?;
                let ada = Ada::from_parts(rows, cols, capacity, learning_rate, momentum, last_delta, history)
                    .map_err(|e| reader.malformed(&e.to_string()))?;
                WeightsOptimizer::Ada(ada)
            }
            other => return Err(reader.malformed(&format!("unknown optimizer tag {other}"))),
        };
        if optimizer.name() != live.optimizer().name() {
            return Err(reader.malformed(&format!(
                "stored {} optimizer where the network uses {}",
                optimizer.name(),
                live.optimizer().name()
            )));
        }
        sections.push((id, weights, optimizer));
    }

    if reader.remaining() != 0 {
        return Err(reader.malformed(&format!("{} trailing bytes", reader.remaining())));
    }

    for (id, weights, optimizer) in sections {
        network.weights_node_mut(id)?.restore(weights, optimizer);
    }
    info!(
        "restored `{}` at epoch {epoch} from {}",
        network.name(),
        path.display()
    );
    Ok(epoch)
}

fn encode(network: &Network, epoch: usize) -> NetResult<Vec<u8>> {
    let ids = network.weights_nodes();
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    put_u32(&mut out, FORMAT_VERSION);
    put_u32(&mut out, len_u32(network.name().len())?);
    out.extend_from_slice(network.name().as_bytes());
    put_u32(&mut out, len_u32(epoch)?);
    put_u32(&mut out, len_u32(ids.len())?);

    for id in ids {
        let node = network.weights_node(id)?;
        let weights = node.weights();
        let (rows, cols) = weights.dim();
        put_i32(&mut out, dim_i32(rows)?);
        put_i32(&mut out, dim_i32(cols)?);
        // `iter` walks logical row-major order whatever the memory layout.
        put_f64s(&mut out, weights.iter());

        match node.optimizer() {
            WeightsOptimizer::Sgd(sgd) => {
                out.push(TAG_SGD);
                put_f64(&mut out, sgd.learning_rate());
            }
            WeightsOptimizer::Ada(ada) => {
                out.push(TAG_ADA);
                put_u32(&mut out, len_u32(ada.capacity())?);
                put_f64s(&mut out, ada.learning_rates());
                put_f64s(&mut out, ada.momenta());
                put_f64s(&mut out, ada.last_deltas());
                put_u32(&mut out, len_u32(ada.history_len())?);
                for gradient in ada.history() {
                    put_f64s(&mut out, gradient);
                }
            }
        }
    }
    Ok(out)
}

fn write_synced(path: &Path, bytes: &[u8]) -> NetResult<()> {
    let mut file = File::create(path).map_err(|e| NetError::io(path, e))?;
    file.write_all(bytes).map_err(|e| NetError::io(path, e))?;
    file.sync_all().map_err(|e| NetError::io(path, e))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn len_u32(len: usize) -> NetResult<u32> {
    u32::try_from(len).map_err(|_| NetError::InvalidConfig(format!("{len} does not fit a u32 field")))
}

fn dim_i32(dim: usize) -> NetResult<i32> {
    i32::try_from(dim).map_err(|_| NetError::InvalidConfig(format!("dimension {dim} does not fit an i32 field")))
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_f64s<'a>(out: &mut Vec<u8>, values: impl IntoIterator<Item = &'a f64>) {
    for v in values {
        put_f64(out, *v);
    }
}

/// Bounds-checked cursor over a checkpoint's bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], path: &'a Path) -> Self {
        Self { bytes, pos: 0, path }
    }

    fn malformed(&self, reason: &str) -> NetError {
        NetError::MalformedCheckpoint {
            path: self.path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> NetResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.malformed(&format!(
                "truncated: needed {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> NetResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> NetResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> NetResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// A non-negative `i32` dimension.
    fn dim(&mut self) -> NetResult<usize> {
        let v = i32::from_be_bytes(self.array()?);
        usize::try_from(v).map_err(|_| self.malformed(&format!("negative dimension {v}")))
    }

    fn f64(&mut self) -> NetResult<f64> {
        Ok(f64::from_be_bytes(self.array()?))
    }

    fn f64s(&mut self, n: usize) -> NetResult<Vec<f64>> {
        (0..n).map(|_| self.f64()).collect()
    }

    fn string(&mut self) -> NetResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.malformed("network name is not UTF-8"))
    }
}
