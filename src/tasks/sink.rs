//! Terminal tasks that persist or consume chunks

use super::{Task, TaskError};
use crate::{chunk::VisChunk, config::Parset};
use byte_slice_cast::AsByteSlice;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Marks the start of every record in a sink file
pub const RECORD_MAGIC: &[u8; 4] = b"VISC";

/// Size in bytes of one record for a chunk of this shape
#[must_use]
pub fn record_len(n_row: usize, n_channel: usize, n_pol: usize) -> usize {
    let header = 4 + 8 + 8 + 3 * 4;
    let per_row = 4 * 4 + 2 * 8 + 3 * 8;
    let cube = n_row * n_channel * n_pol;
    header + n_channel * 8 + n_row * per_row + cube * 8 + cube
}

/// Appends one binary record per chunk to a file.
///
/// Record layout: magic, timestamp (u64), scan id (i64), nrow, nchan, npol
/// (u32), then frequencies, antenna1, antenna2, beam1, beam2, pointing, uvw,
/// visibilities as (re, im) f32 pairs and one flag byte per sample. Integers
/// in the header are little-endian, bulk arrays are in native byte order.
pub struct FileSinkTask {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl FileSinkTask {
    pub fn create(name: impl Into<String>, path: &Path) -> Result<Self, TaskError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "Sink file opened");
        Ok(Self {
            name: name.into(),
            path: path.to_owned(),
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn from_params(name: impl Into<String>, params: &Parset) -> Result<Self, TaskError> {
        let filename: String = params.get_string("filename")?;
        Self::create(name, Path::new(&filename))
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    fn write_chunk(&mut self, chunk: &VisChunk) -> std::io::Result<()> {
        let w = &mut self.writer;
        let dims = [chunk.n_row(), chunk.n_channel(), chunk.n_pol()];
        w.write_all(RECORD_MAGIC)?;
        w.write_all(&chunk.timestamp.to_le_bytes())?;
        w.write_all(&chunk.scan_id.to_le_bytes())?;
        for d in dims {
            let d = u32::try_from(d)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            w.write_all(&d.to_le_bytes())?;
        }
        w.write_all(chunk.frequency.as_byte_slice())?;
        for column in [&chunk.antenna1, &chunk.antenna2, &chunk.beam1, &chunk.beam2] {
            w.write_all(column.as_byte_slice())?;
        }
        let pointing: Vec<f64> = chunk.pointing.iter().flatten().copied().collect();
        w.write_all(pointing.as_byte_slice())?;
        let uvw: Vec<f64> = chunk.uvw.iter().flatten().copied().collect();
        w.write_all(uvw.as_byte_slice())?;
        let vis: Vec<f32> = chunk.visibility.iter().flat_map(|s| [s.re, s.im]).collect();
        w.write_all(vis.as_byte_slice())?;
        let flags: Vec<u8> = chunk.flag.iter().map(|f| u8::from(*f)).collect();
        w.write_all(&flags)?;
        w.flush()
    }
}

impl Task for FileSinkTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        self.write_chunk(chunk)?;
        self.records += 1;
        debug!(path = %self.path.display(), records = self.records, "Chunk written");
        Ok(())
    }
}

/// Swallows chunks, counting them
pub struct NullSinkTask {
    name: String,
    consumed: u64,
}

impl NullSinkTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumed: 0,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Task for NullSinkTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, _chunk: &mut VisChunk) -> Result<(), TaskError> {
        self.consumed += 1;
        Ok(())
    }
}
