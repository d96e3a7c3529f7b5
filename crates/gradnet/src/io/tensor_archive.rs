//! On-disk name-to-tensor mapping used by parameter persistence.
//!
//! Layout: magic, version, a bincode-encoded sorted index, then raw
//! little-endian payloads. The index stores absolute payload offsets so a
//! reader can fetch single tensors without scanning the file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::tensor::{DType, Shape, Tensor};

const MAGIC: &[u8; 8] = b"GNETTENS";
const VERSION: u32 = 1;

#[derive(Clone, Debug)]
pub struct TensorArchiveEntry {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: DType,
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ArchiveIndex {
    entries: Vec<ArchiveIndexEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ArchiveIndexEntry {
    name: String,
    dims: Vec<u64>,
    dtype_tag: u32,
    offset: u64,
    len: u64,
}

pub struct TensorArchiveReader {
    file: File,
    entries: Vec<TensorArchiveEntry>,
    by_name: BTreeMap<String, usize>,
}

impl TensorArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            bail!("invalid tensor archive magic header");
        }

        let version = read_u32(&mut file)?;
        if version != VERSION {
            bail!("unsupported tensor archive version {}", version);
        }

        let index_len = read_u32(&mut file)? as usize;
        let mut index_bytes = vec![0u8; index_len];
        file.read_exact(&mut index_bytes)?;
        let index: ArchiveIndex = bincode::deserialize(&index_bytes)?;

        let mut entries = Vec::with_capacity(index.entries.len());
        let mut by_name = BTreeMap::new();
        for (i, e) in index.entries.into_iter().enumerate() {
            let dtype = DType::from_tag(e.dtype_tag)
                .ok_or_else(|| anyhow!("unknown dtype tag {} in tensor archive", e.dtype_tag))?;
            let dims = e
                .dims
                .into_iter()
                .map(|d| usize::try_from(d).map_err(|_| anyhow!("tensor {} dim overflow", e.name)))
                .collect::<Result<Vec<_>>>()?;
            by_name.insert(e.name.clone(), i);
            entries.push(TensorArchiveEntry {
                name: e.name,
                dims,
                dtype,
                offset: e.offset,
                len: e.len,
            });
        }

        Ok(Self {
            file,
            entries,
            by_name,
        })
    }

    pub fn entries(&self) -> &[TensorArchiveEntry] {
        &self.entries
    }

    pub fn get(&mut self, name: &str) -> Result<Tensor> {
        let idx = *self
            .by_name
            .get(name)
            .ok_or_else(|| anyhow!("tensor '{}' not found in archive", name))?;
        let entry = self.entries[idx].clone();
        self.read_entry(&entry)
    }

    pub fn get_entry(&mut self, entry: &TensorArchiveEntry) -> Result<Tensor> {
        self.read_entry(entry)
    }

    fn read_entry(&mut self, entry: &TensorArchiveEntry) -> Result<Tensor> {
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let byte_len = entry.len as usize;
        let mut raw = vec![0u8; byte_len];
        self.file.read_exact(&mut raw)?;

        ensure!(
            byte_len % 4 == 0,
            "tensor {} data size misaligned",
            entry.name
        );
        let shape = Shape::new(entry.dims.clone());
        match entry.dtype {
            DType::F32 => {
                let mut data = Vec::with_capacity(byte_len / 4);
                for chunk in raw.chunks_exact(4) {
                    data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                Tensor::from_vec(shape, data)
            }
            DType::I32 => {
                let mut data = Vec::with_capacity(byte_len / 4);
                for chunk in raw.chunks_exact(4) {
                    data.push(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                Tensor::from_i32(shape, data)
            }
        }
    }
}

pub struct TensorArchive;

impl TensorArchive {
    pub fn load(path: impl AsRef<Path>) -> Result<BTreeMap<String, Tensor>> {
        let mut reader = TensorArchiveReader::open(path)?;
        let entries = reader.entries().to_vec();
        let mut tensors = BTreeMap::new();
        for entry in entries {
            let tensor = reader.get_entry(&entry)?;
            tensors.insert(entry.name.clone(), tensor);
        }
        Ok(tensors)
    }

    /// Writes the mapping with keys in sorted order.
    pub fn save(path: impl AsRef<Path>, tensors: &BTreeMap<String, Tensor>) -> Result<()> {
        let mut index_entries: Vec<ArchiveIndexEntry> = Vec::with_capacity(tensors.len());
        let mut running_offset: u64 = 0;
        for (name, tensor) in tensors {
            let dtype = tensor.dtype();
            let len = (tensor.len() * dtype.size_in_bytes()) as u64;
            index_entries.push(ArchiveIndexEntry {
                name: name.clone(),
                dims: tensor.shape().dims().iter().map(|&d| d as u64).collect(),
                dtype_tag: dtype.tag(),
                offset: running_offset,
                len,
            });
            running_offset = running_offset
                .checked_add(len)
                .ok_or_else(|| anyhow!("tensor archive data offset overflow"))?;
        }

        // Serialize once to learn the index size, then fix up offsets to be
        // absolute. The length stays stable because only u64 values change.
        let mut index = ArchiveIndex {
            entries: index_entries,
        };
        let index_len = bincode::serialize(&index)?.len();
        ensure!(
            index_len <= u32::MAX as usize,
            "tensor archive index too large"
        );
        let data_start = (MAGIC.len() + 4 + 4 + index_len) as u64;
        for entry in index.entries.iter_mut() {
            entry.offset = entry
                .offset
                .checked_add(data_start)
                .ok_or_else(|| anyhow!("tensor archive offset overflow"))?;
        }
        let index_bytes = bincode::serialize(&index)?;
        ensure!(
            index_bytes.len() == index_len,
            "tensor archive index length mismatch after offset fixup"
        );

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&(index_len as u32).to_le_bytes())?;
        writer.write_all(&index_bytes)?;

        for tensor in tensors.values() {
            match tensor.dtype() {
                DType::F32 => {
                    for &value in tensor.data() {
                        writer.write_all(&value.to_le_bytes())?;
                    }
                }
                DType::I32 => {
                    for &value in tensor.data_i32() {
                        writer.write_all(&value.to_le_bytes())?;
                    }
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn reader(path: impl AsRef<Path>) -> Result<TensorArchiveReader> {
        TensorArchiveReader::open(path)
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
