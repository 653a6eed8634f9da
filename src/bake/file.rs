//! Probe file I/O.
//!
//! Layout (little-endian):
//!
//! ```text
//! [i32 dim_x][i32 dim_y][i32 dim_z]
//! repeated: [u64 byte_size][byte_size bytes of RGBA32F texels]
//! ```
//!
//! Records are appended in linear grid order. End of file means no more
//! probes; a record cut short by an interrupted write is ignored and
//! truncated away before the next append.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
#[cfg(feature = "mmap")]
use memmap2::Mmap;

use crate::util::{Error, Result};

/// Bytes of the `[i32; 3]` grid header.
pub const PROBE_HEADER_SIZE: u64 = 12;

enum Storage {
    #[cfg(feature = "mmap")]
    Mmap(Mmap),
    Bytes(Vec<u8>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            #[cfg(feature = "mmap")]
            Storage::Mmap(m) => &m[..],
            Storage::Bytes(b) => &b[..],
        }
    }
}

/// Read-only view of an existing probe file.
pub struct ProbeFileReader {
    storage: Storage,
    dims: Option<[i32; 3]>,
    records: Vec<Range<usize>>,
    valid_len: u64,
}

impl ProbeFileReader {
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let size = file.metadata()?.len();
        let storage = Self::load(file, size)?;
        Self::parse(storage)
    }

    #[cfg(feature = "mmap")]
    fn load(file: File, size: u64) -> Result<Storage> {
        if size == 0 {
            return Ok(Storage::Bytes(Vec::new()));
        }
        // Safety: read-only mapping; the baker only appends after the reader is dropped.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MmapFailed(e.to_string()))?;
        Ok(Storage::Mmap(mmap))
    }

    #[cfg(not(feature = "mmap"))]
    fn load(mut file: File, size: u64) -> Result<Storage> {
        use std::io::Read;
        let mut bytes = Vec::with_capacity(size as usize);
        file.read_to_end(&mut bytes)?;
        Ok(Storage::Bytes(bytes))
    }

    fn parse(storage: Storage) -> Result<Self> {
        let data = storage.bytes();
        let len = data.len() as u64;
        if len == 0 {
            return Ok(Self {
                storage,
                dims: None,
                records: Vec::new(),
                valid_len: 0,
            });
        }
        if len < PROBE_HEADER_SIZE {
            return Err(Error::UnexpectedEof(len));
        }

        let mut cur = Cursor::new(data);
        let mut dims = [0i32; 3];
        cur.read_i32_into::<LittleEndian>(&mut dims)?;

        let mut records = Vec::new();
        let mut pos = PROBE_HEADER_SIZE;
        while pos + 8 <= len {
            cur.set_position(pos);
            let size = cur.read_u64::<LittleEndian>()?;
            let start = pos + 8;
            let Some(end) = start.checked_add(size).filter(|&end| end <= len) else {
                tracing::warn!(record = records.len(), size, "ignoring truncated probe record");
                break;
            };
            records.push(start as usize..end as usize);
            pos = end;
        }
        if pos < len {
            tracing::debug!(trailing = len - pos, "probe file has a torn tail");
        }

        Ok(Self {
            storage,
            dims: Some(dims),
            records,
            valid_len: pos,
        })
    }

    /// Grid dimensions from the header; `None` for an empty file.
    pub fn dims(&self) -> Option<[i32; 3]> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Raw texel bytes of record `idx`.
    pub fn record(&self, idx: usize) -> Option<&[u8]> {
        let range = self.records.get(idx)?.clone();
        self.storage.bytes().get(range)
    }

    pub fn records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.records.len()).filter_map(move |i| self.record(i))
    }

    /// Length of the header plus all complete records.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }
}

/// Appends probe records, flushing after each one.
pub struct ProbeFileWriter {
    out: BufWriter<File>,
    path: PathBuf,
    written: usize,
}

impl ProbeFileWriter {
    /// Start a new file holding only the header.
    pub fn create(path: impl AsRef<Path>, dims: [i32; 3]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut out = BufWriter::new(file);
        for d in dims {
            out.write_i32::<LittleEndian>(d)?;
        }
        out.flush()?;
        Ok(Self { out, path, written: 0 })
    }

    /// Continue an existing file after its first `valid_len` bytes, dropping
    /// any partial record beyond them.
    pub fn append(path: impl AsRef<Path>, valid_len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().write(true).open(&path)?;
        if file.metadata()?.len() != valid_len {
            tracing::warn!(valid_len, "truncating partial probe record");
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::Start(valid_len))?;
        Ok(Self {
            out: BufWriter::new(file),
            path,
            written: 0,
        })
    }

    /// Write one `(size, bytes)` record and flush it to the file.
    pub fn write_record(&mut self, texels: &[u8]) -> Result<()> {
        self.out.write_u64::<LittleEndian>(texels.len() as u64)?;
        self.out.write_all(texels)?;
        self.out.flush()?;
        self.written += 1;
        Ok(())
    }

    /// Records written through this writer.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.bin");
        let a: Vec<u8> = (0..64).collect();
        let b = vec![7u8; 16];

        let mut w = ProbeFileWriter::create(&path, [3, 3, 3]).unwrap();
        w.write_record(&a).unwrap();
        w.write_record(&b).unwrap();
        assert_eq!(w.written(), 2);
        drop(w);

        let r = ProbeFileReader::open(&path).unwrap();
        assert_eq!(r.dims(), Some([3, 3, 3]));
        assert_eq!(r.len(), 2);
        assert_eq!(r.record(0).unwrap(), a.as_slice());
        assert_eq!(r.record(1).unwrap(), b.as_slice());
        assert_eq!(r.valid_len(), 12 + 8 + 64 + 8 + 16);
    }

    #[test]
    fn test_torn_record_truncated_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.bin");
        let mut w = ProbeFileWriter::create(&path, [2, 1, 1]).unwrap();
        w.write_record(&[1u8; 32]).unwrap();
        drop(w);

        // Simulate a crash halfway through the second record.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&32u64.to_le_bytes());
        bytes.extend_from_slice(&[2u8; 10]);
        std::fs::write(&path, &bytes).unwrap();

        let r = ProbeFileReader::open(&path).unwrap();
        assert_eq!(r.len(), 1);
        let valid = r.valid_len();
        drop(r);

        let mut w = ProbeFileWriter::append(&path, valid).unwrap();
        w.write_record(&[3u8; 32]).unwrap();
        drop(w);

        let r = ProbeFileReader::open(&path).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.record(1).unwrap(), &[3u8; 32]);
    }

    #[test]
    fn test_short_header_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(matches!(ProbeFileReader::open(&path), Err(Error::UnexpectedEof(3))));

        std::fs::write(&path, b"").unwrap();
        let r = ProbeFileReader::open(&path).unwrap();
        assert!(r.dims().is_none());
        assert!(r.is_empty());
    }
}
