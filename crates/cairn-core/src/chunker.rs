//! Splits a file's zstd-compressed stream into fixed-size plaintext chunks.
//!
//! Compression happens before chunking, so one zstd frame spans the whole
//! file: when a file only grows at the end, its head chunks keep their
//! bytes (and therefore their names) across backups, and deduplication
//! does the rest.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Lazy, finite iterator of compressed plaintext chunks. Owns the open
/// input file and the streaming compressor state; chunk production within
/// one file is strictly sequential.
pub struct ChunkIter {
    encoder: Option<zstd::stream::read::Encoder<'static, BufReader<File>>>,
    path: PathBuf,
    chunk_size: usize,
}

impl ChunkIter {
    pub fn open(path: &Path, chunk_size: usize, level: i32) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        // A zero-byte file compresses to a non-empty frame; it must instead
        // produce no chunks at all and round-trip as an empty blob list.
        let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
        let encoder = if len == 0 {
            None
        } else {
            Some(
                zstd::stream::read::Encoder::new(file, level)
                    .map_err(|e| Error::io(path, e))?,
            )
        };
        Ok(ChunkIter {
            encoder,
            path: path.to_path_buf(),
            chunk_size,
        })
    }

    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        const READ_STEP: usize = 128 * 1024;

        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(None);
        };
        // The encoder returns short reads; a chunk boundary is only reached
        // at exactly chunk_size bytes or end of stream. The buffer grows in
        // steps so small files never pay for a full chunk allocation.
        let mut buf = Vec::new();
        while buf.len() < self.chunk_size {
            let want = (self.chunk_size - buf.len()).min(READ_STEP);
            let start = buf.len();
            buf.resize(start + want, 0);
            let n = encoder
                .read(&mut buf[start..])
                .map_err(|e| Error::io(&self.path, e))?;
            buf.truncate(start + n);
            if n == 0 {
                self.encoder = None;
                break;
            }
        }
        if buf.is_empty() {
            // The stream ended exactly on the previous chunk boundary.
            return Ok(None);
        }
        Ok(Some(buf))
    }
}

impl Iterator for ChunkIter {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_chunk().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunks_of(contents: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, contents).unwrap();
        ChunkIter::open(&path, chunk_size, 3)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn empty_file_yields_no_chunks() {
        assert!(chunks_of(b"", 4096).is_empty());
    }

    #[test]
    fn small_file_yields_one_chunk() {
        let chunks = chunks_of(b"aaaabbbb", 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(zstd::decode_all(Cursor::new(&chunks[0])).unwrap(), b"aaaabbbb");
    }

    #[test]
    fn chunks_concatenate_to_the_compressed_stream() {
        // Incompressible input, so the compressed stream is comfortably
        // larger than the chunk size.
        let data: Vec<u8> = (0u32..40_000).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let chunks = chunks_of(&data, 4096);
        assert!(chunks.len() > 1);
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.len(), 4096);
        }
        assert!(chunks.last().unwrap().len() <= 4096);

        let stream: Vec<u8> = chunks.concat();
        assert_eq!(zstd::decode_all(Cursor::new(&stream)).unwrap(), data);
    }

    #[test]
    fn exact_multiple_produces_no_empty_tail_chunk() {
        // Probe the compressed size first, then re-chunk with exactly that
        // size: the terminating zero-length read must not become a chunk.
        let data: Vec<u8> = (0u32..10_000).map(|i| (i.wrapping_mul(40503) >> 7) as u8).collect();
        let whole = chunks_of(&data, 1 << 20).concat();
        let chunks = chunks_of(&data, whole.len());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), whole.len());
    }
}
