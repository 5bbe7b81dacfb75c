//! The layered manifest format.
//!
//! On-disk layout, in order:
//!
//! ```text
//! H_mfn: data_box( be32(index_total) )        data overhead + 4 bytes
//! H_idx: index_box( be32(index_payload) )     sym overhead + 4 bytes
//! Idx:   index_box( zstd(json(blob names)) )  index_payload bytes
//! Body:  data_box( zstd(json(manifest map)) ) remainder of file
//! ```
//!
//! A holder of the content secret can read the index (the sorted set of
//! chunk names) without learning any filenames; a holder of the data box
//! can use the outer length prefix to skip straight to the body. The index
//! is sorted and de-duplicated, so it reveals which chunks a backup
//! references but not which file any chunk belongs to.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{DataBox, SecretBox, SYM_OVERHEAD};
use crate::error::{Error, Result};

pub const MANIFEST_SUFFIX: &str = ".mfn";

const LEN_FIELD: usize = 4;

/// One archived file: its chunk names in source order, plus timestamps.
///
/// Concatenating the chunk plaintexts in order and zstd-decompressing the
/// result reproduces the original file byte for byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub blobs: Vec<String>,
    pub atime: f64,
    pub mtime: f64,
}

/// Archived path → entry. A BTreeMap so serialization is deterministic for
/// a given input set.
pub type Manifest = BTreeMap<String, FileEntry>;

/// The sorted, de-duplicated set of every chunk name the manifest
/// references.
pub fn manifest_index(manifest: &Manifest) -> Vec<String> {
    let names: BTreeSet<&str> = manifest
        .values()
        .flat_map(|entry| entry.blobs.iter().map(String::as_str))
        .collect();
    names.into_iter().map(str::to_owned).collect()
}

/// Serialize and encrypt a manifest into the four-section layout.
pub fn encode_manifest(
    manifest: &Manifest,
    data_box: &DataBox,
    index_box: &SecretBox,
    level: i32,
) -> Result<Vec<u8>> {
    let index_json = serde_json::to_vec(&manifest_index(manifest))
        .map_err(|e| Error::Codec(format!("index json: {e}")))?;
    let idx = index_box.encrypt(&codec::compress(&index_json, level)?)?;
    let h_idx = index_box.encrypt(&(idx.len() as u32).to_be_bytes())?;

    let index_total = (h_idx.len() + idx.len()) as u32;
    let h_mfn = data_box.encrypt(&index_total.to_be_bytes())?;

    let body_json = serde_json::to_vec(manifest)
        .map_err(|e| Error::Codec(format!("manifest json: {e}")))?;
    let body = data_box.encrypt(&codec::compress(&body_json, level)?)?;

    let mut out = Vec::with_capacity(h_mfn.len() + h_idx.len() + idx.len() + body.len());
    out.extend_from_slice(&h_mfn);
    out.extend_from_slice(&h_idx);
    out.extend_from_slice(&idx);
    out.extend_from_slice(&body);
    Ok(out)
}

fn be32(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; LEN_FIELD] = bytes
        .try_into()
        .map_err(|_| Error::Codec("manifest length field has the wrong size".into()))?;
    Ok(u32::from_be_bytes(arr))
}

/// Read only the manifest body: decrypt the outer length prefix, skip the
/// index in one seek, decrypt the remainder.
pub fn read_manifest_body(path: &Path, data_box: &DataBox) -> Result<Manifest> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;

    let mut header = vec![0u8; data_box.overhead() + LEN_FIELD];
    file.read_exact(&mut header).map_err(|e| Error::io(path, e))?;
    let index_total = be32(&data_box.decrypt(&header)?)?;

    file.seek(SeekFrom::Current(i64::from(index_total)))
        .map_err(|e| Error::io(path, e))?;
    let mut body = Vec::new();
    file.read_to_end(&mut body).map_err(|e| Error::io(path, e))?;

    let json = codec::decompress(&data_box.decrypt(&body)?)?;
    serde_json::from_slice(&json).map_err(|e| Error::Codec(format!("manifest json: {e}")))
}

/// Read only the index. Requires just the index box; the data-box section
/// is skipped by size, so `data_overhead` must match the key mode the
/// manifest was written under.
pub fn read_manifest_index(
    path: &Path,
    index_box: &SecretBox,
    data_overhead: usize,
) -> Result<Vec<String>> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    file.seek(SeekFrom::Start((data_overhead + LEN_FIELD) as u64))
        .map_err(|e| Error::io(path, e))?;

    let mut header = vec![0u8; SYM_OVERHEAD + LEN_FIELD];
    file.read_exact(&mut header).map_err(|e| Error::io(path, e))?;
    let payload_len = be32(&index_box.decrypt(&header)?)?;

    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload).map_err(|e| Error::io(path, e))?;

    let json = codec::decompress(&index_box.decrypt(&payload)?)?;
    serde_json::from_slice(&json).map_err(|e| Error::Codec(format!("index json: {e}")))
}
