/// On-disk checkpoint for a [`VectorIndex`](super::VectorIndex).
///
/// A checkpoint is two files next to each other:
///
/// - `<base>.index`: the magic `KRIX`, a little-endian CRC32 of the payload,
///   then the bincode-encoded [`IndexBlob`] (vectors, models, insertion
///   sequence numbers, in position order).
/// - `<base>.meta.json`: a JSON sidecar with the keys in the same order.
///
/// Older sidecars are accepted too: a bare JSON array of keys, or an
/// `{"id_to_key": {"0": "key", ...}}` map. A missing or unreadable sidecar
/// does not fail the load; keys are reconstructed as `unknown_{i}`.
///
/// Both files are written to a temporary sibling first and renamed into
/// place.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::backend::IndexKind;
use crate::error::{RecallError, RecallResult};
use crate::persistence::write_atomic;

const MAGIC: &[u8; 4] = b"KRIX";
const HEADER_LEN: usize = 8;

/// Current blob format version.
pub const FORMAT_VERSION: u32 = 1;

/// Serialized index contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexBlob {
    pub format: u32,
    pub kind: IndexKind,
    pub dimension: usize,
    /// Live vectors in position order
    pub vectors: Vec<Vec<f32>>,
    pub models: Vec<String>,
    /// Insertion sequence numbers, parallel to `vectors`
    pub seqs: Vec<u64>,
}

impl IndexBlob {
    /// Number of vectors in the blob.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Whether the blob holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

/// Key sidecar written next to the blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSidecar {
    pub keys: Vec<String>,
    pub vector_count: usize,
    pub dimension: usize,
    pub index_type: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SidecarFormat {
    Current(IndexSidecar),
    IdMap { id_to_key: HashMap<String, String> },
    Keys(Vec<String>),
}

impl SidecarFormat {
    /// Keys for a blob of `count` vectors. Map entries whose id is not a
    /// position in the blob are dropped.
    fn into_keys(self, count: usize) -> Vec<String> {
        match self {
            SidecarFormat::Current(sidecar) => sidecar.keys,
            SidecarFormat::Keys(keys) => keys,
            SidecarFormat::IdMap { id_to_key } => {
                let mut keys: Vec<String> = (0..count).map(unknown_key).collect();
                let mut dropped = 0;
                for (id, key) in id_to_key {
                    match id.parse::<usize>() {
                        Ok(position) if position < count => keys[position] = key,
                        _ => dropped += 1,
                    }
                }
                if dropped > 0 {
                    warn!(dropped, vectors = count, "Ignored sidecar ids outside the index");
                }
                keys
            }
        }
    }
}

/// A decoded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub blob: IndexBlob,
    /// One key per vector
    pub keys: Vec<String>,
    /// How many keys had to be invented
    pub reconstructed_keys: usize,
}

/// Placeholder key for a vector whose key was lost.
pub fn unknown_key(position: usize) -> String {
    format!("unknown_{position}")
}

/// Path of the vector blob for a checkpoint base path.
pub fn index_path(base: &Path) -> PathBuf {
    with_suffix(base, ".index")
}

/// Path of the key sidecar for a checkpoint base path.
pub fn meta_path(base: &Path) -> PathBuf {
    with_suffix(base, ".meta.json")
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Encode a blob with magic and checksum.
pub fn encode_blob(blob: &IndexBlob) -> RecallResult<Vec<u8>> {
    let payload = bincode::serialize(blob)
        .map_err(|e| RecallError::PersistenceFailure(format!("Failed to encode index: {e}")))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode and verify a blob.
pub fn decode_blob(bytes: &[u8]) -> RecallResult<IndexBlob> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(RecallError::CorruptCheckpoint(
            "missing index header".to_string(),
        ));
    }
    let expected = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let payload = &bytes[HEADER_LEN..];
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(RecallError::CorruptCheckpoint(format!(
            "checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }

    let blob: IndexBlob = bincode::deserialize(payload)
        .map_err(|e| RecallError::CorruptCheckpoint(format!("Failed to decode index: {e}")))?;
    if blob.format > FORMAT_VERSION {
        return Err(RecallError::CorruptCheckpoint(format!(
            "unsupported format version {}",
            blob.format
        )));
    }
    if blob.models.len() != blob.vectors.len() || blob.seqs.len() != blob.vectors.len() {
        return Err(RecallError::CorruptCheckpoint(
            "vector, model and sequence counts differ".to_string(),
        ));
    }
    if let Some(bad) = blob.vectors.iter().find(|v| v.len() != blob.dimension) {
        return Err(RecallError::CorruptCheckpoint(format!(
            "vector of dimension {} in a {}-dimensional index",
            bad.len(),
            blob.dimension
        )));
    }
    Ok(blob)
}

/// Parse a sidecar in any accepted format, for a blob of `count` vectors.
pub fn parse_sidecar(bytes: &[u8], count: usize) -> RecallResult<Vec<String>> {
    let format: SidecarFormat = serde_json::from_slice(bytes)?;
    Ok(format.into_keys(count))
}

/// Write a checkpoint atomically (per file).
pub async fn write(base: &Path, blob: &IndexBlob, keys: &[String]) -> RecallResult<()> {
    let sidecar = IndexSidecar {
        keys: keys.to_vec(),
        vector_count: blob.len(),
        dimension: blob.dimension,
        index_type: blob.kind.as_str().to_string(),
    };

    write_atomic(&index_path(base), &encode_blob(blob)?).await?;
    write_atomic(&meta_path(base), &serde_json::to_vec_pretty(&sidecar)?).await?;
    debug!(path = %base.display(), vectors = blob.len(), "Wrote index checkpoint");
    Ok(())
}

/// Read a checkpoint. `Ok(None)` when no blob exists at `base`.
pub async fn read(base: &Path) -> RecallResult<Option<Checkpoint>> {
    let bytes = match fs::read(index_path(base)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RecallError::Io(e)),
    };
    let blob = decode_blob(&bytes)?;

    let keys = match fs::read(meta_path(base)).await {
        Ok(meta) => match parse_sidecar(&meta, blob.len()) {
            Ok(keys) => Some(keys),
            Err(e) => {
                warn!(path = %base.display(), error = %e, "Index sidecar unreadable, reconstructing keys");
                None
            }
        },
        Err(e) => {
            warn!(path = %base.display(), error = %e, "Index sidecar missing, reconstructing keys");
            None
        }
    };

    let (keys, reconstructed_keys) = align_keys(keys, blob.len());
    if reconstructed_keys > 0 {
        warn!(
            path = %base.display(),
            reconstructed = reconstructed_keys,
            "Restored index with placeholder keys"
        );
    }
    Ok(Some(Checkpoint {
        blob,
        keys,
        reconstructed_keys,
    }))
}

/// Make the key list match the blob's vector count.
fn align_keys(keys: Option<Vec<String>>, count: usize) -> (Vec<String>, usize) {
    let mut keys = keys.unwrap_or_default();
    if keys.len() != count {
        warn!(
            keys = keys.len(),
            vectors = count,
            "Index sidecar key count does not match vector count"
        );
    }
    keys.truncate(count);
    let mut reconstructed = 0;
    for position in keys.len()..count {
        keys.push(unknown_key(position));
        reconstructed += 1;
    }
    (keys, reconstructed)
}
