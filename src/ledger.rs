//! Failed-chunk ledger
//!
//! A JSON array of `{index, error}` records written at the end of a run that
//! had failures, and read back by `--resume-failed` to pick which chunks to
//! try again.

use crate::chunk::Chunk;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChunk {
    pub index: usize,
    pub error: String,
}

impl FailedChunk {
    pub fn new(index: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            error: error.into(),
        }
    }
}

/// Write the ledger, replacing any previous one.
pub fn save(path: &Path, failed: &[FailedChunk]) -> Result<()> {
    let content = serde_json::to_string_pretty(failed)?;
    write_atomic(path, &content)
        .with_context(|| format!("Failed to write failed-chunks file {}", path.display()))
}

pub fn load(path: &Path) -> Result<Vec<FailedChunk>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read failed-chunks file {}", path.display()))?;
    let failed: Vec<FailedChunk> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid failed-chunks file {}", path.display()))?;
    Ok(failed)
}

/// Keep only the chunks the ledger names, with their original indices.
///
/// Indices past the end of the rebuilt work list are skipped with a warning;
/// duplicates are collapsed.
pub fn select_chunks(all: Vec<Chunk>, failed: &[FailedChunk]) -> Vec<Chunk> {
    let total = all.len();
    let wanted: BTreeSet<usize> = failed.iter().map(|f| f.index).collect();
    for index in wanted.iter().filter(|i| **i >= total) {
        tracing::warn!(chunk = index, total, "failed chunk index is out of range, skipping");
    }
    all.into_iter()
        .filter(|chunk| wanted.contains(&chunk.index))
        .collect()
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkSequence;

    fn chunks(n: usize) -> Vec<Chunk> {
        let body: String = (0..n).map(|i| format!("line {}\n", i)).collect();
        let mut seq = ChunkSequence::new();
        seq.push_unit(&body, 1, "go", None);
        seq.into_vec()
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_chunks.json");
        let failed = vec![
            FailedChunk::new(1, "review: context deadline exceeded after 5s"),
            FailedChunk::new(4, "test generation: local returned status 500: oops"),
        ];

        save(&path, &failed).unwrap();
        assert_eq!(load(&path).unwrap(), failed);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.json");
        save(&path, &[FailedChunk::new(1, "boom")]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!([{ "index": 1, "error": "boom" }]));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.json");
        fs::write(&path, "{not json").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid failed-chunks file"));
    }

    #[test]
    fn test_select_keeps_original_indices() {
        let failed = vec![
            FailedChunk::new(3, "a"),
            FailedChunk::new(1, "b"),
            FailedChunk::new(3, "c"),
        ];
        let selected = select_chunks(chunks(5), &failed);
        let indices: Vec<usize> = selected.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(selected[1].text, "line 3\n");
    }

    #[test]
    fn test_select_skips_out_of_range() {
        let failed = vec![FailedChunk::new(0, "a"), FailedChunk::new(99, "b")];
        let selected = select_chunks(chunks(2), &failed);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].index, 0);
    }
}
