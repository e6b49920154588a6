use crate::parser::Chunk;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

/// On-disk layout of `chunks.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreData {
    pub chunks: Vec<Chunk>,
    /// Content hashes of indexed files, for skipping unchanged files
    #[serde(default)]
    pub files: HashMap<String, FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub hash: String,
    pub chunk_count: usize,
    pub indexed_at: u64,
}

/// Flat-file collection of chunks. Chunks of one file are always replaced as a
/// group: old ones are purged before new ones go in.
pub struct ChunkStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl ChunkStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            data: RwLock::new(StoreData::default()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        if self.path.exists() {
            let raw = fs::read_to_string(&self.path).await?;
            let data: StoreData = serde_json::from_str(&raw)?;
            tracing::info!("Loaded {} chunks from {}", data.chunks.len(), self.path.display());
            *self.data.write().await = data;
        }
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let data = self.data.read().await;
        let raw = serde_json::to_string(&*data)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&self.path, raw).await?;
        Ok(())
    }

    /// Embedding length shared by the whole store, fixed by the first stored vector
    pub async fn dimension(&self) -> Option<usize> {
        let data = self.data.read().await;
        dimension_of(&data.chunks)
    }

    pub async fn file_hash(&self, path: &str) -> Option<String> {
        self.data.read().await.files.get(path).map(|e| e.hash.clone())
    }

    /// Replace every chunk of `path` with `chunks`. Embeddings whose length
    /// disagrees with the store dimension are dropped.
    pub async fn replace_file(&self, path: &str, hash: String, mut chunks: Vec<Chunk>) {
        let mut data = self.data.write().await;
        data.chunks.retain(|c| c.file_path != path);

        let mut dimension = dimension_of(&data.chunks);
        for chunk in &mut chunks {
            let Some(len) = chunk.embedding.as_ref().map(Vec::len) else {
                continue;
            };
            match dimension {
                None => dimension = Some(len),
                Some(expected) if expected != len => {
                    tracing::warn!(
                        "Dropping embedding of {} ({}): dimension {} != {}",
                        chunk.name,
                        path,
                        len,
                        expected
                    );
                    chunk.embedding = None;
                }
                Some(_) => {}
            }
        }

        data.files.insert(
            path.to_string(),
            FileEntry {
                hash,
                chunk_count: chunks.len(),
                indexed_at: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            },
        );
        data.chunks.extend(chunks);
    }

    /// Purge every chunk of `path`; returns how many were removed
    pub async fn remove_file(&self, path: &str) -> usize {
        let mut data = self.data.write().await;
        let before = data.chunks.len();
        data.chunks.retain(|c| c.file_path != path);
        data.files.remove(path);
        before - data.chunks.len()
    }

    pub async fn chunks(&self) -> Vec<Chunk> {
        self.data.read().await.chunks.clone()
    }

    pub async fn chunks_for_file(&self, path: &str) -> Vec<Chunk> {
        self.data
            .read()
            .await
            .chunks
            .iter()
            .filter(|c| c.file_path == path)
            .cloned()
            .collect()
    }

    pub async fn indexed_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.data.read().await.files.keys().cloned().collect();
        files.sort();
        files
    }

    /// (chunks, embedded chunks, files)
    pub async fn stats(&self) -> (usize, usize, usize) {
        let data = self.data.read().await;
        let embedded = data.chunks.iter().filter(|c| c.embedding.is_some()).count();
        (data.chunks.len(), embedded, data.files.len())
    }

    pub async fn clear(&self) {
        let mut data = self.data.write().await;
        data.chunks.clear();
        data.files.clear();
    }
}

fn dimension_of(chunks: &[Chunk]) -> Option<usize> {
    chunks
        .iter()
        .find_map(|c| c.embedding.as_ref().map(Vec::len))
}
