use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use voicemesh_common::ClusterError;

/// Side-file holding the voice metadata next to the embedding blob.
pub const VOICE_SIDE_FILE: &str = "voice.json";

/// Per-voice artifact storage: one directory per voice id holding an
/// engine-opaque embedding blob plus a JSON side-file. Written on extract,
/// read on synthesize. Atomicity is best-effort; voices are re-extractable.
#[derive(Debug, Clone)]
pub struct VoiceStore {
    root: PathBuf,
}

impl VoiceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn voice_dir(&self, voice_id: &str) -> PathBuf {
        self.root.join(voice_id)
    }

    fn map_io(voice_id: &str, err: std::io::Error) -> ClusterError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ClusterError::VoiceNotFound(voice_id.to_string())
        } else {
            ClusterError::EngineError(format!("voice store I/O failure: {err}"))
        }
    }

    pub async fn save_blob(
        &self,
        voice_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ClusterError> {
        let dir = self.voice_dir(voice_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::map_io(voice_id, e))?;
        let path = dir.join(file_name);
        fs::write(&path, bytes)
            .await
            .map_err(|e| Self::map_io(voice_id, e))?;
        debug!(voice_id = %voice_id, file = %file_name, bytes = bytes.len(), "Voice blob written");
        Ok(path)
    }

    pub async fn load_blob(&self, voice_id: &str, file_name: &str) -> Result<Vec<u8>, ClusterError> {
        fs::read(self.voice_dir(voice_id).join(file_name))
            .await
            .map_err(|e| Self::map_io(voice_id, e))
    }

    pub async fn save_json<T: Serialize>(
        &self,
        voice_id: &str,
        value: &T,
    ) -> Result<(), ClusterError> {
        let dir = self.voice_dir(voice_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::map_io(voice_id, e))?;
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| ClusterError::EngineError(format!("voice metadata encode: {e}")))?;
        fs::write(dir.join(VOICE_SIDE_FILE), body)
            .await
            .map_err(|e| Self::map_io(voice_id, e))
    }

    pub async fn load_json<T: DeserializeOwned>(&self, voice_id: &str) -> Result<T, ClusterError> {
        let body = fs::read(self.voice_dir(voice_id).join(VOICE_SIDE_FILE))
            .await
            .map_err(|e| Self::map_io(voice_id, e))?;
        serde_json::from_slice(&body)
            .map_err(|e| ClusterError::EngineError(format!("voice metadata decode: {e}")))
    }

    pub async fn exists(&self, voice_id: &str) -> bool {
        fs::try_exists(self.voice_dir(voice_id).join(VOICE_SIDE_FILE))
            .await
            .unwrap_or(false)
    }
}
