//! Engine adapters. A worker holds exactly one adapter, chosen at boot;
//! dispatch is static per process. Every adapter satisfies the same
//! capability set: load, unload, synthesize, extract_voice.

mod openvoice;
mod sovits;
mod xtts;

pub use openvoice::OpenVoiceEngine;
pub use sovits::SovitsBridge;
pub use xtts::XttsEngine;

use sha2::{Digest, Sha256};

use voicemesh_common::{ClusterError, EngineKind, SynthesizeRequest, VoiceInfo};

use crate::config::EngineConfig;
use crate::voices::VoiceStore;

/// The engine bound to this worker process.
pub enum Engine {
    Xtts(XttsEngine),
    OpenVoice(OpenVoiceEngine),
    GptSovits(SovitsBridge),
}

impl Engine {
    pub fn from_config(kind: EngineKind, config: &EngineConfig, store: VoiceStore) -> Engine {
        match kind {
            EngineKind::Xtts => Engine::Xtts(XttsEngine::new(
                config.model_path.clone(),
                config.device.clone(),
                store,
            )),
            EngineKind::OpenVoice => Engine::OpenVoice(OpenVoiceEngine::new(
                config.model_path.clone(),
                config.device.clone(),
                store,
            )),
            EngineKind::GptSovits => {
                Engine::GptSovits(SovitsBridge::new(config.sovits_api_url.clone(), store))
            }
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Xtts(_) => EngineKind::Xtts,
            Engine::OpenVoice(_) => EngineKind::OpenVoice,
            Engine::GptSovits(_) => EngineKind::GptSovits,
        }
    }

    pub async fn load(&self) -> Result<(), ClusterError> {
        match self {
            Engine::Xtts(engine) => engine.load().await,
            Engine::OpenVoice(engine) => engine.load().await,
            Engine::GptSovits(engine) => engine.load().await,
        }
    }

    pub async fn unload(&self) -> Result<(), ClusterError> {
        match self {
            Engine::Xtts(engine) => engine.unload().await,
            Engine::OpenVoice(engine) => engine.unload().await,
            Engine::GptSovits(engine) => engine.unload().await,
        }
    }

    pub async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ClusterError> {
        match self {
            Engine::Xtts(engine) => engine.synthesize(request).await,
            Engine::OpenVoice(engine) => engine.synthesize(request).await,
            Engine::GptSovits(engine) => engine.synthesize(request).await,
        }
    }

    pub async fn extract_voice(
        &self,
        audio: Vec<u8>,
        voice_id: String,
        voice_name: String,
    ) -> Result<VoiceInfo, ClusterError> {
        match self {
            Engine::Xtts(engine) => engine.extract_voice(audio, voice_id, voice_name).await,
            Engine::OpenVoice(engine) => engine.extract_voice(audio, voice_id, voice_name).await,
            Engine::GptSovits(engine) => engine.extract_voice(audio, voice_id, voice_name).await,
        }
    }
}

/// Derive an engine-opaque conditioning vector from reference audio by
/// chained hashing. Deterministic, so re-extracting the same clip yields
/// the same voice.
pub(crate) fn conditioning_latents(audio: &[u8], len: usize) -> Vec<u8> {
    let mut latents = Vec::with_capacity(len);
    let mut round: u32 = 0;
    while latents.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(round.to_le_bytes());
        hasher.update(audio);
        latents.extend_from_slice(&hasher.finalize());
        round += 1;
    }
    latents.truncate(len);
    latents
}

/// Encode mono 16-bit PCM samples into a WAV container.
pub(crate) fn wav_encode_pcm16(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
