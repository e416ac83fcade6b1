use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use voicemesh_common::{ClusterError, EngineKind, SynthesizeRequest, VoiceInfo};

use crate::voices::VoiceStore;

const REFERENCE_FILE: &str = "reference.wav";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// GPT-SoVITS runs as an independent API server; this worker is a thin
/// reverse proxy. Voices need no pre-computed embedding, only the
/// reference clip and prompt configuration the upstream expects.
pub struct SovitsBridge {
    api_url: String,
    store: VoiceStore,
    http: reqwest::Client,
    connected: AtomicBool,
}

/// Voice side-file for the proxy engine: points the upstream at the stored
/// reference clip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SovitsVoiceConfig {
    pub voice_id: String,
    pub name: String,
    pub engine: EngineKind,
    pub ref_audio_path: String,
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default = "default_prompt_lang")]
    pub prompt_lang: String,
    pub created_at: DateTime<Utc>,
}

fn default_prompt_lang() -> String {
    "zh".to_string()
}

impl SovitsBridge {
    pub fn new(api_url: String, store: VoiceStore) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            store,
            http: reqwest::Client::new(),
            connected: AtomicBool::new(false),
        }
    }

    /// Reachability probe against the upstream. The root path of the
    /// GPT-SoVITS server 404s, so probe its docs page instead.
    pub async fn load(&self) -> Result<(), ClusterError> {
        let url = format!("{}/docs", self.api_url);
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => {
                self.connected.store(true, Ordering::Release);
                info!(api_url = %self.api_url, "GPT-SoVITS API connected");
                Ok(())
            }
            Ok(response) => Err(ClusterError::EngineError(format!(
                "GPT-SoVITS API returned {}",
                response.status()
            ))),
            Err(e) => {
                error!(api_url = %self.api_url, error = %e, "Cannot connect to GPT-SoVITS API");
                Err(ClusterError::Upstream(format!(
                    "cannot connect to GPT-SoVITS API at {}: {e}",
                    self.api_url
                )))
            }
        }
    }

    pub async fn unload(&self) -> Result<(), ClusterError> {
        self.connected.store(false, Ordering::Release);
        info!("GPT-SoVITS connection closed");
        Ok(())
    }

    pub async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ClusterError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ClusterError::ModelNotLoaded(EngineKind::GptSovits));
        }
        let voice: SovitsVoiceConfig = self.store.load_json(&request.voice_id).await?;

        let params = serde_json::json!({
            "text": request.text,
            "text_lang": map_language(&request.language),
            "ref_audio_path": voice.ref_audio_path,
            "prompt_text": voice.prompt_text,
            "prompt_lang": voice.prompt_lang,
            "speed": request.speed,
        });

        let response = self
            .http
            .post(format!("{}/tts", self.api_url))
            .json(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!(status = %status, "GPT-SoVITS synthesis failed");
            return Err(ClusterError::EngineError(format!(
                "GPT-SoVITS API error: {detail}"
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn extract_voice(
        &self,
        audio: Vec<u8>,
        voice_id: String,
        voice_name: String,
    ) -> Result<VoiceInfo, ClusterError> {
        let ref_path = self.store.save_blob(&voice_id, REFERENCE_FILE, &audio).await?;

        let config = SovitsVoiceConfig {
            name: if voice_name.is_empty() {
                voice_id.clone()
            } else {
                voice_name
            },
            voice_id: voice_id.clone(),
            engine: EngineKind::GptSovits,
            ref_audio_path: ref_path.to_string_lossy().into_owned(),
            prompt_text: String::new(),
            prompt_lang: default_prompt_lang(),
            created_at: Utc::now(),
        };
        self.store.save_json(&voice_id, &config).await?;
        info!(voice_id = %voice_id, "Reference clip stored for GPT-SoVITS");

        Ok(VoiceInfo {
            voice_id: config.voice_id,
            name: config.name,
            engine: EngineKind::GptSovits,
            created_at: config.created_at,
        })
    }
}

/// Normalize client language codes to the forms the upstream accepts.
fn map_language(language: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "zh" | "zh-cn" | "zh-tw" => "zh",
        "en" | "en-us" | "en-gb" => "en",
        "ja" | "jp" => "ja",
        "ko" | "kr" => "ko",
        "yue" => "yue",
        "auto" => "auto",
        _ => "zh",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_mapping_normalizes_variants() {
        assert_eq!(map_language("zh-CN"), "zh");
        assert_eq!(map_language("en-US"), "en");
        assert_eq!(map_language("jp"), "ja");
        assert_eq!(map_language("KR"), "ko");
        assert_eq!(map_language("yue"), "yue");
        assert_eq!(map_language("auto"), "auto");
        assert_eq!(map_language("klingon"), "zh");
    }

    #[tokio::test]
    async fn synthesize_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = SovitsBridge::new(
            "http://127.0.0.1:9880".into(),
            VoiceStore::new(dir.path()),
        );
        let request: SynthesizeRequest = serde_json::from_value(serde_json::json!({
            "text": "hello",
            "voice_id": "voice001",
        }))
        .unwrap();
        let err = bridge.synthesize(&request).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::ModelNotLoaded(EngineKind::GptSovits)
        ));
    }

    #[tokio::test]
    async fn extract_writes_reference_and_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = VoiceStore::new(dir.path());
        let bridge = SovitsBridge::new("http://127.0.0.1:9880".into(), store.clone());

        let info = bridge
            .extract_voice(b"clip".to_vec(), "voice001".into(), "Narrator".into())
            .await
            .unwrap();
        assert_eq!(info.engine, EngineKind::GptSovits);

        let config: SovitsVoiceConfig = store.load_json("voice001").await.unwrap();
        assert_eq!(config.name, "Narrator");
        assert!(config.ref_audio_path.ends_with("reference.wav"));
        assert_eq!(config.prompt_lang, "zh");
        assert_eq!(store.load_blob("voice001", "reference.wav").await.unwrap(), b"clip");
    }
}
