use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::spawn;

use crate::brain::BrainEvent;
use crate::codec::PCM_SAMPLE_WIDTH;
use crate::config::{BrainConfig, ExternalSttConfig};
use crate::error::{Error, Result};

const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const STT_BUFFER_SIZE: usize = 256;

/// Caller-side transcription strategy. The bridge hands every converted
/// uplink frame to the active strategy and asks it whether the model's own
/// caller transcripts should count, instead of branching on a flag.
#[async_trait]
pub trait SttStrategy: Send + Sync {
    /// Caller PCM at the model input rate, before staging.
    async fn on_caller_audio(&self, pcm: &[u8]);

    /// Whether model-side caller transcripts should reach the brain.
    fn uses_model_transcripts(&self) -> bool;
}

/// The model transcribes the caller itself; nothing extra to do.
pub struct ModelBuiltinStt;

#[async_trait]
impl SttStrategy for ModelBuiltinStt {
    async fn on_caller_audio(&self, _pcm: &[u8]) {}

    fn uses_model_transcripts(&self) -> bool {
        true
    }
}

/// Routes caller audio to a batch transcription worker. The model's caller
/// transcripts are suppressed so each turn flushes exactly once.
pub struct ExternalBatchStt {
    audio_tx: mpsc::Sender<Bytes>,
}

impl ExternalBatchStt {
    /// Spawns the transcription worker and returns the strategy feeding it.
    /// The worker exits once the strategy is dropped.
    pub fn spawn(
        transcriber: BatchTranscriber,
        brain_config: &BrainConfig,
        sample_rate: u32,
        brain_tx: mpsc::Sender<BrainEvent>,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(STT_BUFFER_SIZE);
        spawn_external_worker(transcriber, brain_config, sample_rate, audio_rx, brain_tx);
        Self { audio_tx }
    }
}

#[async_trait]
impl SttStrategy for ExternalBatchStt {
    async fn on_caller_audio(&self, pcm: &[u8]) {
        self.audio_tx.send(Bytes::copy_from_slice(pcm)).await.ok();
    }

    fn uses_model_transcripts(&self) -> bool {
        false
    }
}

/// End-of-speech detector over raw PCM16. Arms on the first non-silent chunk
/// and fires once RMS stays under the threshold for the configured duration.
pub struct SilenceDetector {
    threshold: f64,
    min_silence_bytes: usize,
    consecutive_silent_bytes: usize,
    saw_speech: bool,
}

impl SilenceDetector {
    pub fn new(threshold: f64, silence_duration_ms: u64, sample_rate: u32) -> Self {
        let min_silence_bytes =
            (silence_duration_ms as usize * sample_rate as usize / 1000) * PCM_SAMPLE_WIDTH;
        Self {
            threshold,
            min_silence_bytes,
            consecutive_silent_bytes: 0,
            saw_speech: false,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_silent_bytes = 0;
        self.saw_speech = false;
    }

    pub fn rms(pcm: &[u8]) -> f64 {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for pair in pcm.chunks_exact(PCM_SAMPLE_WIDTH) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
            sum += sample * sample;
            count += 1;
        }
        if count == 0 {
            return 0.0;
        }
        (sum / count as f64).sqrt()
    }

    pub fn is_silent(&self, pcm: &[u8]) -> bool {
        Self::rms(pcm) < self.threshold
    }

    /// Feed one chunk; true means a speech segment just ended.
    pub fn process(&mut self, pcm: &[u8]) -> bool {
        if self.is_silent(pcm) {
            self.consecutive_silent_bytes += pcm.len();
            self.saw_speech && self.consecutive_silent_bytes >= self.min_silence_bytes
        } else {
            self.saw_speech = true;
            self.consecutive_silent_bytes = 0;
            false
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Batch transcription over HTTP: PCM16 goes up as a WAV attachment, text
/// comes back. Replaces the model's own caller-side STT when enabled.
pub struct BatchTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    vocabulary: String,
    sample_rate: u32,
}

impl BatchTranscriber {
    pub fn new(config: &ExternalSttConfig, sample_rate: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            vocabulary: config.vocabulary.clone(),
            sample_rate,
        }
    }

    fn pcm_to_wav(&self, pcm: &[u8]) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|err| Error::Transcription(err.to_string()))?;
            for pair in pcm.chunks_exact(PCM_SAMPLE_WIDTH) {
                writer
                    .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                    .map_err(|err| Error::Transcription(err.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|err| Error::Transcription(err.to_string()))?;
        }
        Ok(cursor.into_inner())
    }

    pub async fn transcribe(&self, pcm: &[u8]) -> Result<Option<String>> {
        if pcm.len() < 100 {
            return Ok(None);
        }
        let wav = self.pcm_to_wav(pcm)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if !self.vocabulary.is_empty() {
            form = form.text("prompt", self.vocabulary.clone());
        }
        let response: TranscriptionResponse = self
            .client
            .post(TRANSCRIPTIONS_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let text = response.text.trim().to_string();
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }
}

/// Worker that buffers caller PCM, cuts segments on detected end-of-speech,
/// and feeds transcripts straight into the brain as complete turns.
fn spawn_external_worker(
    transcriber: BatchTranscriber,
    brain_config: &BrainConfig,
    sample_rate: u32,
    mut audio_rx: mpsc::Receiver<Bytes>,
    brain_tx: mpsc::Sender<BrainEvent>,
) {
    let mut detector = SilenceDetector::new(
        brain_config.silence_threshold,
        brain_config.silence_duration_ms,
        sample_rate,
    );
    let min_bytes =
        (brain_config.min_stt_ms as usize * sample_rate as usize / 1000) * PCM_SAMPLE_WIDTH;

    spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = audio_rx.recv().await {
            buffer.extend_from_slice(&chunk);
            if !detector.process(&chunk) {
                continue;
            }
            let segment = std::mem::take(&mut buffer);
            detector.reset();
            if segment.len() < min_bytes {
                // Too short to be speech, likely noise.
                continue;
            }
            match transcriber.transcribe(&segment).await {
                Ok(Some(text)) => {
                    tracing::info!("External transcript: {:.80}", text);
                    brain_tx.send(BrainEvent::UserFragment(text)).await.ok();
                    brain_tx.send(BrainEvent::FlushUser).await.ok();
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!("External transcription failed: {}", err);
                }
            }
        }
        tracing::info!("External transcription worker exited");
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn loud_chunk(samples: usize) -> Vec<u8> {
        std::iter::repeat(4000i16)
            .take(samples)
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    fn quiet_chunk(samples: usize) -> Vec<u8> {
        vec![0u8; samples * PCM_SAMPLE_WIDTH]
    }

    #[test]
    fn rms_distinguishes_speech_from_silence() {
        assert_eq!(SilenceDetector::rms(&quiet_chunk(160)), 0.0);
        assert!((SilenceDetector::rms(&loud_chunk(160)) - 4000.0).abs() < 1.0);
    }

    #[test]
    fn silence_alone_never_fires() {
        let mut detector = SilenceDetector::new(500.0, 500, 16_000);
        for _ in 0..100 {
            assert!(!detector.process(&quiet_chunk(800)));
        }
    }

    #[test]
    fn fires_after_speech_then_enough_silence() {
        let mut detector = SilenceDetector::new(500.0, 500, 16_000);
        assert!(!detector.process(&loud_chunk(800)));

        // 500 ms at 16 kHz is 16000 bytes; 50 ms chunks arrive ten times.
        let chunk = quiet_chunk(800);
        let mut fired = false;
        for _ in 0..10 {
            fired = detector.process(&chunk);
        }
        assert!(fired);

        detector.reset();
        assert!(!detector.process(&quiet_chunk(8000)));
    }

    #[test]
    fn speech_resets_the_silence_run() {
        let mut detector = SilenceDetector::new(500.0, 500, 16_000);
        detector.process(&loud_chunk(800));
        for _ in 0..9 {
            assert!(!detector.process(&quiet_chunk(800)));
        }
        // More speech restarts the countdown.
        assert!(!detector.process(&loud_chunk(160)));
        for _ in 0..9 {
            assert!(!detector.process(&quiet_chunk(800)));
        }
        assert!(detector.process(&quiet_chunk(800)));
    }

    #[test]
    fn builtin_strategy_keeps_model_transcripts() {
        assert!(ModelBuiltinStt.uses_model_transcripts());
    }

    #[tokio::test]
    async fn external_strategy_forwards_caller_audio() {
        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        let strategy = ExternalBatchStt { audio_tx };
        assert!(!strategy.uses_model_transcripts());

        strategy.on_caller_audio(&[1, 2, 3, 4]).await;
        drop(strategy);

        assert_eq!(&audio_rx.recv().await.unwrap()[..], [1, 2, 3, 4]);
        assert!(audio_rx.recv().await.is_none());
    }

    #[test]
    fn wav_framing_carries_the_sample_rate() {
        let transcriber = BatchTranscriber::new(
            &ExternalSttConfig {
                api_key: "key".to_string(),
                enabled: true,
                model: "whisper-1".to_string(),
                vocabulary: String::new(),
            },
            16_000,
        );
        let wav = transcriber.pcm_to_wav(&loud_chunk(160)).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        let rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(rate, 16_000);
    }
}
