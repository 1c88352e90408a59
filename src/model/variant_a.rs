use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use serde_json::{json, Value};

use crate::config::ModelAConfig;

use super::{AudioProfile, ModelDialect, ModelEvent};

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Vendor A dialect. Turn detection runs server-side, so caller speech
/// boundaries arrive as explicit events. Audio is 16 kHz PCM16 up, 24 kHz
/// PCM16 down.
pub struct VariantA {
    config: ModelAConfig,
}

impl VariantA {
    pub fn new(config: ModelAConfig) -> Self {
        Self { config }
    }
}

impl ModelDialect for VariantA {
    fn endpoint(&self) -> String {
        format!("{}?model={}", REALTIME_URL, self.config.model)
    }

    fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = Vec::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key)) {
            headers.push((http::header::AUTHORIZATION, value));
        }
        headers.push((
            HeaderName::from_static("openai-beta"),
            HeaderValue::from_static("realtime=v1"),
        ));
        headers
    }

    fn setup_messages(&self, instruction: &str) -> Vec<String> {
        let update = json!({
            "type": "session.update",
            "session": {
                "modalities": ["text", "audio"],
                "instructions": instruction,
                "voice": self.config.voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": {"model": "whisper-1"},
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.6,
                    "prefix_padding_ms": 200,
                    "silence_duration_ms": 300,
                },
            },
        });
        vec![update.to_string()]
    }

    fn audio_message(&self, pcm: &[u8]) -> String {
        json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode(pcm),
        })
        .to_string()
    }

    fn text_messages(&self, text: &str, end_of_turn: bool) -> Vec<String> {
        let item = json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": text}],
            },
        });
        let mut messages = vec![item.to_string()];
        if end_of_turn {
            messages.push(json!({"type": "response.create"}).to_string());
        }
        messages
    }

    fn map_message(&mut self, raw: &str) -> Vec<ModelEvent> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("Unparsed model event: {}", err);
                return Vec::new();
            }
        };
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "response.audio.delta" => {
                let delta = value.get("delta").and_then(Value::as_str).unwrap_or("");
                match BASE64.decode(delta.as_bytes()) {
                    Ok(audio) if !audio.is_empty() => {
                        vec![ModelEvent::AudioDelta(Bytes::from(audio))]
                    }
                    _ => Vec::new(),
                }
            }
            "response.audio_transcript.delta" => {
                match value.get("delta").and_then(Value::as_str) {
                    Some(text) if !text.is_empty() => {
                        vec![ModelEvent::AssistantTranscriptDelta(text.to_string())]
                    }
                    _ => Vec::new(),
                }
            }
            "conversation.item.input_audio_transcription.completed" => {
                match value.get("transcript").and_then(Value::as_str) {
                    Some(text) if !text.trim().is_empty() => {
                        vec![ModelEvent::UserTranscriptFinal(text.to_string())]
                    }
                    _ => Vec::new(),
                }
            }
            "input_audio_buffer.speech_started" => vec![ModelEvent::UserSpeechStarted],
            "input_audio_buffer.speech_stopped" => vec![ModelEvent::UserSpeechStopped],
            "response.done" => vec![ModelEvent::ResponseDone],
            "error" => {
                let error = value.get("error").cloned().unwrap_or(Value::Null);
                vec![ModelEvent::Error {
                    code: error
                        .get("code")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn profile(&self) -> AudioProfile {
        AudioProfile {
            input_rate: 16_000,
            output_rate: 24_000,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dialect() -> VariantA {
        VariantA::new(ModelAConfig {
            api_key: "key".to_string(),
            model: "realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instruction: String::new(),
        })
    }

    #[test]
    fn maps_audio_and_transcript_deltas() {
        let mut dialect = dialect();
        let audio = BASE64.encode([1u8, 2, 3, 4]);
        let events = dialect.map_message(&format!(
            r#"{{"type":"response.audio.delta","delta":"{}"}}"#,
            audio
        ));
        assert!(matches!(&events[..], [ModelEvent::AudioDelta(bytes)] if bytes[..] == [1, 2, 3, 4]));

        let events =
            dialect.map_message(r#"{"type":"response.audio_transcript.delta","delta":"I'll "}"#);
        assert!(
            matches!(&events[..], [ModelEvent::AssistantTranscriptDelta(text)] if text == "I'll ")
        );
    }

    #[test]
    fn maps_speech_boundaries_and_completion() {
        let mut dialect = dialect();
        assert!(matches!(
            dialect.map_message(r#"{"type":"input_audio_buffer.speech_started"}"#)[..],
            [ModelEvent::UserSpeechStarted]
        ));
        assert!(matches!(
            dialect.map_message(r#"{"type":"input_audio_buffer.speech_stopped"}"#)[..],
            [ModelEvent::UserSpeechStopped]
        ));
        assert!(matches!(
            dialect.map_message(r#"{"type":"response.done"}"#)[..],
            [ModelEvent::ResponseDone]
        ));

        let events = dialect.map_message(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"open Spotify"}"#,
        );
        assert!(
            matches!(&events[..], [ModelEvent::UserTranscriptFinal(text)] if text == "open Spotify")
        );
    }

    #[test]
    fn unknown_events_map_to_nothing() {
        let mut dialect = dialect();
        assert!(dialect
            .map_message(r#"{"type":"session.created"}"#)
            .is_empty());
        assert!(dialect.map_message("not json").is_empty());
    }

    #[test]
    fn text_injection_ends_turn() {
        let dialect = dialect();
        let messages = dialect.text_messages("Opened Spotify.", true);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("conversation.item.create"));
        assert!(messages[0].contains("Opened Spotify."));
        assert!(messages[1].contains("response.create"));

        assert_eq!(dialect.text_messages("partial", false).len(), 1);
    }
}
