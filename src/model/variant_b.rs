use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use serde_json::{json, Value};

use crate::config::ModelBConfig;

use super::{AudioProfile, ModelDialect, ModelEvent};

const LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Vendor B dialect. 24 kHz PCM16 both directions. The vendor sends no
/// explicit speech boundaries; a caller turn opens on the first caller
/// transcript fragment and closes when the assistant transcript begins, so
/// both boundary events are synthesized here.
pub struct VariantB {
    config: ModelBConfig,
    user_spoke: bool,
}

impl VariantB {
    pub fn new(config: ModelBConfig) -> Self {
        Self {
            config,
            user_spoke: false,
        }
    }
}

impl ModelDialect for VariantB {
    fn endpoint(&self) -> String {
        format!("{}?key={}", LIVE_URL, self.config.api_key)
    }

    fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        Vec::new()
    }

    fn setup_messages(&self, instruction: &str) -> Vec<String> {
        let setup = json!({
            "setup": {
                "model": self.config.model,
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {
                            "prebuiltVoiceConfig": {"voiceName": self.config.voice}
                        }
                    },
                },
                "systemInstruction": {"parts": [{"text": instruction}]},
                "inputAudioTranscription": {},
                "outputAudioTranscription": {},
            },
        });
        vec![setup.to_string()]
    }

    fn audio_message(&self, pcm: &[u8]) -> String {
        json!({
            "realtimeInput": {
                "audio": {
                    "data": BASE64.encode(pcm),
                    "mimeType": "audio/pcm;rate=24000",
                },
            },
        })
        .to_string()
    }

    fn text_messages(&self, text: &str, end_of_turn: bool) -> Vec<String> {
        let content = json!({
            "clientContent": {
                "turns": [{"role": "user", "parts": [{"text": text}]}],
                "turnComplete": end_of_turn,
            },
        });
        vec![content.to_string()]
    }

    fn map_message(&mut self, raw: &str) -> Vec<ModelEvent> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("Unparsed model event: {}", err);
                return Vec::new();
            }
        };

        if let Some(error) = value.get("error") {
            return vec![ModelEvent::Error {
                code: error
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }];
        }

        let content = match value.get("serverContent") {
            Some(content) => content,
            None => return Vec::new(),
        };
        let mut events = Vec::new();

        // Caller transcription first: its presence both opens the caller's
        // turn and must precede the assistant fragment that would close it.
        if let Some(text) = content
            .get("inputTranscription")
            .and_then(|t| t.get("text"))
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                if !self.user_spoke {
                    self.user_spoke = true;
                    events.push(ModelEvent::UserSpeechStarted);
                }
                events.push(ModelEvent::UserTranscriptDelta(text.to_string()));
            }
        }

        if let Some(text) = content
            .get("outputTranscription")
            .and_then(|t| t.get("text"))
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                if self.user_spoke {
                    self.user_spoke = false;
                    events.push(ModelEvent::UserSpeechStopped);
                }
                events.push(ModelEvent::AssistantTranscriptDelta(text.to_string()));
            }
        }

        if let Some(parts) = content
            .get("modelTurn")
            .and_then(|turn| turn.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(data) = part
                    .get("inlineData")
                    .and_then(|inline| inline.get("data"))
                    .and_then(Value::as_str)
                {
                    if let Ok(audio) = BASE64.decode(data.as_bytes()) {
                        if !audio.is_empty() {
                            events.push(ModelEvent::AudioDelta(Bytes::from(audio)));
                        }
                    }
                }
            }
        }

        if content
            .get("turnComplete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            events.push(ModelEvent::ResponseDone);
        }

        events
    }

    fn profile(&self) -> AudioProfile {
        AudioProfile {
            input_rate: 24_000,
            output_rate: 24_000,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dialect() -> VariantB {
        VariantB::new(ModelBConfig {
            api_key: "key".to_string(),
            model: "models/live-audio-dialog".to_string(),
            voice: "Zephyr".to_string(),
            enabled: true,
        })
    }

    #[test]
    fn first_caller_fragment_opens_the_turn() {
        let mut dialect = dialect();
        let events = dialect
            .map_message(r#"{"serverContent":{"inputTranscription":{"text":"open "}}}"#);
        assert!(matches!(events[0], ModelEvent::UserSpeechStarted));
        assert!(matches!(&events[1], ModelEvent::UserTranscriptDelta(text) if text == "open "));

        // Further caller fragments do not reopen the turn.
        let events = dialect
            .map_message(r#"{"serverContent":{"inputTranscription":{"text":"Spotify"}}}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ModelEvent::UserTranscriptDelta(text) if text == "Spotify"));
    }

    #[test]
    fn assistant_fragment_closes_the_caller_turn() {
        let mut dialect = dialect();
        dialect.map_message(r#"{"serverContent":{"inputTranscription":{"text":"hello"}}}"#);
        let events = dialect
            .map_message(r#"{"serverContent":{"outputTranscription":{"text":"Hi there"}}}"#);
        assert!(matches!(events[0], ModelEvent::UserSpeechStopped));
        assert!(
            matches!(&events[1], ModelEvent::AssistantTranscriptDelta(text) if text == "Hi there")
        );

        // The assistant keeps talking without reclosing anything.
        let events = dialect
            .map_message(r#"{"serverContent":{"outputTranscription":{"text":"!"}}}"#);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn maps_audio_parts_and_turn_complete() {
        let mut dialect = dialect();
        let data = BASE64.encode([9u8, 8, 7]);
        let raw = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"data":"{}","mimeType":"audio/pcm"}}}}]}},"turnComplete":true}}}}"#,
            data
        );
        let events = dialect.map_message(&raw);
        assert!(matches!(&events[0], ModelEvent::AudioDelta(bytes) if bytes[..] == [9, 8, 7]));
        assert!(matches!(events[1], ModelEvent::ResponseDone));
    }

    #[test]
    fn maps_errors() {
        let mut dialect = dialect();
        let events = dialect
            .map_message(r#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"quota"}}"#);
        assert!(
            matches!(&events[0], ModelEvent::Error { code, message }
                if code == "RESOURCE_EXHAUSTED" && message == "quota")
        );
    }
}
