use std::env;
use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct CarrierConfig {
    pub sid: String,
    pub token: String,
    pub from_number: String,
    #[serde(default = "default_carrier_api_base")]
    pub api_base: String,
}

fn default_carrier_api_base() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelAConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_a")]
    pub model: String,
    #[serde(default = "default_model_a_voice")]
    pub voice: String,
    #[serde(default = "default_instruction")]
    pub instruction: String,
}

fn default_model_a() -> String {
    "realtime-preview".to_string()
}

fn default_model_a_voice() -> String {
    "alloy".to_string()
}

fn default_instruction() -> String {
    "You are a helpful AI assistant on a phone call.".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelBConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_b")]
    pub model: String,
    #[serde(default = "default_model_b_voice")]
    pub voice: String,
    #[serde(default)]
    pub enabled: bool,
}

fn default_model_b() -> String {
    "models/live-audio-dialog".to_string()
}

fn default_model_b_voice() -> String {
    "Zephyr".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExternalSttConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stt_model")]
    pub model: String,
    /// Proper-noun hinting passed through to the transcription service.
    #[serde(default)]
    pub vocabulary: String,
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_command")]
    pub command: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_executor_command(),
            chat_id: String::new(),
            timeout_secs: default_executor_timeout(),
        }
    }
}

fn default_executor_command() -> String {
    "clawd".to_string()
}

fn default_executor_timeout() -> u64 {
    90
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrainConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    /// Phrases that never reach the classifier or the executor.
    #[serde(default = "default_trivial_phrases")]
    pub trivial_phrases: Vec<String>,
    /// Leading or embedded verbs that mark an utterance actionable outright.
    #[serde(default = "default_action_verbs")]
    pub action_verbs: Vec<String>,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f64,
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u64,
    #[serde(default = "default_staging_ms")]
    pub staging_ms: u64,
    #[serde(default = "default_min_stt_ms")]
    pub min_stt_ms: u64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_classifier_model(),
            trivial_phrases: default_trivial_phrases(),
            action_verbs: default_action_verbs(),
            silence_threshold: default_silence_threshold(),
            silence_duration_ms: default_silence_duration_ms(),
            staging_ms: default_staging_ms(),
            min_stt_ms: default_min_stt_ms(),
        }
    }
}

fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_trivial_phrases() -> Vec<String> {
    [
        "hi", "hello", "hey", "good morning", "good afternoon", "good evening",
        "how are you", "what's up", "sup", "yo", "thanks", "thank you", "okay",
        "ok", "alright", "sure", "yes", "no", "yeah", "nope", "bye", "goodbye",
        "see you", "later", "nevermind", "never mind", "forget it",
        "forget about it", "nothing", "hmm", "um", "uh",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_action_verbs() -> Vec<String> {
    [
        "open", "play", "search", "find", "send", "call", "text", "check",
        "show", "get", "set", "turn", "start", "stop", "email", "message",
        "youtube", "spotify", "browser", "google",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_silence_threshold() -> f64 {
    500.0
}

fn default_silence_duration_ms() -> u64 {
    500
}

fn default_staging_ms() -> u64 {
    50
}

fn default_min_stt_ms() -> u64 {
    300
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub relay_url: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Externally reachable base URL, e.g. `https://example.ngrok.app`. Used
    /// when a dial request does not carry its own webhook base.
    #[serde(default)]
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_path: default_webhook_path(),
            ws_path: default_ws_path(),
            public_url: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_webhook_path() -> String {
    "/carrier/voice".to_string()
}

fn default_ws_path() -> String {
    "/carrier/media-stream".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub carrier: CarrierConfig,
    #[serde(default)]
    pub model_a: ModelAConfig,
    #[serde(default)]
    pub model_b: ModelBConfig,
    #[serde(default)]
    pub external_stt: ExternalSttConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub brain: BrainConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
        let mut raw: Value = serde_json::from_reader(file)?;
        expand_env(&mut raw);
        let config = serde_json::from_value(raw)?;
        Ok(config)
    }
}

/// Substitute `${NAME}` and `${NAME:default}` in every string value.
fn expand_env(value: &mut Value) {
    match value {
        Value::String(text) => *text = expand_str(text),
        Value::Array(items) => items.iter_mut().for_each(expand_env),
        Value::Object(map) => map.values_mut().for_each(expand_env),
        _ => {}
    }
}

fn expand_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => {
                let expr = &tail[..end];
                let (name, default) = match expr.split_once(':') {
                    Some((name, default)) => (name, Some(default)),
                    None => (expr, None),
                };
                match env::var(name) {
                    Ok(found) => out.push_str(&found),
                    Err(_) => out.push_str(default.unwrap_or("")),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expands_env_with_default() {
        env::set_var("PARLEY_TEST_SID", "AC123");
        assert_eq!(expand_str("${PARLEY_TEST_SID}"), "AC123");
        assert_eq!(expand_str("${PARLEY_TEST_MISSING:fallback}"), "fallback");
        assert_eq!(expand_str("${PARLEY_TEST_MISSING}"), "");
        assert_eq!(
            expand_str("prefix-${PARLEY_TEST_SID}-suffix"),
            "prefix-AC123-suffix"
        );
        assert_eq!(expand_str("no markers"), "no markers");
        assert_eq!(expand_str("${unterminated"), "${unterminated");
    }

    #[test]
    fn parses_minimal_config() {
        let raw = r#"{
            "carrier": {"sid": "AC1", "token": "tok", "from_number": "+15550100"},
            "model_b": {"api_key": "key", "enabled": true},
            "server": {"port": 9090}
        }"#;
        let mut value: Value = serde_json::from_str(raw).unwrap();
        expand_env(&mut value);
        let config: Config = serde_json::from_value(value).unwrap();
        assert_eq!(config.carrier.sid, "AC1");
        assert!(config.model_b.enabled);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.ws_path, "/carrier/media-stream");
        assert_eq!(config.executor.timeout_secs, 90);
        assert!(config.brain.action_verbs.iter().any(|v| v == "open"));
    }
}
