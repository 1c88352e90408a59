use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::spawn;
use tokio::time::timeout;
use uuid::Uuid;

use crate::brain::{Brain, BrainEvent, Classifier};
use crate::bridge::{Bridge, BridgeSettings};
use crate::carrier::rest::CarrierRest;
use crate::carrier::stream::{CarrierEvent, MediaStream};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{Executor, SubprocessExecutor};
use crate::model::{ModelStream, ModelVariant};
use crate::notify::Notifier;
use crate::stt::{BatchTranscriber, ExternalBatchStt, ModelBuiltinStt, SttStrategy};

/// Messages tolerated (and the wall-clock cap) while waiting for the stream
/// `start` event before declaring setup failure.
const MAX_PRESTART_EVENTS: usize = 50;
const START_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_INBOUND_PROMPT: &str =
    "Someone is calling in. Greet them and help with whatever they need.";
const GREETING_PROMPT: &str = "Greet the caller briefly and ask how you can help.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiating,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    pub fn from_carrier(status: &str) -> Option<Self> {
        match status {
            "queued" | "initiated" => Some(CallStatus::Initiating),
            "ringing" => Some(CallStatus::Ringing),
            "in-progress" | "answered" => Some(CallStatus::InProgress),
            "completed" => Some(CallStatus::Completed),
            "failed" => Some(CallStatus::Failed),
            "busy" => Some(CallStatus::Busy),
            "no-answer" => Some(CallStatus::NoAnswer),
            "canceled" => Some(CallStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::Busy
                | CallStatus::NoAnswer
                | CallStatus::Canceled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug)]
pub struct CallSession {
    pub call_id: Uuid,
    pub carrier_call_id: String,
    pub peer_number: String,
    pub prompt: String,
    pub direction: CallDirection,
    pub start_time: DateTime<Utc>,
    pub status: CallStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct CallSummary {
    pub call_id: Uuid,
    pub to_number: String,
    pub status: CallStatus,
    pub direction: CallDirection,
}

#[derive(Clone, Debug)]
struct PendingCall {
    call_id: Uuid,
    prompt: String,
}

/// Owns every active call: the dial bookkeeping, the pending-call records a
/// media stream resolves against, and the per-call orchestration itself.
pub struct CallRegistry {
    config: Config,
    rest: CarrierRest,
    notifier: Arc<dyn Notifier>,
    executor: Arc<dyn Executor>,
    sessions: Mutex<HashMap<Uuid, CallSession>>,
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl CallRegistry {
    pub fn new(config: Config) -> Arc<Self> {
        let rest = CarrierRest::new(&config.carrier);
        let notifier = crate::notify::from_config(&config.notifier);
        let executor: Arc<dyn Executor> =
            Arc::new(SubprocessExecutor::from_config(&config.executor));
        Arc::new(Self {
            config,
            rest,
            notifier,
            executor,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn active_calls(&self) -> Vec<CallSummary> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|session| CallSummary {
                call_id: session.call_id,
                to_number: session.peer_number.clone(),
                status: session.status,
                direction: session.direction,
            })
            .collect()
    }

    /// The prompt a voice webhook should echo into stream parameters.
    pub fn pending_prompt(&self, carrier_call_id: &str) -> Option<String> {
        self.pending
            .lock()
            .unwrap()
            .get(carrier_call_id)
            .map(|pending| pending.prompt.clone())
    }

    /// Dial out. The webhook base falls back to the configured public URL.
    pub async fn initiate_call(
        &self,
        to_number: &str,
        prompt: &str,
        webhook_base: Option<String>,
    ) -> Result<Uuid> {
        let base = webhook_base
            .filter(|base| !base.is_empty())
            .unwrap_or_else(|| self.config.server.public_url.clone());
        if base.is_empty() {
            return Err(Error::Config(
                "no webhook_url given and server.public_url is not set".to_string(),
            ));
        }
        let base = base.trim_end_matches('/');
        let webhook_url = format!("{}{}", base, self.config.server.webhook_path);
        let status_url = format!("{}/carrier/status", base);

        let call_id = Uuid::new_v4();
        tracing::info!("Initiating call {} to {}", call_id, to_number);
        let carrier_call_id = self.rest.dial(to_number, &webhook_url, &status_url).await?;

        let session = CallSession {
            call_id,
            carrier_call_id: carrier_call_id.clone(),
            peer_number: to_number.to_string(),
            prompt: prompt.to_string(),
            direction: CallDirection::Outbound,
            start_time: Utc::now(),
            status: CallStatus::Ringing,
        };
        self.sessions.lock().unwrap().insert(call_id, session);
        self.pending.lock().unwrap().insert(
            carrier_call_id,
            PendingCall {
                call_id,
                prompt: prompt.to_string(),
            },
        );

        self.notifier
            .send(&format!("Call started to {} ({})", to_number, call_id))
            .await;
        Ok(call_id)
    }

    /// Status callback from the carrier; terminal states reap the session.
    pub async fn handle_status(&self, carrier_call_id: &str, raw_status: &str) {
        let status = match CallStatus::from_carrier(raw_status) {
            Some(status) => status,
            None => {
                tracing::warn!("Unknown call status: {}", raw_status);
                return;
            }
        };
        let call_id = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .values_mut()
                .find(|session| session.carrier_call_id == carrier_call_id);
            match session {
                Some(session) => {
                    tracing::info!(
                        "Call {} status {:?} -> {:?}",
                        session.call_id,
                        session.status,
                        status
                    );
                    session.status = status;
                    session.call_id
                }
                None => {
                    tracing::warn!("Status for unknown call {}", carrier_call_id);
                    return;
                }
            }
        };
        if status.is_terminal() {
            self.reap(call_id, carrier_call_id);
            if status != CallStatus::Completed {
                self.notifier
                    .send(&format!("Call {} ended: {:?}", call_id, status))
                    .await;
            }
        }
    }

    pub async fn end_call(&self, call_id: Uuid) -> Result<()> {
        let carrier_call_id = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&call_id)
                .map(|session| session.carrier_call_id.clone())
        };
        match carrier_call_id {
            Some(carrier_call_id) if !carrier_call_id.is_empty() => {
                self.rest.end_call(&carrier_call_id).await
            }
            _ => Err(Error::CarrierApi(format!("no active call {}", call_id))),
        }
    }

    fn reap(&self, call_id: Uuid, carrier_call_id: &str) {
        self.sessions.lock().unwrap().remove(&call_id);
        self.pending.lock().unwrap().remove(carrier_call_id);
    }

    fn set_status(&self, call_id: Uuid, status: CallStatus) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&call_id) {
            session.status = status;
        }
    }

    /// Drive one media-stream connection from `start` to teardown. This is
    /// the per-call orchestrator: it resolves the session, connects the
    /// model, wires brain and bridge, and finalizes on the way out.
    pub async fn handle_media_stream(&self, mut media: MediaStream) {
        let meta = match await_start(&mut media.events).await {
            Some(meta) => meta,
            None => {
                tracing::error!("Media stream never produced a start event");
                return;
            }
        };
        tracing::info!(
            "Stream {} started for call {}",
            meta.stream_sid,
            meta.call_sid
        );

        // Dialed calls carry their carrier id in the custom parameters; fall
        // back to the id on the start frame for plain inbound calls.
        let carrier_call_id = meta
            .custom_parameters
            .get("call_sid")
            .filter(|sid| !sid.is_empty())
            .cloned()
            .unwrap_or_else(|| meta.call_sid.clone());
        let pending = self
            .pending
            .lock()
            .unwrap()
            .get(&carrier_call_id)
            .cloned();
        let (call_id, prompt) = match pending {
            Some(pending) => (pending.call_id, pending.prompt),
            None => {
                let prompt = meta
                    .custom_parameters
                    .get("prompt")
                    .filter(|prompt| !prompt.is_empty())
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_INBOUND_PROMPT.to_string());
                let call_id = Uuid::new_v4();
                let session = CallSession {
                    call_id,
                    carrier_call_id: carrier_call_id.clone(),
                    peer_number: String::new(),
                    prompt: prompt.clone(),
                    direction: CallDirection::Inbound,
                    start_time: Utc::now(),
                    status: CallStatus::InProgress,
                };
                self.sessions.lock().unwrap().insert(call_id, session);
                (call_id, prompt)
            }
        };
        self.set_status(call_id, CallStatus::InProgress);
        let started_at = Utc::now();

        let variant = ModelVariant::from_config(&self.config);
        let dialect = variant.dialect(&self.config);
        let instruction = wrap_instruction(&self.config.model_a.instruction, &prompt);
        let mut model =
            match ModelStream::connect(dialect, &instruction, Some(GREETING_PROMPT)).await {
                Ok(model) => model,
                Err(err) => {
                    tracing::error!("Model connect failed for {}: {}", call_id, err);
                    self.set_status(call_id, CallStatus::Failed);
                    self.reap(call_id, &carrier_call_id);
                    self.notifier
                        .send(&format!("Call {} failed: model connect error", call_id))
                        .await;
                    return;
                }
            };
        let profile = model.profile();
        let model_events = match model.take_events() {
            Some(events) => events,
            None => return,
        };

        let (brain_tx, brain_rx) = mpsc::channel::<BrainEvent>(256);
        let stt: Arc<dyn SttStrategy> =
            if self.config.external_stt.enabled && variant == ModelVariant::A {
                let transcriber =
                    BatchTranscriber::new(&self.config.external_stt, profile.input_rate);
                Arc::new(ExternalBatchStt::spawn(
                    transcriber,
                    &self.config.brain,
                    profile.input_rate,
                    brain_tx.clone(),
                ))
            } else {
                Arc::new(ModelBuiltinStt)
            };

        let classifier = Classifier::from_config(&self.config.brain);
        let brain = Brain::new(call_id, classifier, self.executor.clone(), model.speaker());
        let brain_handle = spawn(brain.run(brain_rx));

        let settings = BridgeSettings {
            staging_ms: self.config.brain.staging_ms,
            ..BridgeSettings::default()
        };
        let bridge = Bridge::new(
            media.events,
            media.handle.clone(),
            model_events,
            model.audio_sender(),
            brain_tx,
            stt,
            profile,
            settings,
        );

        let report = bridge.run().await;

        // Teardown: dropping the model stream closes its socket; the brain
        // drains once the bridge's senders are gone.
        drop(model);
        self.set_status(call_id, CallStatus::Completed);
        self.reap(call_id, &carrier_call_id);

        let duration = (Utc::now() - started_at).num_seconds();
        let summary = match brain_handle.await {
            Ok(memory) => memory.summary(),
            Err(_) => "brain task lost".to_string(),
        };
        tracing::info!(
            "Call {} finished after {}s ({} in / {} out, {} dropped, {} barge-ins): {}",
            call_id,
            duration,
            report.frames_in,
            report.frames_out,
            report.frames_dropped,
            report.interruptions,
            summary
        );
        self.notifier
            .send(&format!(
                "Call {} ended after {}s: {}",
                call_id, duration, summary
            ))
            .await;
    }
}

async fn await_start(
    events: &mut mpsc::Receiver<CarrierEvent>,
) -> Option<crate::carrier::protocol::StartMetadata> {
    let wait = async {
        let mut seen = 0usize;
        while let Some(event) = events.recv().await {
            match event {
                CarrierEvent::Start(meta) => return Some(meta),
                CarrierEvent::Stop => return None,
                _ => {
                    seen += 1;
                    if seen > MAX_PRESTART_EVENTS {
                        tracing::error!("{} events before start; giving up", seen);
                        return None;
                    }
                }
            }
        }
        None
    };
    timeout(START_TIMEOUT, wait).await.ok().flatten()
}

/// The caller prompt rides inside the configured agent persona.
fn wrap_instruction(persona: &str, prompt: &str) -> String {
    if prompt.trim().is_empty() {
        persona.to_string()
    } else {
        format!("{}\n\nCall context:\n{}", persona, prompt)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn carrier_status_mapping() {
        assert_eq!(
            CallStatus::from_carrier("in-progress"),
            Some(CallStatus::InProgress)
        );
        assert_eq!(
            CallStatus::from_carrier("no-answer"),
            Some(CallStatus::NoAnswer)
        );
        assert_eq!(
            CallStatus::from_carrier("ringing"),
            Some(CallStatus::Ringing)
        );
        assert_eq!(CallStatus::from_carrier("wat"), None);

        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::NoAnswer.is_terminal());
        assert!(!CallStatus::InProgress.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CallStatus::NoAnswer).unwrap(),
            "\"no-answer\""
        );
        assert_eq!(
            serde_json::to_string(&CallStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
    }

    #[test]
    fn instruction_wraps_the_caller_prompt() {
        let wrapped = wrap_instruction("You are an assistant.", "Book a table for two.");
        assert!(wrapped.starts_with("You are an assistant."));
        assert!(wrapped.contains("Book a table for two."));
        assert_eq!(wrap_instruction("Persona only.", "  "), "Persona only.");
    }

    #[tokio::test]
    async fn await_start_gives_up_after_too_many_events() {
        let (tx, mut rx) = mpsc::channel(128);
        for _ in 0..(MAX_PRESTART_EVENTS + 2) {
            tx.send(CarrierEvent::Audio(Bytes::from_static(b"x")))
                .await
                .unwrap();
        }
        drop(tx);
        assert!(await_start(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn await_start_returns_metadata() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(CarrierEvent::Audio(Bytes::from_static(b"x")))
            .await
            .unwrap();
        let meta = crate::carrier::protocol::StartMetadata {
            stream_sid: "MZ1".to_string(),
            ..Default::default()
        };
        tx.send(CarrierEvent::Start(meta)).await.unwrap();
        drop(tx);

        let found = await_start(&mut rx).await.unwrap();
        assert_eq!(found.stream_sid, "MZ1");
    }
}
