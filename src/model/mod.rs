pub mod variant_a;
pub mod variant_b;

use bytes::Bytes;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use http::header::{HeaderName, HeaderValue};
use http::Uri;
use tokio::sync::mpsc;
use tokio::task::spawn;
use tokio_websockets::{ClientBuilder, Message};

use crate::config::Config;
use crate::error::{Error, Result};

pub use variant_a::VariantA;
pub use variant_b::VariantB;

const EVENT_BUFFER_SIZE: usize = 256;
const AUDIO_BUFFER_SIZE: usize = 64;
const TEXT_BUFFER_SIZE: usize = 16;

/// Maximum queued frames coalesced into one transport message.
pub const MAX_SEND_BATCH: usize = 10;

/// Events surfaced by either model vendor, already mapped to the common
/// contract. Variant differences (explicit VAD vs derived turn boundaries)
/// are hidden behind the dialect.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    AudioDelta(Bytes),
    AssistantTranscriptDelta(String),
    UserTranscriptDelta(String),
    UserTranscriptFinal(String),
    UserSpeechStarted,
    UserSpeechStopped,
    ResponseDone,
    Error { code: String, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioProfile {
    pub input_rate: u32,
    pub output_rate: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelVariant {
    A,
    B,
}

impl ModelVariant {
    /// Variant B wins when enabled; A is the default vendor.
    pub fn from_config(config: &Config) -> Self {
        if config.model_b.enabled {
            ModelVariant::B
        } else {
            ModelVariant::A
        }
    }

    pub fn dialect(self, config: &Config) -> Box<dyn ModelDialect> {
        match self {
            ModelVariant::A => Box::new(VariantA::new(config.model_a.clone())),
            ModelVariant::B => Box::new(VariantB::new(config.model_b.clone())),
        }
    }
}

/// Vendor capability set: endpoint and credentials, session setup, frame
/// encoding, and mapping of raw transport messages onto [`ModelEvent`]s.
/// `map_message` may keep per-connection state (variant B derives caller-turn
/// boundaries from transcript interleaving).
pub trait ModelDialect: Send + 'static {
    fn endpoint(&self) -> String;
    fn headers(&self) -> Vec<(HeaderName, HeaderValue)>;
    fn setup_messages(&self, instruction: &str) -> Vec<String>;
    fn audio_message(&self, pcm: &[u8]) -> String;
    fn text_messages(&self, text: &str, end_of_turn: bool) -> Vec<String>;
    fn map_message(&mut self, raw: &str) -> Vec<ModelEvent>;
    fn profile(&self) -> AudioProfile;
}

#[derive(Clone, Debug)]
pub struct SpeakRequest {
    pub text: String,
    pub end_of_turn: bool,
}

/// A live realtime session. Audio and text submissions are queued; one pump
/// task owns the socket so outbound writes are serialized. Dropping the
/// stream closes the connection cooperatively.
pub struct ModelStream {
    audio_tx: mpsc::Sender<Bytes>,
    text_tx: mpsc::Sender<SpeakRequest>,
    events: Option<mpsc::Receiver<ModelEvent>>,
    profile: AudioProfile,
}

impl ModelStream {
    /// Connect, configure the session with the system instruction, and speak
    /// the initial prompt if one is given. A failure here is fatal for the
    /// call; there is no reconnection.
    pub async fn connect(
        dialect: Box<dyn ModelDialect>,
        instruction: &str,
        initial_prompt: Option<&str>,
    ) -> Result<Self> {
        let profile = dialect.profile();
        let uri: Uri = dialect
            .endpoint()
            .parse()
            .map_err(|err| Error::ModelStream(format!("bad endpoint: {}", err)))?;

        let mut builder = ClientBuilder::from_uri(uri);
        for (name, value) in dialect.headers() {
            builder = builder.add_header(name, value);
        }
        let (mut ws, _response) = builder
            .connect()
            .await
            .map_err(|err| Error::ModelStream(format!("connect failed: {}", err)))?;
        tracing::info!("Model stream connected");

        for setup in dialect.setup_messages(instruction) {
            ws.send(Message::text(setup))
                .await
                .map_err(|err| Error::ModelStream(format!("setup failed: {}", err)))?;
        }
        if let Some(prompt) = initial_prompt {
            for message in dialect.text_messages(prompt, true) {
                ws.send(Message::text(message))
                    .await
                    .map_err(|err| Error::ModelStream(format!("greeting failed: {}", err)))?;
            }
        }

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_BUFFER_SIZE);
        let (text_tx, text_rx) = mpsc::channel(TEXT_BUFFER_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        spawn(run_stream(ws, dialect, audio_rx, text_rx, events_tx));

        Ok(Self {
            audio_tx,
            text_tx,
            events: Some(events_rx),
            profile,
        })
    }

    pub fn profile(&self) -> AudioProfile {
        self.profile
    }

    /// Take the mapped event stream. Yields `None` once the connection ends.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ModelEvent>> {
        self.events.take()
    }

    /// Queue a PCM16 frame for the send pump. Frames may coalesce with up to
    /// [`MAX_SEND_BATCH`] neighbors but never reorder.
    pub async fn send_audio(&self, pcm: Bytes) {
        if !pcm.is_empty() {
            self.audio_tx.send(pcm).await.ok();
        }
    }

    /// Sender feeding the audio pump directly; the bridge forwards queued
    /// carrier frames through this.
    pub fn audio_sender(&self) -> mpsc::Sender<Bytes> {
        self.audio_tx.clone()
    }

    pub fn speaker(&self) -> mpsc::Sender<SpeakRequest> {
        self.text_tx.clone()
    }

    /// Inject caller-visible text; `end_of_turn` asks the model to respond.
    pub async fn send_text(&self, text: &str, end_of_turn: bool) {
        self.text_tx
            .send(SpeakRequest {
                text: text.to_string(),
                end_of_turn,
            })
            .await
            .ok();
    }
}

/// Coalesce immediately available frames behind `first`, preserving order.
fn drain_batch(first: Bytes, audio_rx: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
    let mut buffer = first.to_vec();
    let mut batched = 1;
    while batched < MAX_SEND_BATCH {
        match audio_rx.try_recv() {
            Ok(extra) => {
                buffer.extend_from_slice(&extra);
                batched += 1;
            }
            Err(_) => break,
        }
    }
    buffer
}

async fn run_stream<S>(
    mut ws: S,
    mut dialect: Box<dyn ModelDialect>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut text_rx: mpsc::Receiver<SpeakRequest>,
    events_tx: mpsc::Sender<ModelEvent>,
) where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_websockets::Error>>
        + futures_util::Sink<Message, Error = tokio_websockets::Error>
        + Unpin,
{
    let mut frames_sent: usize = 0;
    'run: loop {
        tokio::select! {
            message = ws.next() => {
                match message {
                    Some(Ok(message)) => {
                        let text = match message.as_text() {
                            Some(text) => text,
                            None => continue,
                        };
                        for event in dialect.map_message(text) {
                            if events_tx.send(event).await.is_err() {
                                break 'run;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        events_tx
                            .send(ModelEvent::Error {
                                code: "transport".to_string(),
                                message: err.to_string(),
                            })
                            .await
                            .ok();
                        break;
                    }
                    None => break,
                }
            }
            frame = audio_rx.recv() => {
                let first = match frame {
                    Some(first) => first,
                    None => break,
                };
                let buffer = drain_batch(first, &mut audio_rx);
                let message = dialect.audio_message(&buffer);
                if ws.send(Message::text(message)).await.is_err() {
                    tracing::warn!("Model send failed after {} frames", frames_sent);
                    break;
                }
                frames_sent += 1;
            }
            request = text_rx.recv() => {
                let request = match request {
                    Some(request) => request,
                    None => break,
                };
                tracing::info!("Injecting text into model: {:.60}", request.text);
                for message in dialect.text_messages(&request.text, request.end_of_turn) {
                    if ws.send(Message::text(message)).await.is_err() {
                        break 'run;
                    }
                }
            }
        }
    }
    ws.close().await.ok();
    tracing::info!("Model stream task exited ({} audio messages)", frames_sent);
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn batching_preserves_order_without_gaps() {
        let (tx, mut rx) = mpsc::channel(32);
        for n in 0..15u8 {
            tx.send(Bytes::from(vec![n, n])).await.unwrap();
        }
        let first = rx.recv().await.unwrap();
        let batch = drain_batch(first, &mut rx);
        // Ten frames of two bytes each, in submission order.
        let expected: Vec<u8> = (0..10u8).flat_map(|n| [n, n]).collect();
        assert_eq!(batch, expected);

        // The remaining five frames are untouched.
        let first = rx.recv().await.unwrap();
        let rest = drain_batch(first, &mut rx);
        let expected: Vec<u8> = (10..15u8).flat_map(|n| [n, n]).collect();
        assert_eq!(rest, expected);
    }
}
