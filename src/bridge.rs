use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::spawn;

use crate::brain::BrainEvent;
use crate::carrier::stream::{CarrierEvent, CarrierHandle};
use crate::codec::AudioConverter;
use crate::model::{AudioProfile, ModelEvent};
use crate::stt::SttStrategy;

pub const DEFAULT_UPLINK_CAPACITY: usize = 256;
pub const DEFAULT_PLAYBACK_CAPACITY: usize = 64;

/// Bounded SPSC frame queue. The uplink side uses `push_evict` (real-time
/// audio prefers freshness, so the oldest frame is dropped on overflow); the
/// playback side uses the awaiting `push` (the model's own pacing keeps it
/// bounded). `close` wakes both ends; a closed queue still drains.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    /// Push without waiting; on overflow the oldest item is evicted. Returns
    /// true when an eviction happened.
    pub fn push_evict(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return false;
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front();
                true
            } else {
                false
            };
            state.items.push_back(item);
            evicted
        };
        self.readable.notify_one();
        evicted
    }

    /// Push, waiting for room. Returns false if the queue closed.
    pub async fn push(&self, item: T) -> bool {
        let mut item = Some(item);
        loop {
            let writable = self.writable.notified();
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return false;
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item.take().unwrap());
                    drop(state);
                    self.readable.notify_one();
                    return true;
                }
            }
            writable.await;
        }
    }

    /// Pop the oldest item; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let readable = self.readable.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Drop everything queued; returns how many items went.
    pub fn clear(&self) -> usize {
        let drained = {
            let mut state = self.state.lock().unwrap();
            let drained = state.items.len();
            state.items.clear();
            drained
        };
        self.writable.notify_waiters();
        drained
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        // notify_waiters reaches parked tasks; the stored permits catch a
        // waiter that has not registered yet.
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Playback traffic toward the carrier. Serializing `Clear` and `Mark`
/// through the same queue as audio guarantees the carrier sees them in
/// position: the clear frame precedes any post-barge-in media, the mark
/// trails the response audio it labels.
#[derive(Clone, Debug)]
pub enum PlaybackItem {
    Audio(Bytes),
    Clear,
    Mark(String),
}

#[derive(Default)]
pub struct BridgeStats {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub interruptions: AtomicU64,
    pub codec_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BridgeReport {
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_dropped: u64,
    pub interruptions: u64,
    pub codec_errors: u64,
}

impl BridgeStats {
    fn report(&self) -> BridgeReport {
        BridgeReport {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BridgeSettings {
    /// Carrier audio accumulates until this many milliseconds before being
    /// forwarded; larger chunks transcribe better and cost fewer messages.
    pub staging_ms: u64,
    pub uplink_capacity: usize,
    pub playback_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            staging_ms: 50,
            uplink_capacity: DEFAULT_UPLINK_CAPACITY,
            playback_capacity: DEFAULT_PLAYBACK_CAPACITY,
        }
    }
}

/// Moves audio both ways between the carrier stream and the model stream and
/// fans transcripts out to the brain. Owns the queues; borrows both streams
/// through their channel handles. Caller transcription is delegated to the
/// given [`SttStrategy`].
pub struct Bridge {
    carrier_events: mpsc::Receiver<CarrierEvent>,
    carrier: CarrierHandle,
    model_events: mpsc::Receiver<ModelEvent>,
    model_audio: mpsc::Sender<Bytes>,
    brain_tx: mpsc::Sender<BrainEvent>,
    stt: Arc<dyn SttStrategy>,
    profile: AudioProfile,
    settings: BridgeSettings,
    stats: Arc<BridgeStats>,
}

impl Bridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        carrier_events: mpsc::Receiver<CarrierEvent>,
        carrier: CarrierHandle,
        model_events: mpsc::Receiver<ModelEvent>,
        model_audio: mpsc::Sender<Bytes>,
        brain_tx: mpsc::Sender<BrainEvent>,
        stt: Arc<dyn SttStrategy>,
        profile: AudioProfile,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            carrier_events,
            carrier,
            model_events,
            model_audio,
            brain_tx,
            stt,
            profile,
            settings,
            stats: Arc::new(BridgeStats::default()),
        }
    }

    /// Run all pumps until the carrier stops or the model connection ends,
    /// then drain and close cooperatively.
    pub async fn run(self) -> BridgeReport {
        let uplink = FrameQueue::new(self.settings.uplink_capacity);
        let playback = FrameQueue::new(self.settings.playback_capacity);
        let staging_bytes = staging_bytes(self.settings.staging_ms, self.profile.input_rate);

        let mut carrier_pump = spawn(run_carrier_pump(
            self.carrier_events,
            uplink.clone(),
            self.stt.clone(),
            self.profile.input_rate,
            staging_bytes,
            self.stats.clone(),
        ));
        let mut model_pump = spawn(run_model_pump(
            self.model_events,
            playback.clone(),
            self.brain_tx,
            self.stt,
            self.stats.clone(),
        ));
        let forward_pump = spawn(run_forward_pump(uplink.clone(), self.model_audio));
        let playback_pump = spawn(run_playback_pump(
            playback.clone(),
            self.carrier.clone(),
            self.profile.output_rate,
            self.stats.clone(),
        ));

        // Either side ending takes the whole bridge down. The surviving pump
        // is aborted so its channel ends release their peers.
        tokio::select!(
            _ = &mut carrier_pump => {
                tracing::info!("Carrier side finished first");
                model_pump.abort();
            }
            _ = &mut model_pump => {
                tracing::info!("Model side finished first");
                carrier_pump.abort();
            }
        );

        uplink.close();
        playback.close();
        forward_pump.await.ok();
        playback_pump.await.ok();

        self.stats.report()
    }
}

fn staging_bytes(staging_ms: u64, input_rate: u32) -> usize {
    (staging_ms as usize * input_rate as usize / 1000) * crate::codec::PCM_SAMPLE_WIDTH
}

async fn run_carrier_pump(
    mut events: mpsc::Receiver<CarrierEvent>,
    uplink: Arc<FrameQueue<Bytes>>,
    stt: Arc<dyn SttStrategy>,
    input_rate: u32,
    staging_bytes: usize,
    stats: Arc<BridgeStats>,
) {
    let mut converter = AudioConverter::new();
    let mut staging: Vec<u8> = Vec::with_capacity(staging_bytes * 2);

    while let Some(event) = events.recv().await {
        match event {
            CarrierEvent::Audio(mulaw) => {
                stats.frames_in.fetch_add(1, Ordering::Relaxed);
                let pcm = match converter.carrier_to_model(&mulaw, input_rate) {
                    Ok(pcm) => pcm,
                    Err(err) => {
                        // One bad frame never ends the call.
                        stats.codec_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Uplink frame dropped: {}", err);
                        continue;
                    }
                };
                if pcm.is_empty() {
                    continue;
                }
                stt.on_caller_audio(&pcm).await;
                staging.extend_from_slice(&pcm);
                if staging.len() >= staging_bytes {
                    let frame = Bytes::from(std::mem::take(&mut staging));
                    if uplink.push_evict(frame) {
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            CarrierEvent::Mark(name) => {
                tracing::debug!("Playback mark reached: {}", name);
            }
            CarrierEvent::Start(_) => {}
            CarrierEvent::Stop => {
                if !staging.is_empty() {
                    uplink.push_evict(Bytes::from(std::mem::take(&mut staging)));
                }
                break;
            }
        }
    }
    tracing::info!("Carrier pump exited");
}

async fn run_forward_pump(uplink: Arc<FrameQueue<Bytes>>, model_audio: mpsc::Sender<Bytes>) {
    while let Some(frame) = uplink.pop().await {
        if model_audio.send(frame).await.is_err() {
            break;
        }
    }
    tracing::info!("Forward pump exited");
}

async fn run_model_pump(
    mut events: mpsc::Receiver<ModelEvent>,
    playback: Arc<FrameQueue<PlaybackItem>>,
    brain_tx: mpsc::Sender<BrainEvent>,
    stt: Arc<dyn SttStrategy>,
    stats: Arc<BridgeStats>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ModelEvent::AudioDelta(pcm) => {
                if !playback.push(PlaybackItem::Audio(pcm)).await {
                    break;
                }
            }
            ModelEvent::AssistantTranscriptDelta(text) => {
                brain_tx
                    .send(BrainEvent::AssistantFragment(text))
                    .await
                    .ok();
            }
            ModelEvent::UserTranscriptDelta(text) => {
                if stt.uses_model_transcripts() {
                    brain_tx.send(BrainEvent::UserFragment(text)).await.ok();
                }
            }
            ModelEvent::UserTranscriptFinal(text) => {
                // A final transcript is a complete caller utterance.
                if stt.uses_model_transcripts() {
                    brain_tx.send(BrainEvent::UserFragment(text)).await.ok();
                    brain_tx.send(BrainEvent::FlushUser).await.ok();
                }
            }
            ModelEvent::UserSpeechStarted => {
                // Barge-in: flush queued assistant audio, then tell the
                // carrier to discard what it already buffered.
                let drained = playback.clear();
                playback.push_evict(PlaybackItem::Clear);
                stats.interruptions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Barge-in: dropped {} queued frames", drained);
            }
            ModelEvent::UserSpeechStopped => {
                brain_tx.send(BrainEvent::FlushUser).await.ok();
            }
            ModelEvent::ResponseDone => {
                brain_tx.send(BrainEvent::FlushAssistant).await.ok();
                // Lets the carrier report when this response finishes playing.
                playback
                    .push(PlaybackItem::Mark("response-end".to_string()))
                    .await;
            }
            ModelEvent::Error { code, message } => {
                tracing::error!("Model error {}: {}", code, message);
                break;
            }
        }
    }
    tracing::info!("Model pump exited");
}

async fn run_playback_pump(
    playback: Arc<FrameQueue<PlaybackItem>>,
    carrier: CarrierHandle,
    output_rate: u32,
    stats: Arc<BridgeStats>,
) {
    let mut converter = AudioConverter::new();
    while let Some(item) = playback.pop().await {
        match item {
            PlaybackItem::Audio(pcm) => match converter.model_to_carrier(&pcm, output_rate) {
                Ok(mulaw) if !mulaw.is_empty() => {
                    carrier.send_audio(&mulaw).await;
                    stats.frames_out.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(err) => {
                    stats.codec_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Playback frame dropped: {}", err);
                }
            },
            PlaybackItem::Clear => carrier.send_clear().await,
            PlaybackItem::Mark(name) => carrier.send_mark(&name).await,
        }
    }
    tracing::info!("Playback pump exited");
}
