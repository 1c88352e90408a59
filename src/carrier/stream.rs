use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use futures_util::{Sink, SinkExt, Stream};
use tokio::sync::mpsc;
use tokio::task::spawn;
use warp::filters::ws::{Message, WebSocket};

use super::protocol::{OutboundFrame, StartMetadata, StreamEvent};

pub const STREAM_BUFFER_SIZE: usize = 256;

/// Inbound carrier events after base64 decode, in arrival order.
#[derive(Clone, Debug)]
pub enum CarrierEvent {
    Start(StartMetadata),
    Audio(Bytes),
    Mark(String),
    Stop,
}

/// Cloneable sender half of a media stream. All frames funnel through one
/// writer task so the carrier observes enqueue order. Sends before the
/// `start` event are dropped silently.
#[derive(Clone)]
pub struct CarrierHandle {
    out_tx: mpsc::Sender<OutboundFrame>,
    stream_sid: Arc<Mutex<Option<String>>>,
}

impl CarrierHandle {
    pub fn new(out_tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            out_tx,
            stream_sid: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mark_started(&self, stream_sid: &str) {
        *self.stream_sid.lock().unwrap() = Some(stream_sid.to_string());
    }

    fn sid(&self) -> Option<String> {
        self.stream_sid.lock().unwrap().clone()
    }

    pub async fn send_audio(&self, mulaw: &[u8]) {
        if let Some(sid) = self.sid() {
            let payload = BASE64.encode(mulaw);
            self.out_tx
                .send(OutboundFrame::media(&sid, payload))
                .await
                .ok();
        }
    }

    pub async fn send_clear(&self) {
        if let Some(sid) = self.sid() {
            self.out_tx.send(OutboundFrame::clear(&sid)).await.ok();
        }
    }

    pub async fn send_mark(&self, name: &str) {
        if let Some(sid) = self.sid() {
            self.out_tx.send(OutboundFrame::mark(&sid, name)).await.ok();
        }
    }
}

/// One accepted media-stream connection: the decoded event stream plus the
/// outbound handle. Dropping `events` tears the reader down.
pub struct MediaStream {
    pub events: mpsc::Receiver<CarrierEvent>,
    pub handle: CarrierHandle,
}

impl MediaStream {
    pub fn spawn(ws: WebSocket) -> Self {
        let (write, read) = ws.split();
        let (events_tx, events_rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        let (out_tx, out_rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        let handle = CarrierHandle::new(out_tx);

        spawn(run_write_loop(write, out_rx));
        spawn(run_read_loop(read, events_tx, handle.clone()));

        Self {
            events: events_rx,
            handle,
        }
    }
}

pub async fn run_read_loop<S>(
    mut read: S,
    events_tx: mpsc::Sender<CarrierEvent>,
    handle: CarrierHandle,
) where
    S: Stream<Item = Result<Message, warp::Error>> + Unpin,
{
    let mut stopped = false;
    while let Some(message) = read.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                tracing::info!("Carrier socket closed: {}", err);
                break;
            }
        };
        if message.is_close() {
            break;
        }
        if !message.is_text() {
            continue;
        }
        let text = match message.to_str() {
            Ok(text) => text,
            Err(_) => continue,
        };
        let event: StreamEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("Unparsed carrier event: {}", err);
                continue;
            }
        };
        match event {
            StreamEvent::Connected { protocol } => {
                tracing::info!("Carrier stream connected: {:?}", protocol);
            }
            StreamEvent::Start { start } => {
                handle.mark_started(&start.stream_sid);
                if events_tx.send(CarrierEvent::Start(start)).await.is_err() {
                    break;
                }
            }
            StreamEvent::Media { media } => {
                let audio = match BASE64.decode(media.payload.as_bytes()) {
                    Ok(audio) => audio,
                    Err(err) => {
                        tracing::warn!("Bad media payload: {}", err);
                        continue;
                    }
                };
                if events_tx
                    .send(CarrierEvent::Audio(Bytes::from(audio)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            StreamEvent::Mark { mark } => {
                if events_tx.send(CarrierEvent::Mark(mark.name)).await.is_err() {
                    break;
                }
            }
            StreamEvent::Stop => {
                stopped = true;
                events_tx.send(CarrierEvent::Stop).await.ok();
                break;
            }
        }
    }
    if !stopped {
        events_tx.send(CarrierEvent::Stop).await.ok();
    }
    tracing::info!("Carrier read loop exited");
}

pub async fn run_write_loop<W>(mut write: W, mut out_rx: mpsc::Receiver<OutboundFrame>)
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    while let Some(frame) = out_rx.recv().await {
        let serialized = match serde_json::to_string(&frame) {
            Ok(serialized) => serialized,
            Err(err) => {
                tracing::error!("Frame serialization failed: {}", err);
                continue;
            }
        };
        if let Err(err) = write.send(Message::text(serialized)).await {
            tracing::info!("Carrier write loop closed: {}", err);
            break;
        }
    }
    tracing::info!("Carrier write loop exited");
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::stream;

    fn media_json(payload: &str) -> Result<Message, warp::Error> {
        Ok(Message::text(format!(
            r#"{{"event":"media","media":{{"payload":"{}"}}}}"#,
            payload
        )))
    }

    #[tokio::test]
    async fn media_events_arrive_in_order() {
        let chunks: Vec<Vec<u8>> = (0..20u8).map(|n| vec![n, n + 1, n + 2]).collect();
        let mut messages = vec![Ok(Message::text(r#"{"event":"connected","protocol":"Call"}"#))];
        for chunk in &chunks {
            messages.push(media_json(&BASE64.encode(chunk)));
        }
        messages.push(Ok(Message::text(r#"{"event":"stop"}"#)));

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (out_tx, _out_rx) = mpsc::channel(8);
        run_read_loop(stream::iter(messages), events_tx, CarrierHandle::new(out_tx)).await;

        let mut received = Vec::new();
        let mut stop_seen = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                CarrierEvent::Audio(bytes) => received.push(bytes.to_vec()),
                CarrierEvent::Stop => stop_seen = true,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(stop_seen);
        assert_eq!(received.len(), chunks.len());
        let wire: Vec<u8> = chunks.into_iter().flatten().collect();
        let delivered: Vec<u8> = received.into_iter().flatten().collect();
        assert_eq!(delivered, wire);
    }

    #[tokio::test]
    async fn malformed_events_are_dropped() {
        let messages = vec![
            Ok(Message::text("not json")),
            Ok(Message::text(r#"{"event":"dtmf","digit":"5"}"#)),
            media_json(&BASE64.encode(b"ok")),
        ];
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        run_read_loop(stream::iter(messages), events_tx, CarrierHandle::new(out_tx)).await;

        match events_rx.recv().await {
            Some(CarrierEvent::Audio(bytes)) => assert_eq!(&bytes[..], b"ok"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(events_rx.recv().await, Some(CarrierEvent::Stop)));
    }

    #[tokio::test]
    async fn sends_before_start_are_dropped() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = CarrierHandle::new(out_tx);

        handle.send_audio(&[0xFF, 0xFE]).await;
        handle.send_clear().await;
        handle.mark_started("MZ1");
        handle.send_clear().await;
        drop(handle);

        match out_rx.recv().await {
            Some(OutboundFrame::Clear { stream_sid }) => assert_eq!(stream_sid, "MZ1"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_loop_serializes_in_enqueue_order() {
        let (out_tx, out_rx) = mpsc::channel(8);
        out_tx
            .send(OutboundFrame::media("MZ1", "AAAA".to_string()))
            .await
            .unwrap();
        out_tx.send(OutboundFrame::clear("MZ1")).await.unwrap();
        drop(out_tx);

        let (sink_tx, mut sink_rx) = futures::channel::mpsc::unbounded();
        run_write_loop(sink_tx, out_rx).await;

        let first = sink_rx.next().await.unwrap();
        assert!(first.to_str().unwrap().contains(r#""event":"media""#));
        let second = sink_rx.next().await.unwrap();
        assert!(second.to_str().unwrap().contains(r#""event":"clear""#));
        assert!(sink_rx.next().await.is_none());
    }
}
