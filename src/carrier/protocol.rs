use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Events arriving on the carrier's media-stream channel. Unknown fields are
/// ignored; unknown events fail to parse and are dropped by the reader.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Stop,
    Mark {
        mark: MarkPayload,
    },
}

/// Stream metadata from the `start` event. Set once, immutable afterwards.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartMetadata {
    pub stream_sid: String,
    pub call_sid: String,
    pub account_sid: String,
    pub tracks: Vec<String>,
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MediaPayload {
    pub payload: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Frames sent back to the carrier. The stream sid from the `start` event is
/// echoed on every frame.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

impl OutboundFrame {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        OutboundFrame::Media {
            stream_sid: stream_sid.to_string(),
            media: MediaPayload { payload },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        OutboundFrame::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn mark(stream_sid: &str, name: &str) -> Self {
        OutboundFrame::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload {
                name: name.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_start_event() {
        let raw = r#"{"event":"start","sequenceNumber":"1","start":{
            "streamSid":"MZ1","callSid":"CA1","accountSid":"AC1",
            "tracks":["inbound"],"customParameters":{"prompt":"say hi","call_sid":"CA1"}},
            "streamSid":"MZ1"}"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            StreamEvent::Start { start } => {
                assert_eq!(start.stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(start.tracks, vec!["inbound"]);
                assert_eq!(start.custom_parameters.get("prompt").unwrap(), "say hi");
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn parses_media_and_stop_events() {
        let media: StreamEvent =
            serde_json::from_str(r#"{"event":"media","media":{"payload":"//8="}}"#).unwrap();
        assert!(matches!(media, StreamEvent::Media { .. }));

        let stop: StreamEvent =
            serde_json::from_str(r#"{"event":"stop","streamSid":"MZ1","stop":{"callSid":"CA1"}}"#)
                .unwrap();
        assert!(matches!(stop, StreamEvent::Stop));

        let connected: StreamEvent =
            serde_json::from_str(r#"{"event":"connected","protocol":"Call"}"#).unwrap();
        assert!(matches!(connected, StreamEvent::Connected { .. }));
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        assert!(serde_json::from_str::<StreamEvent>(r#"{"event":"dtmf","digit":"1"}"#).is_err());
    }

    #[test]
    fn serializes_outbound_frames() {
        let media = serde_json::to_string(&OutboundFrame::media("MZ1", "AAAA".to_string())).unwrap();
        assert_eq!(
            media,
            r#"{"event":"media","streamSid":"MZ1","media":{"payload":"AAAA"}}"#
        );

        let clear = serde_json::to_string(&OutboundFrame::clear("MZ1")).unwrap();
        assert_eq!(clear, r#"{"event":"clear","streamSid":"MZ1"}"#);

        let mark = serde_json::to_string(&OutboundFrame::mark("MZ1", "greeting")).unwrap();
        assert_eq!(
            mark,
            r#"{"event":"mark","streamSid":"MZ1","mark":{"name":"greeting"}}"#
        );
    }
}
