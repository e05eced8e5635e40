use serde::Deserialize;
use serde_json::json;

/// Wire dialect spoken by the peer.
///
/// Twilio ConversationRelay tags events with `type` (setup/prompt/dtmf/
/// interrupt); the older media-stream shape tags them with `event`
/// (start/transcript/stop). Both map onto [`RelayEvent`]; the dialect is
/// latched from the first parsed event so replies go out in the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireVariant {
    ConversationRelay,
    MediaStream,
}

/// One inbound message on the relay connection, unified across dialects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Initial connection with call metadata. No reply expected.
    Setup(CallSetup),
    /// The caller's utterance as text (`prompt` or `transcript` on the wire).
    Utterance {
        text: String,
        lang: Option<String>,
        last: bool,
    },
    /// A single keypad digit.
    Dtmf { digit: String },
    /// The caller cut the assistant off mid-reply.
    Interrupt {
        utterance: Option<String>,
        duration_ms: Option<u64>,
    },
    /// Media-stream lifecycle start.
    Start { stream_sid: String },
    /// Media-stream lifecycle stop; closes the connection.
    Stop,
}

/// Call metadata from the `setup` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSetup {
    pub session_id: Option<String>,
    pub call_sid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub direction: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("unknown event tag: {0}")]
    UnknownTag(String),
}

/// ConversationRelay wire events, tagged with `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RelayWireEvent {
    Setup {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
        #[serde(rename = "callSid", default)]
        call_sid: Option<String>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        direction: Option<String>,
    },
    Prompt {
        #[serde(rename = "voicePrompt")]
        voice_prompt: String,
        #[serde(default)]
        lang: Option<String>,
        #[serde(default = "default_true")]
        last: bool,
    },
    Dtmf {
        digit: String,
    },
    Interrupt {
        #[serde(rename = "utteranceUntilInterrupt", default)]
        utterance_until_interrupt: Option<String>,
        #[serde(rename = "durationUntilInterruptMs", default)]
        duration_until_interrupt_ms: Option<u64>,
    },
}

fn default_true() -> bool {
    true
}

/// Media-stream wire events, tagged with `event`.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum StreamWireEvent {
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    Transcript {
        transcript: String,
    },
    Stop {},
}

const RELAY_TAGS: &[&str] = &["setup", "prompt", "dtmf", "interrupt"];
const STREAM_TAGS: &[&str] = &["start", "transcript", "stop"];

impl RelayEvent {
    /// Parse one raw inbound message, detecting the wire dialect.
    pub fn parse(raw: &str) -> Result<(RelayEvent, WireVariant), ParseError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;

        if let Some(tag) = value.get("type").and_then(|t| t.as_str()) {
            if !RELAY_TAGS.contains(&tag) {
                return Err(ParseError::UnknownTag(tag.to_string()));
            }
            let event: RelayWireEvent = serde_json::from_value(value.clone())
                .map_err(|e| ParseError::Malformed(e.to_string()))?;
            return Ok((event.into(), WireVariant::ConversationRelay));
        }

        if let Some(tag) = value.get("event").and_then(|t| t.as_str()) {
            if !STREAM_TAGS.contains(&tag) {
                return Err(ParseError::UnknownTag(tag.to_string()));
            }
            let event: StreamWireEvent = serde_json::from_value(value.clone())
                .map_err(|e| ParseError::Malformed(e.to_string()))?;
            return Ok((event.into(), WireVariant::MediaStream));
        }

        Err(ParseError::Malformed("missing type/event tag".to_string()))
    }
}

impl From<RelayWireEvent> for RelayEvent {
    fn from(event: RelayWireEvent) -> Self {
        match event {
            RelayWireEvent::Setup {
                session_id,
                call_sid,
                from,
                to,
                direction,
            } => RelayEvent::Setup(CallSetup {
                session_id,
                call_sid,
                from,
                to,
                direction,
            }),
            RelayWireEvent::Prompt {
                voice_prompt,
                lang,
                last,
            } => RelayEvent::Utterance {
                text: voice_prompt,
                lang,
                last,
            },
            RelayWireEvent::Dtmf { digit } => RelayEvent::Dtmf { digit },
            RelayWireEvent::Interrupt {
                utterance_until_interrupt,
                duration_until_interrupt_ms,
            } => RelayEvent::Interrupt {
                utterance: utterance_until_interrupt,
                duration_ms: duration_until_interrupt_ms,
            },
        }
    }
}

impl From<StreamWireEvent> for RelayEvent {
    fn from(event: StreamWireEvent) -> Self {
        match event {
            StreamWireEvent::Start { stream_sid } => RelayEvent::Start { stream_sid },
            StreamWireEvent::Transcript { transcript } => RelayEvent::Utterance {
                text: transcript,
                lang: None,
                last: true,
            },
            StreamWireEvent::Stop {} => RelayEvent::Stop,
        }
    }
}

/// Encode one terminal text reply in the connection's wire dialect.
pub fn encode_text(variant: WireVariant, text: &str) -> String {
    match variant {
        WireVariant::ConversationRelay => {
            json!({ "type": "text", "token": text, "last": true }).to_string()
        }
        WireVariant::MediaStream => json!({ "event": "text", "text": text }).to_string(),
    }
}
