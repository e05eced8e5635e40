use axum::extract::State;
use axum::response::{IntoResponse, Response};

use crate::AppState;

/// Handle POST /voice — Twilio webhook for incoming and outgoing calls.
///
/// Responds with TwiML that connects the call to ConversationRelay. Twilio
/// then owns speech-to-text and text-to-speech and opens a WSS connection
/// to /relay, where we exchange plain text.
pub async fn handle_voice(State(state): State<AppState>) -> Response {
    let twiml = relay_twiml(&state.config.server.relay_url());
    ([("Content-Type", "text/xml")], twiml).into_response()
}

fn relay_twiml(ws_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <ConversationRelay url="{ws_url}" dtmfDetection="true" />
    </Connect>
</Response>"#
    )
}
