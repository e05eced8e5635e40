use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::booking::extract::{FieldExtractor, RegexExtractor};
use crate::completion::{CompletionBackend, CompletionError, CompletionOutcome};
use crate::relay::event::{encode_text, ParseError, RelayEvent, WireVariant};
use crate::relay::session::{Session, Turn};
use crate::tools::ToolRegistry;
use crate::AppState;

/// Sent to the caller whenever reply generation fails.
pub const FALLBACK_REPLY: &str =
    "I apologize, I encountered an error processing your request.";

/// WebSocket upgrade handler for GET /relay.
pub async fn handle_relay_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state))
}

/// Process one ConversationRelay WebSocket connection.
///
/// Uses `tokio::select!` to multiplex between inbound events and outbound
/// frames queued by spawned utterance tasks, so the read loop never blocks
/// on a completion call. Overlapping prompts are not serialized; replies can
/// land out of order (accepted limitation, one caller per connection).
async fn handle_relay_socket(mut socket: WebSocket, state: AppState) {
    tracing::info!("ConversationRelay connected");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
    let conn = RelayConnection::new(
        Arc::clone(&state.backend),
        Arc::clone(&state.tools),
        Arc::new(RegexExtractor),
        state.config.assistant.max_history_turns,
        &crate::prompt::system_prompt(&state.config.twilio.phone_number),
        outbound_tx,
    );

    loop {
        tokio::select! {
            ws_msg = socket.recv() => {
                let raw = match ws_msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("ConversationRelay disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {e}");
                        break;
                    }
                    _ => continue,
                };

                if !conn.handle_raw(&raw).await {
                    break;
                }
            }

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = socket.send(Message::Text(frame.into())).await {
                    tracing::error!("Failed to send reply: {e}");
                    break;
                }
            }
        }
    }

    conn.finish(&state).await;
}

/// Per-connection dispatcher state. Cheap to clone into spawned tasks.
#[derive(Clone)]
struct RelayConnection {
    session: Arc<Mutex<Session>>,
    backend: Arc<dyn CompletionBackend>,
    tools: Arc<ToolRegistry>,
    extractor: Arc<dyn FieldExtractor>,
    max_history_turns: usize,
    outbound: mpsc::Sender<String>,
    /// Wire dialect, latched from the first parsed event.
    variant: Arc<Mutex<Option<WireVariant>>>,
    /// Cancellation handle for the newest in-flight utterance task.
    in_flight: Arc<Mutex<CancellationToken>>,
}

impl RelayConnection {
    fn new(
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<ToolRegistry>,
        extractor: Arc<dyn FieldExtractor>,
        max_history_turns: usize,
        system_prompt: &str,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::new(system_prompt))),
            backend,
            tools,
            extractor,
            max_history_turns,
            outbound,
            variant: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Parse and dispatch one inbound message. Returns false when the
    /// connection should close. Parse failures are logged and swallowed;
    /// they never terminate the connection.
    async fn handle_raw(&self, raw: &str) -> bool {
        let (event, variant) = match RelayEvent::parse(raw) {
            Ok(parsed) => parsed,
            Err(ParseError::UnknownTag(tag)) => {
                tracing::warn!(tag = %tag, "Ignoring unknown event type");
                return true;
            }
            Err(e) => {
                tracing::warn!("Failed to parse event: {e}");
                return true;
            }
        };

        self.variant.lock().await.get_or_insert(variant);

        match event {
            RelayEvent::Setup(setup) => {
                tracing::info!(
                    session_id = setup.session_id.as_deref().unwrap_or("-"),
                    call_sid = setup.call_sid.as_deref().unwrap_or("-"),
                    from = setup.from.as_deref().unwrap_or("-"),
                    to = setup.to.as_deref().unwrap_or("-"),
                    direction = setup.direction.as_deref().unwrap_or("-"),
                    "Call setup"
                );
                self.session.lock().await.record_setup(setup);
            }
            RelayEvent::Start { stream_sid } => {
                tracing::info!(stream_sid = %stream_sid, "Call started");
                self.session.lock().await.stream_sid = Some(stream_sid);
            }
            RelayEvent::Utterance { text, lang, last } => {
                tracing::info!(
                    utterance = %text,
                    lang = lang.as_deref().unwrap_or("-"),
                    last,
                    "Caller said"
                );
                // Spawn so the read loop keeps receiving while we think
                let conn = self.clone();
                tokio::spawn(async move { conn.on_utterance(text).await });
            }
            RelayEvent::Dtmf { digit } => {
                tracing::info!(digit = %digit, "DTMF digit pressed");
                self.on_dtmf(&digit).await;
            }
            RelayEvent::Interrupt {
                utterance,
                duration_ms,
            } => {
                tracing::info!(
                    spoken = utterance.as_deref().unwrap_or("-"),
                    duration_ms = duration_ms.unwrap_or(0),
                    "Caller interrupted"
                );
                // Abandon the newest in-flight completion; its reply is stale
                self.in_flight.lock().await.cancel();
            }
            RelayEvent::Stop => {
                tracing::info!("Call ended");
                return false;
            }
        }

        true
    }

    /// Keypad routing. Digits 1 and 2 short-circuit to canned replies
    /// without a completion call; anything else is just logged.
    async fn on_dtmf(&self, digit: &str) {
        let reply = match digit {
            "1" => "You pressed 1. Transferring to sales.",
            "2" => "You pressed 2. Transferring to support.",
            _ => return,
        };
        self.emit(reply).await;
    }

    /// Handle one caller utterance end to end. Always emits exactly one
    /// terminal reply (the fallback on failure), unless an interrupt
    /// cancels the task first.
    async fn on_utterance(&self, text: String) {
        let cancel = CancellationToken::new();
        *self.in_flight.lock().await = cancel.clone();

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Utterance handling cancelled by interrupt");
            }
            result = self.respond(&text) => {
                let reply = match result {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::error!("LLM error: {e}");
                        FALLBACK_REPLY.to_string()
                    }
                };
                self.emit(&reply).await;
            }
        }
    }

    /// Append the user turn plus stage context, run the completion, and
    /// execute at most one round of tool calls before the final reply.
    async fn respond(&self, text: &str) -> Result<String, CompletionError> {
        let window = {
            let mut session = self.session.lock().await;
            session.booking.observe_utterance(text, self.extractor.as_ref());
            let context = session.booking.state_context();
            session.push(Turn::user(text));
            session.push(Turn::system(context));
            session.context_window(self.max_history_turns)
        };

        let catalog = ToolRegistry::catalog();
        let outcome = self.backend.complete(&window, Some(&catalog)).await?;

        let calls = match outcome {
            CompletionOutcome::Reply(reply) => {
                self.session.lock().await.push(Turn::assistant(reply.clone()));
                return Ok(reply);
            }
            CompletionOutcome::ToolCalls(calls) => calls,
        };

        self.session
            .lock()
            .await
            .push(Turn::assistant_tool_calls(calls.clone()));

        for call in &calls {
            if call.name == "book_appointment" {
                let mut session = self.session.lock().await;
                session.booking.merge_tool_args(&call.arguments);
                session.booking.begin_booking();
            }

            let result = self.tools.invoke(&call.name, &call.arguments).await;

            if call.name == "book_appointment" && result["success"] == true {
                self.session.lock().await.booking.complete_booking();
            }

            self.session
                .lock()
                .await
                .push(Turn::tool_result(&call.id, result.to_string()));
        }

        // Follow-up completion without the catalog; tool calls don't chain
        let window = self
            .session
            .lock()
            .await
            .context_window(self.max_history_turns);
        match self.backend.complete(&window, None).await? {
            CompletionOutcome::Reply(reply) => {
                self.session.lock().await.push(Turn::assistant(reply.clone()));
                Ok(reply)
            }
            CompletionOutcome::ToolCalls(_) => Err(CompletionError::Parse(
                "tool calls requested in final completion".to_string(),
            )),
        }
    }

    /// Queue one terminal text reply in the connection's wire dialect.
    async fn emit(&self, text: &str) {
        let variant = match *self.variant.lock().await {
            Some(variant) => variant,
            None => {
                tracing::debug!(
                    "No inbound event parsed yet, defaulting to ConversationRelay framing"
                );
                WireVariant::ConversationRelay
            }
        };
        if self.outbound.send(encode_text(variant, text)).await.is_err() {
            tracing::warn!("Outbound channel closed, dropping reply");
        }
    }

    /// Post-call work: submit a Conversational Intelligence transcript when
    /// a service SID is configured. Best effort; failures are logged only.
    async fn finish(&self, state: &AppState) {
        let Some(ref service_sid) = state.config.twilio.intelligence_service_sid else {
            return;
        };

        let (call_sid, customer_key, started_at) = {
            let session = self.session.lock().await;
            let Some(call_sid) = session.call_sid().map(String::from) else {
                tracing::debug!("No call SID recorded, skipping CI transcript");
                return;
            };
            (call_sid, session.setup.from.clone(), session.started_at)
        };

        tracing::info!(call_sid = %call_sid, "Creating Conversational Intelligence transcript");
        match state
            .twilio
            .create_transcript(service_sid, &call_sid, customer_key.as_deref(), started_at)
            .await
        {
            Ok(transcript_sid) => {
                tracing::info!(transcript_sid = %transcript_sid, "CI transcript created");
            }
            Err(e) => tracing::warn!(call_sid = %call_sid, "CI transcript failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ToolCallRequest;
    use crate::config::TwilioConfig;
    use crate::twilio::client::TwilioClient;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Backend that replays a fixed script of outcomes and records whether
    /// each call offered the tool catalog.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<CompletionOutcome, CompletionError>>>,
        saw_tools: Mutex<Vec<bool>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<CompletionOutcome, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                saw_tools: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            _turns: &[Turn],
            tools: Option<&[serde_json::Value]>,
        ) -> Result<CompletionOutcome, CompletionError> {
            self.saw_tools.lock().await.push(tools.is_some());
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(CompletionError::Api("script exhausted".into())))
        }
    }

    /// Backend that never resolves, for interrupt cancellation tests.
    struct HangingBackend;

    #[async_trait::async_trait]
    impl CompletionBackend for HangingBackend {
        async fn complete(
            &self,
            _turns: &[Turn],
            _tools: Option<&[serde_json::Value]>,
        ) -> Result<CompletionOutcome, CompletionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(CompletionError::Api("unreachable".into()))
        }
    }

    fn test_registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(Arc::new(TwilioClient::new(
            &TwilioConfig {
                account_sid: "AC_test".into(),
                auth_token: "token".into(),
                phone_number: "+15550100".into(),
                intelligence_service_sid: None,
            },
        ))))
    }

    fn connection(
        backend: Arc<dyn CompletionBackend>,
    ) -> (RelayConnection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = RelayConnection::new(
            backend,
            test_registry(),
            Arc::new(RegexExtractor),
            64,
            "You are Sarah.",
            tx,
        );
        (conn, rx)
    }

    #[tokio::test]
    async fn each_prompt_gets_exactly_one_terminal_reply() {
        let backend = ScriptedBackend::new(vec![
            Ok(CompletionOutcome::Reply("Hello! How can I help?".into())),
            Ok(CompletionOutcome::Reply("We open at nine.".into())),
        ]);
        let (conn, mut rx) = connection(backend);

        assert!(conn.handle_raw(r#"{"type":"prompt","voicePrompt":"hi"}"#).await);
        assert!(
            conn.handle_raw(r#"{"type":"prompt","voicePrompt":"when do you open?"}"#)
                .await
        );

        let first: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "text");
        assert_eq!(first["last"], true);
        assert_eq!(second["type"], "text");
        // Two prompts, two replies, nothing more queued
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn completion_failure_emits_the_fixed_apology() {
        let backend =
            ScriptedBackend::new(vec![Err(CompletionError::Api("503".into()))]);
        let (conn, mut rx) = connection(backend);

        conn.handle_raw(r#"{"type":"prompt","voicePrompt":"hello?"}"#).await;

        let frame: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["token"], FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn malformed_event_appends_no_turn_and_keeps_connection_open() {
        let backend = ScriptedBackend::new(vec![]);
        let (conn, mut rx) = connection(backend);

        assert!(conn.handle_raw("{not json at all").await);
        assert!(conn.handle_raw(r#"{"type":"ping"}"#).await);

        assert_eq!(conn.session.lock().await.turns().len(), 1); // system only
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tool_round_trip_produces_final_reply_from_second_call() {
        let backend = ScriptedBackend::new(vec![
            Ok(CompletionOutcome::ToolCalls(vec![ToolCallRequest {
                id: "call_1".into(),
                name: "check_availability".into(),
                arguments: json!({ "date": "2025-03-14" }),
            }])),
            Ok(CompletionOutcome::Reply("We have 2pm open.".into())),
        ]);
        let (conn, mut rx) = connection(Arc::clone(&backend) as Arc<dyn CompletionBackend>);

        conn.handle_raw(r#"{"type":"prompt","voicePrompt":"anything on the 14th?"}"#)
            .await;

        let frame: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["token"], "We have 2pm open.");

        // First call offered the catalog, the follow-up did not
        assert_eq!(*backend.saw_tools.lock().await, vec![true, false]);

        let session = conn.session.lock().await;
        let tool_turn = session
            .turns()
            .iter()
            .find(|t| t.tool_call_id.as_deref() == Some("call_1"))
            .expect("tool result turn");
        let result: serde_json::Value = serde_json::from_str(&tool_turn.content).unwrap();
        assert_eq!(result["available"], true);
    }

    #[tokio::test]
    async fn unknown_tool_result_is_fed_back_into_history() {
        let backend = ScriptedBackend::new(vec![
            Ok(CompletionOutcome::ToolCalls(vec![ToolCallRequest {
                id: "call_7".into(),
                name: "foo".into(),
                arguments: json!({}),
            }])),
            Ok(CompletionOutcome::Reply("Sorry, I can't do that.".into())),
        ]);
        let (conn, mut rx) = connection(backend);

        conn.handle_raw(r#"{"type":"prompt","voicePrompt":"do the foo thing"}"#)
            .await;
        rx.recv().await.unwrap();

        let session = conn.session.lock().await;
        let tool_turn = session
            .turns()
            .iter()
            .find(|t| t.tool_call_id.as_deref() == Some("call_7"))
            .expect("tool result turn");
        assert_eq!(tool_turn.content, r#"{"error":"Unknown tool: foo"}"#);
    }

    #[tokio::test]
    async fn successful_booking_drives_stage_to_complete() {
        let backend = ScriptedBackend::new(vec![
            Ok(CompletionOutcome::ToolCalls(vec![ToolCallRequest {
                id: "call_2".into(),
                name: "book_appointment".into(),
                arguments: json!({
                    "date": "tomorrow",
                    "time": "2pm",
                    "customerName": "Maria Lopez",
                    "phone": "415-555-0100"
                }),
            }])),
            Ok(CompletionOutcome::Reply("You're all booked!".into())),
        ]);
        let (conn, mut rx) = connection(backend);

        // Walk the stage machine to confirming before the model books
        {
            let mut session = conn.session.lock().await;
            session.booking.observe_utterance(
                "I want to book an appointment tomorrow at 2pm, 415-555-0100",
                &RegexExtractor,
            );
            session.booking.fields.customer_name = Some("Maria Lopez".into());
            session.booking.observe_utterance("that's everything", &RegexExtractor);
        }

        conn.handle_raw(r#"{"type":"prompt","voicePrompt":"yes, book it"}"#).await;
        rx.recv().await.unwrap();

        assert_eq!(
            conn.session.lock().await.booking.stage,
            crate::booking::Stage::Complete
        );
    }

    #[tokio::test]
    async fn dtmf_routes_without_a_completion_call() {
        let backend = ScriptedBackend::new(vec![]);
        let (conn, mut rx) = connection(Arc::clone(&backend) as Arc<dyn CompletionBackend>);

        conn.handle_raw(r#"{"type":"dtmf","digit":"1"}"#).await;
        let frame: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["token"], "You pressed 1. Transferring to sales.");

        conn.handle_raw(r#"{"type":"dtmf","digit":"9"}"#).await;
        assert!(rx.try_recv().is_err());
        assert!(backend.saw_tools.lock().await.is_empty());
    }

    #[tokio::test]
    async fn media_stream_dialect_gets_media_stream_replies() {
        let backend =
            ScriptedBackend::new(vec![Ok(CompletionOutcome::Reply("Hi there.".into()))]);
        let (conn, mut rx) = connection(backend);

        assert!(conn.handle_raw(r#"{"event":"start","streamSid":"MZ1"}"#).await);
        assert!(
            conn.handle_raw(r#"{"event":"transcript","transcript":"hello"}"#)
                .await
        );

        let frame: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "text");
        assert_eq!(frame["text"], "Hi there.");

        // Stop closes the connection
        assert!(!conn.handle_raw(r#"{"event":"stop"}"#).await);
    }

    #[tokio::test]
    async fn interrupt_cancels_the_in_flight_completion() {
        let (conn, mut rx) = connection(Arc::new(HangingBackend));

        conn.handle_raw(r#"{"type":"prompt","voicePrompt":"tell me everything"}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.handle_raw(
            r#"{"type":"interrupt","utteranceUntilInterrupt":"Well, as I","durationUntilInterruptMs":900}"#,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "cancelled task must emit nothing");
    }

    #[tokio::test]
    async fn emit_before_any_event_defaults_to_relay_framing() {
        let backend = ScriptedBackend::new(vec![]);
        let (conn, mut rx) = connection(backend);

        conn.emit("hello?").await;

        let frame: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "text");
        assert_eq!(frame["token"], "hello?");
    }

    #[tokio::test]
    async fn setup_metadata_is_recorded() {
        let backend = ScriptedBackend::new(vec![]);
        let (conn, _rx) = connection(backend);

        conn.handle_raw(
            r#"{"type":"setup","sessionId":"VX1","callSid":"CA42","from":"+15550111","to":"+15550100","direction":"inbound"}"#,
        )
        .await;

        let session = conn.session.lock().await;
        assert_eq!(session.call_sid(), Some("CA42"));
        assert_eq!(session.setup.direction.as_deref(), Some("inbound"));
    }
}
