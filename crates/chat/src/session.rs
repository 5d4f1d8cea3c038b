use estate_llm::ErrorKind;

use crate::gateway::{GatewayEvent, GatewayOutcome, GatewayStream, ModelGateway};
use crate::message::{
    ChatMessage, MessageId, StreamState, StreamTransition, StreamTransitionRejection, Transcript,
};

pub const WELCOME_TEXT: &str = "您好！我是国信达智能助手。我可以为您分析宏观经济、房企数据、土地交易以及楼市走向。请问有什么可以帮您？";

/// Why a submission was refused. The transcript is untouched in both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    EmptyInput,
    Busy { active: MessageId },
}

/// One applied change, reported so a front-end can render incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Fragment {
        message_id: MessageId,
        text: String,
    },
    Finished {
        message_id: MessageId,
        outcome: GatewayOutcome,
    },
}

struct ActiveReply {
    message_id: MessageId,
    stream: GatewayStream,
}

/// Owns the transcript and the single outstanding gateway exchange.
pub struct ChatSession {
    gateway: ModelGateway,
    transcript: Transcript,
    stream_state: StreamState,
    active: Option<ActiveReply>,
}

impl ChatSession {
    /// Creates a session holding only the welcome message.
    pub fn new(gateway: ModelGateway) -> Self {
        let mut session = Self {
            gateway,
            transcript: Transcript::new(),
            stream_state: StreamState::Idle,
            active: None,
        };
        session.reset();
        session
    }

    /// Starts over with only the welcome message.
    ///
    /// An in-flight exchange is dropped, which cancels the upstream request.
    pub fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(message_id = %active.message_id, "dropping in-flight reply on reset");
        }
        self.transcript = Transcript::new();
        self.transcript.push(ChatMessage::model(WELCOME_TEXT));
        self.stream_state = StreamState::Idle;
    }

    /// Gateway fixed at construction.
    pub fn gateway(&self) -> &ModelGateway {
        &self.gateway
    }

    /// Transcript in display order.
    pub fn messages(&self) -> &[ChatMessage] {
        self.transcript.messages()
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream_state
    }

    /// True while a reply is streaming; input should be blocked.
    pub fn is_loading(&self) -> bool {
        self.stream_state.is_streaming()
    }

    /// The placeholder currently receiving fragments.
    pub fn streaming_message(&self) -> Option<&ChatMessage> {
        self.stream_state
            .active_message()
            .and_then(|id| self.transcript.get(id))
    }

    /// Appends the user turn and a streaming placeholder, then opens the exchange.
    ///
    /// Returns the placeholder id. Drive the reply with [`Self::next_update`] or
    /// [`Self::finish`].
    pub fn submit(&mut self, text: &str) -> Result<MessageId, SubmitRejection> {
        if text.trim().is_empty() {
            return Err(SubmitRejection::EmptyInput);
        }

        let placeholder = ChatMessage::model_placeholder();
        let placeholder_id = placeholder.id;
        self.stream_state = match self
            .stream_state
            .apply(StreamTransition::Start(placeholder_id))
        {
            Ok(state) => state,
            Err(StreamTransitionRejection::AlreadyStreaming { active, .. }) => {
                tracing::debug!(active = %active, "submit ignored while a reply is streaming");
                return Err(SubmitRejection::Busy { active });
            }
            Err(rejection) => {
                tracing::error!(?rejection, "unexpected stream start rejection");
                return Err(SubmitRejection::Busy {
                    active: placeholder_id,
                });
            }
        };

        // History is captured before the two new entries are appended.
        let stream = self
            .gateway
            .stream_response(self.transcript.messages(), text);

        self.transcript.push(ChatMessage::user(text));
        self.transcript.push(placeholder);
        self.active = Some(ActiveReply {
            message_id: placeholder_id,
            stream,
        });

        tracing::info!(
            message_id = %placeholder_id,
            transcript_len = self.transcript.len(),
            "submitted user message"
        );

        Ok(placeholder_id)
    }

    /// Waits for the next gateway event and applies it to the transcript.
    ///
    /// Returns `None` when nothing is streaming.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let active = self.active.as_mut()?;
        let message_id = active.message_id;

        let event = active.stream.next().await;
        match event {
            Some(GatewayEvent::Fragment(text)) => {
                if !self.transcript.append_fragment(message_id, &text) {
                    tracing::warn!(message_id = %message_id, "fragment target is not streaming");
                }
                Some(SessionUpdate::Fragment { message_id, text })
            }
            Some(GatewayEvent::Finished(outcome)) => Some(self.complete(message_id, outcome)),
            // The gateway always ends with `Finished`; treat a silent end as a transport failure.
            None => Some(self.complete(
                message_id,
                GatewayOutcome::Failed(ErrorKind::Transport),
            )),
        }
    }

    /// Drives the active reply to its end.
    pub async fn finish(&mut self) -> Option<GatewayOutcome> {
        while let Some(update) = self.next_update().await {
            if let SessionUpdate::Finished { outcome, .. } = update {
                return Some(outcome);
            }
        }
        None
    }

    /// Submits and waits for the full reply.
    pub async fn send(&mut self, text: &str) -> Result<GatewayOutcome, SubmitRejection> {
        let message_id = self.submit(text)?;
        let outcome = self
            .finish()
            .await
            .unwrap_or(GatewayOutcome::Failed(ErrorKind::Transport));

        match outcome {
            GatewayOutcome::Completed => {
                tracing::info!(message_id = %message_id, "reply completed");
            }
            GatewayOutcome::Failed(kind) => {
                tracing::warn!(message_id = %message_id, ?kind, "reply ended with failure text");
            }
        }
        Ok(outcome)
    }

    fn complete(&mut self, message_id: MessageId, outcome: GatewayOutcome) -> SessionUpdate {
        self.active = None;
        self.transcript.finish_streaming(message_id);

        let transition = match outcome {
            GatewayOutcome::Completed => StreamTransition::Complete(message_id),
            GatewayOutcome::Failed(kind) => StreamTransition::Fail { message_id, kind },
        };
        match self.stream_state.apply(transition) {
            Ok(state) => self.stream_state = state,
            Err(rejection) => {
                tracing::error!(?rejection, "stream completion rejected; resetting to idle");
                self.stream_state = StreamState::Idle;
            }
        }

        SessionUpdate::Finished {
            message_id,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use estate_llm::StreamEventPayload;

    use super::*;
    use crate::gateway::tests::{ScriptedProvider, StallingProvider};
    use crate::gateway::{CONNECTION_LOST_TEXT, MISSING_CREDENTIAL_TEXT};
    use crate::message::Role;

    fn session_with(provider: std::sync::Arc<ScriptedProvider>) -> ChatSession {
        ChatSession::new(ModelGateway::new(Some(provider)))
    }

    #[test]
    fn new_session_holds_only_the_welcome_message() {
        let session = ChatSession::new(ModelGateway::new(None));

        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Role::Model);
        assert_eq!(session.messages()[0].text, WELCOME_TEXT);
        assert!(!session.messages()[0].is_streaming);
        assert!(!session.is_loading());
    }

    #[test]
    fn blank_input_is_a_no_op() {
        let mut session = ChatSession::new(ModelGateway::new(None));

        assert_eq!(session.submit(""), Err(SubmitRejection::EmptyInput));
        assert_eq!(session.submit("   "), Err(SubmitRejection::EmptyInput));
        assert_eq!(session.messages().len(), 1);
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn submit_appends_user_and_streaming_placeholder() {
        let mut session = session_with(ScriptedProvider::fragments(&["好"]));

        let placeholder_id = session.submit("北京新房价格走势？").unwrap();

        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].text, "北京新房价格走势？");
        assert_eq!(messages[2].id, placeholder_id);
        assert_eq!(messages[2].role, Role::Model);
        assert!(messages[2].text.is_empty());
        assert!(messages[2].is_streaming);
        assert!(session.is_loading());
        assert_eq!(session.streaming_message().map(|m| m.id), Some(placeholder_id));
    }

    #[tokio::test]
    async fn submit_while_loading_is_rejected_without_mutation() {
        let mut session = session_with(ScriptedProvider::fragments(&["A"]));
        let placeholder_id = session.submit("first").unwrap();
        let before = session.messages().to_vec();

        assert_eq!(
            session.submit("second"),
            Err(SubmitRejection::Busy {
                active: placeholder_id
            })
        );
        assert_eq!(session.messages(), before.as_slice());
        assert!(session.is_loading());
    }

    #[tokio::test]
    async fn fragments_accumulate_in_order() {
        let mut session = session_with(ScriptedProvider::fragments(&["A", "B", "C"]));
        let placeholder_id = session.submit("hi").unwrap();

        let mut updates = Vec::new();
        while let Some(update) = session.next_update().await {
            assert!(session.transcript.streaming_count() <= 1);
            let finished = matches!(update, SessionUpdate::Finished { .. });
            updates.push(update);
            if finished {
                break;
            }
        }

        assert_eq!(updates.len(), 4);
        assert_eq!(
            updates.last(),
            Some(&SessionUpdate::Finished {
                message_id: placeholder_id,
                outcome: GatewayOutcome::Completed,
            })
        );
        let reply = session.messages().last().unwrap();
        assert_eq!(reply.text, "ABC");
        assert!(!reply.is_streaming);
        assert!(!session.is_loading());
        assert_eq!(session.stream_state(), StreamState::Completed(placeholder_id));
        assert!(session.next_update().await.is_none());
    }

    #[tokio::test]
    async fn each_exchange_grows_transcript_by_two() {
        let mut session = session_with(ScriptedProvider::fragments(&["ok"]));

        for round in 1..=3 {
            let outcome = session.send(&format!("问题 {round}")).await.unwrap();
            assert_eq!(outcome, GatewayOutcome::Completed);
            assert_eq!(session.messages().len(), 1 + 2 * round);
            assert_eq!(session.transcript.streaming_count(), 0);
        }
    }

    #[tokio::test]
    async fn history_excludes_the_new_turn() {
        let provider = ScriptedProvider::fragments(&["ok"]);
        let mut session = session_with(provider.clone());

        session.send("第一问").await.unwrap();
        session.send("第二问").await.unwrap();

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].history.len(), 1);
        assert_eq!(requests[0].prompt, "第一问");
        assert_eq!(requests[1].history.len(), 3);
        assert_eq!(requests[1].history[1].content, "第一问");
        assert_eq!(requests[1].history[2].content, "ok");
        assert_eq!(requests[1].prompt, "第二问");
    }

    #[tokio::test]
    async fn missing_credential_ends_with_configuration_text() {
        let mut session = ChatSession::new(ModelGateway::new(None));

        let placeholder_id = session.submit("土地成交情况如何？").unwrap();
        let mut fragments = Vec::new();
        let mut outcome = None;
        while let Some(update) = session.next_update().await {
            match update {
                SessionUpdate::Fragment { text, .. } => fragments.push(text),
                SessionUpdate::Finished { outcome: done, .. } => outcome = Some(done),
            }
        }

        assert_eq!(fragments, vec![MISSING_CREDENTIAL_TEXT.to_string()]);
        assert_eq!(
            outcome,
            Some(GatewayOutcome::Failed(ErrorKind::Configuration))
        );
        let reply = session.messages().last().unwrap();
        assert_eq!(reply.id, placeholder_id);
        assert_eq!(reply.text, MISSING_CREDENTIAL_TEXT);
        assert!(!reply.is_streaming);
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn open_failure_unblocks_input_with_apology() {
        let mut session = session_with(ScriptedProvider::failing_on_open());

        let outcome = session.send("hi").await.unwrap();

        assert_eq!(outcome, GatewayOutcome::Failed(ErrorKind::Transport));
        assert!(!session.is_loading());
        assert_eq!(session.messages().last().unwrap().text, CONNECTION_LOST_TEXT);

        // The session stays usable after a failure.
        assert!(session.submit("again").is_ok());
    }

    #[tokio::test]
    async fn partial_reply_is_kept_before_apology() {
        let mut session = session_with(ScriptedProvider::replying(vec![
            StreamEventPayload::Delta("北京".to_string()),
            StreamEventPayload::Error {
                kind: ErrorKind::Transport,
                message: "reset".to_string(),
            },
        ]));

        session.send("hi").await.unwrap();

        assert_eq!(
            session.messages().last().unwrap().text,
            format!("北京{CONNECTION_LOST_TEXT}")
        );
    }

    #[tokio::test]
    async fn reset_drops_in_flight_reply() {
        let mut session = session_with(ScriptedProvider::fragments(&["A"]));
        session.submit("hi").unwrap();

        session.reset();

        assert_eq!(session.messages().len(), 1);
        assert!(!session.is_loading());
        assert!(session.next_update().await.is_none());
    }

    #[tokio::test]
    async fn reset_cancels_the_upstream_request() {
        let (provider, cancelled) = StallingProvider::new();
        let mut session = ChatSession::new(ModelGateway::new(Some(provider)));
        let placeholder_id = session.submit("hi").unwrap();

        assert_eq!(
            session.next_update().await,
            Some(SessionUpdate::Fragment {
                message_id: placeholder_id,
                text: "部分".to_string(),
            })
        );
        session.reset();

        assert_eq!(cancelled.await, Ok(true));
        assert_eq!(session.messages().len(), 1);
    }
}
