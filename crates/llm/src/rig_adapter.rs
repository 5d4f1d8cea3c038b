use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::{gemini, openai};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, EmptyPromptSnafu, HttpClientSnafu, LlmProvider, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderMessage, ProviderResult, ProviderStreamHandle,
    ProviderWorker, Role, StreamEventPayload, StreamRequest, UnsupportedProviderSnafu,
    event_channel,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const OPENAI_PROVIDER_ID: &str = "openai";

/// Hosted APIs reachable through rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    OpenAi,
}

impl ProviderKind {
    pub fn from_id(provider_id: &str) -> Option<Self> {
        match provider_id.trim().to_ascii_lowercase().as_str() {
            "" | GEMINI_PROVIDER_ID => Some(Self::Gemini),
            OPENAI_PROVIDER_ID => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn provider_id(self) -> &'static str {
        match self {
            Self::Gemini => GEMINI_PROVIDER_ID,
            Self::OpenAi => OPENAI_PROVIDER_ID,
        }
    }
}

pub struct RigProviderAdapter {
    config: ProviderConfig,
    kind: ProviderKind,
}

impl RigProviderAdapter {
    pub fn new(mut config: ProviderConfig) -> ProviderResult<Self> {
        let Some(kind) = ProviderKind::from_id(&config.provider_id) else {
            return UnsupportedProviderSnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id,
            }
            .fail();
        };
        config.provider_id = kind.provider_id().to_string();

        ensure!(
            config.has_api_key(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config, kind })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn gemini_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-gemini-client",
        })
    }

    fn openai_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-openai-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    /// Upstream APIs reject empty turns; a placeholder that failed before any
    /// text arrived can leave one behind.
    fn history_messages(history: &[ProviderMessage]) -> Vec<RigMessage> {
        history
            .iter()
            .filter(|message| !message.content.is_empty())
            .map(Self::to_rig_message)
            .collect()
    }

    async fn open_stream<M>(
        model: M,
        request: &StreamRequest,
    ) -> ProviderResult<StreamingCompletionResponse<M::StreamingResponse>>
    where
        M: CompletionModel,
    {
        let history = Self::history_messages(&request.history);

        tracing::debug!(
            model_id = %request.model_id,
            history_len = history.len(),
            "opening provider stream"
        );

        let mut builder = model
            .completion_request(RigMessage::user(request.prompt.clone()))
            .messages(history);

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            builder = builder.preamble(preamble.clone());
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(event_tx: &mpsc::UnboundedSender<StreamEventPayload>, error: ProviderError) {
        let _ = event_tx.send(StreamEventPayload::error(&error));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventPayload::Delta(text.text))
            }
            // Only answer text reaches the transcript.
            StreamedAssistantContent::Text(_)
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker<M>(
        model: M,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventPayload>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) where
        M: CompletionModel + 'static,
    {
        let mut stream = match Self::open_stream(model, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(model_id = %request.model_id, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventPayload::Done);
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        match self.kind {
            ProviderKind::Gemini => "Rig Gemini",
            ProviderKind::OpenAi => "Rig OpenAI",
        }
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = event_channel();
        let worker: ProviderWorker = match self.kind {
            ProviderKind::Gemini => {
                let model = Self::gemini_client(&self.config)?
                    .completion_model(request.model_id.clone());
                Box::pin(Self::run_stream_worker(model, request, event_tx, cancel_rx))
            }
            ProviderKind::OpenAi => {
                let model = Self::openai_client(&self.config)?
                    .completion_model(request.model_id.clone());
                Box::pin(Self::run_stream_worker(model, request, event_tx, cancel_rx))
            }
        };

        Ok(ProviderStreamHandle { stream, worker })
    }
}
