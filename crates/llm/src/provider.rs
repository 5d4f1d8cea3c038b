use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Sender vocabulary understood by the hosted chat API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One streaming turn: prior history plus the new user prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub history: Vec<ProviderMessage>,
    pub prompt: String,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
}

impl StreamRequest {
    pub fn new(
        model_id: impl Into<String>,
        history: Vec<ProviderMessage>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            history,
            prompt: prompt.into(),
            preamble: None,
            temperature: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Coarse failure class exposed past the provider boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Detected before any network attempt.
    Configuration,
    /// Network, upstream API or stream decoding failure.
    Transport,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for model '{model_id}' has an empty prompt"))]
    EmptyPrompt {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingApiKey { .. }
            | Self::UnsupportedProvider { .. }
            | Self::EmptyPrompt { .. } => ErrorKind::Configuration,
            Self::HttpClient { .. } | Self::CompletionsFailed { .. } => ErrorKind::Transport,
        }
    }
}

/// Provider-agnostic stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error { kind: ErrorKind, message: String },
}

impl StreamEventPayload {
    pub fn error(error: &ProviderError) -> Self {
        Self::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEventPayload>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Receiver side plus the future that produces its events.
///
/// The worker does nothing until it is spawned. It watches the cancel signal
/// sent when the [`ProviderEventStream`] is dropped.
pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    fn new(
        events: mpsc::UnboundedReceiver<StreamEventPayload>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEventPayload> {
        self.events.recv().await
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds the channel pair backing a [`ProviderEventStream`].
///
/// Returns the event sender and cancel receiver for the worker side.
pub fn event_channel() -> (
    mpsc::UnboundedSender<StreamEventPayload>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_trims_fields() {
        let config = ProviderConfig::new(" gemini ", "  key-123\n", " https://example.test ");

        assert_eq!(config.provider_id, "gemini");
        assert_eq!(config.api_key, "key-123");
        assert_eq!(config.endpoint, "https://example.test");
        assert!(config.has_api_key());
        assert!(!ProviderConfig::new("gemini", "   ", "").has_api_key());
    }

    #[test]
    fn configuration_errors_are_classified_before_transport() {
        let missing = ProviderError::MissingApiKey {
            stage: "test",
            provider_id: "gemini".to_string(),
        };
        let unsupported = ProviderError::UnsupportedProvider {
            stage: "test",
            provider_id: "palm".to_string(),
        };

        assert_eq!(missing.kind(), ErrorKind::Configuration);
        assert_eq!(unsupported.kind(), ErrorKind::Configuration);
        assert_eq!(
            StreamEventPayload::error(&missing),
            StreamEventPayload::Error {
                kind: ErrorKind::Configuration,
                message: "missing API key for provider 'gemini'".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn dropping_event_stream_signals_cancel() {
        let (event_tx, stream, mut cancel_rx) = event_channel();
        event_tx
            .send(StreamEventPayload::Delta("partial".to_string()))
            .unwrap();

        drop(stream);

        assert!(cancel_rx.try_recv().is_ok());
        assert!(event_tx.send(StreamEventPayload::Done).is_err());
    }

    #[tokio::test]
    async fn finished_worker_closes_the_stream() {
        let (event_tx, mut stream, _cancel_rx) = event_channel();
        event_tx.send(StreamEventPayload::Done).unwrap();
        drop(event_tx);

        assert_eq!(stream.recv().await, Some(StreamEventPayload::Done));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (event_tx, mut stream, _cancel_rx) = event_channel();
        for chunk in ["A", "B", "C"] {
            event_tx
                .send(StreamEventPayload::Delta(chunk.to_string()))
                .unwrap();
        }
        event_tx.send(StreamEventPayload::Done).unwrap();
        drop(event_tx);

        let mut received = Vec::new();
        while let Some(event) = stream.recv().await {
            received.push(event);
        }

        assert_eq!(
            received,
            vec![
                StreamEventPayload::Delta("A".to_string()),
                StreamEventPayload::Delta("B".to_string()),
                StreamEventPayload::Delta("C".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }
}
