use std::collections::VecDeque;
use std::sync::Arc;

use estate_llm::{
    ErrorKind, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderWorker, Role as ProviderRole, StreamEventPayload, StreamRequest, create_provider,
};

use tokio::task::JoinHandle;

use crate::message::{ChatMessage, Role};

pub const DEFAULT_MODEL_ID: &str = "gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

pub const SYSTEM_INSTRUCTION: &str = "\
你现在是“国信达智能助手”，北京国信达数据技术有限公司的房地产专业分析专家。
你的职责是辅助用户分析中国房地产市场数据，重点关注宏观经济、房企经营、土地市场和楼市走向（尤其是北京及一线城市）。

你的知识库包括：
1. 宏观经济：GDP、政策法规、利率变动。
2. 房企信息：财务状况、土地储备、销售排行。
3. 土地市场：成交价格、溢价率、流拍情况。
4. 楼市行情：新房及二手房价格趋势、库存周期。

回答要求：
1. 必须使用中文回答。
2. 语气专业、客观、简洁，使用数据驱动的语言。
3. 如果用户询问屏幕上展示的数据，假设你能看到上下文中的图表和表格。
4. 使用Markdown格式优化排版（如使用列表、加粗强调关键数据）。
";

/// Shown when no credential was configured at startup.
pub const MISSING_CREDENTIAL_TEXT: &str = "错误：未配置API密钥。请检查环境变量设置。";

/// Appended when the upstream exchange fails for any reason.
pub const CONNECTION_LOST_TEXT: &str = "\n\n(系统提示: 分析引擎连接中断，请稍后再试。)";

/// How one gateway exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOutcome {
    Completed,
    Failed(ErrorKind),
}

/// One step of a gateway exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Non-empty text to append to the reply.
    Fragment(String),
    /// Always the last event of an exchange.
    Finished(GatewayOutcome),
}

enum ProviderSlot {
    Ready(Arc<dyn LlmProvider>),
    MissingCredential,
    /// Construction failed for a reason other than the credential.
    Unavailable(ErrorKind),
}

/// Stateless bridge from transcript turns to a streaming provider.
pub struct ModelGateway {
    provider: ProviderSlot,
    model_id: String,
    temperature: f64,
    system_instruction: String,
}

impl ModelGateway {
    /// Wraps an already built provider. `None` means no credential was configured.
    pub fn new(provider: Option<Arc<dyn LlmProvider>>) -> Self {
        let provider = match provider {
            Some(provider) => ProviderSlot::Ready(provider),
            None => ProviderSlot::MissingCredential,
        };
        Self::with_slot(provider)
    }

    /// Builds the provider from startup configuration.
    ///
    /// A missing key leaves the gateway answering with [`MISSING_CREDENTIAL_TEXT`].
    /// Any other construction failure answers with [`CONNECTION_LOST_TEXT`] and
    /// the error's kind.
    pub fn from_config(config: ProviderConfig) -> Self {
        let provider_id = config.provider_id.clone();
        match create_provider(config) {
            Ok(provider) => {
                tracing::info!(
                    provider_id = %provider.id(),
                    provider_name = %provider.name(),
                    "model gateway initialized"
                );
                Self::new(Some(provider))
            }
            Err(error @ ProviderError::MissingApiKey { .. }) => {
                tracing::warn!(
                    provider_id = %provider_id,
                    error = %error,
                    "model gateway has no credential"
                );
                Self::new(None)
            }
            Err(error) => {
                tracing::error!(
                    provider_id = %provider_id,
                    error = %error,
                    "failed to initialize model provider"
                );
                Self::with_slot(ProviderSlot::Unavailable(error.kind()))
            }
        }
    }

    fn with_slot(provider: ProviderSlot) -> Self {
        Self {
            provider,
            model_id: DEFAULT_MODEL_ID.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
        }
    }

    /// Overrides the model id; blank values keep the default.
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        if !model_id.trim().is_empty() {
            self.model_id = model_id.trim().to_string();
        }
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// True when exchanges reach a real provider.
    pub fn is_configured(&self) -> bool {
        matches!(self.provider, ProviderSlot::Ready(_))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Opens one exchange. `history` must not contain `text` itself.
    pub fn stream_response(&self, history: &[ChatMessage], text: &str) -> GatewayStream {
        let provider = match &self.provider {
            ProviderSlot::Ready(provider) => provider,
            ProviderSlot::MissingCredential => {
                return GatewayStream::failed(MISSING_CREDENTIAL_TEXT, ErrorKind::Configuration);
            }
            ProviderSlot::Unavailable(kind) => {
                return GatewayStream::failed(CONNECTION_LOST_TEXT, *kind);
            }
        };

        let request = StreamRequest::new(
            self.model_id.clone(),
            history.iter().map(to_provider_message).collect(),
            text,
        )
        .with_preamble(self.system_instruction.clone())
        .with_temperature(self.temperature);

        match provider.stream_chat(request) {
            Ok(handle) => GatewayStream::from_provider(handle.stream, handle.worker),
            Err(error) => {
                tracing::error!(
                    provider_id = %provider.id(),
                    model_id = %self.model_id,
                    error = %error,
                    "failed to start provider stream"
                );
                GatewayStream::failed(CONNECTION_LOST_TEXT, error.kind())
            }
        }
    }
}

fn to_provider_message(message: &ChatMessage) -> ProviderMessage {
    let role = match message.role {
        Role::User => ProviderRole::User,
        Role::Model => ProviderRole::Assistant,
    };
    ProviderMessage::new(role, message.text.clone())
}

struct ProviderSource {
    events: ProviderEventStream,
    pending: Option<ProviderWorker>,
    running: Option<JoinHandle<()>>,
}

impl ProviderSource {
    async fn recv(&mut self) -> Option<StreamEventPayload> {
        // Spawned on first poll so an exchange dropped unread never reaches the network.
        if let Some(worker) = self.pending.take() {
            self.running = Some(tokio::spawn(worker));
        }

        let event = self.events.recv().await;
        if event.is_none()
            && let Some(handle) = self.running.take()
            && let Err(error) = handle.await
        {
            tracing::error!(error = %error, "provider worker did not finish cleanly");
        }
        event
    }
}

/// Pull-based sequence of gateway events for one exchange.
///
/// Always ends with exactly one [`GatewayEvent::Finished`]. Dropping the stream
/// drops the event receiver, which signals the provider worker to cancel the
/// upstream request.
pub struct GatewayStream {
    source: Option<ProviderSource>,
    queued: VecDeque<GatewayEvent>,
}

impl GatewayStream {
    fn from_provider(events: ProviderEventStream, worker: ProviderWorker) -> Self {
        Self {
            source: Some(ProviderSource {
                events,
                pending: Some(worker),
                running: None,
            }),
            queued: VecDeque::new(),
        }
    }

    fn failed(text: &str, kind: ErrorKind) -> Self {
        Self {
            source: None,
            queued: VecDeque::from([
                GatewayEvent::Fragment(text.to_string()),
                GatewayEvent::Finished(GatewayOutcome::Failed(kind)),
            ]),
        }
    }

    /// True once the terminal event has been handed out.
    pub fn is_finished(&self) -> bool {
        self.source.is_none() && self.queued.is_empty()
    }

    /// Next event, or `None` after [`GatewayEvent::Finished`].
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }

        loop {
            let payload = match self.source.as_mut() {
                Some(source) => source.recv().await,
                None => return None,
            };

            match payload {
                Some(StreamEventPayload::Delta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    return Some(GatewayEvent::Fragment(text));
                }
                Some(StreamEventPayload::Done) => {
                    self.source = None;
                    return Some(GatewayEvent::Finished(GatewayOutcome::Completed));
                }
                Some(StreamEventPayload::Error { kind, message }) => {
                    tracing::warn!(?kind, error = %message, "model stream failed");
                    return Some(self.fail(kind));
                }
                None => {
                    tracing::warn!("model stream closed before a terminal event");
                    return Some(self.fail(ErrorKind::Transport));
                }
            }
        }
    }

    fn fail(&mut self, kind: ErrorKind) -> GatewayEvent {
        self.source = None;
        self.queued
            .push_back(GatewayEvent::Finished(GatewayOutcome::Failed(kind)));
        GatewayEvent::Fragment(CONNECTION_LOST_TEXT.to_string())
    }
}
