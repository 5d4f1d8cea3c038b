use std::sync::Arc;

mod provider;
mod rig_adapter;

pub use provider::{
    ErrorKind, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventPayload, StreamRequest,
    event_channel,
};
pub use rig_adapter::{GEMINI_PROVIDER_ID, OPENAI_PROVIDER_ID, ProviderKind, RigProviderAdapter};

pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    Ok(Arc::new(RigProviderAdapter::new(config)?))
}
