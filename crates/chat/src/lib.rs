#![deny(unsafe_code)]

//! Streaming chat session for the real-estate market assistant.

/// Bridge from transcript turns to the hosted model.
pub mod gateway;
/// Transcript entries and the stream lifecycle.
pub mod message;
/// Transcript owner and single-request controller.
pub mod session;

pub use gateway::{
    CONNECTION_LOST_TEXT, DEFAULT_MODEL_ID, DEFAULT_TEMPERATURE, GatewayEvent, GatewayOutcome,
    GatewayStream, MISSING_CREDENTIAL_TEXT, ModelGateway, SYSTEM_INSTRUCTION,
};
pub use message::{ChatMessage, MessageId, Role, StreamState, Transcript};
pub use session::{ChatSession, SessionUpdate, SubmitRejection, WELCOME_TEXT};
