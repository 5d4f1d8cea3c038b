use std::fmt;

use chrono::{DateTime, Utc};
use estate_llm::ErrorKind;
use uuid::Uuid;

/// Stable identifier for one transcript entry.
///
/// UUIDv7 keeps ids unique and ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new time-ordered id.
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

/// One transcript entry. Only `text` and `is_streaming` change after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
}

impl ChatMessage {
    fn new(role: Role, text: impl Into<String>, is_streaming: bool) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            is_streaming,
        }
    }

    /// Creates a finalized user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text, false)
    }

    /// Finalized assistant message, e.g. the session greeting.
    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text, false)
    }

    /// Creates an empty assistant placeholder while streaming.
    pub fn model_placeholder() -> Self {
        Self::new(Role::Model, String::new(), true)
    }
}

/// Ordered, append-only message list for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: ChatMessage) -> MessageId {
        let id = message.id;
        self.messages.push(message);
        id
    }

    /// Finds an entry by id.
    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Appends a fragment to the streaming entry with `id`.
    ///
    /// Returns false when the entry is missing or no longer streaming.
    pub fn append_fragment(&mut self, id: MessageId, fragment: &str) -> bool {
        match self.find_streaming_mut(id) {
            Some(message) => {
                message.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Clears the streaming flag of entry `id`.
    ///
    /// Returns false when the entry is missing or already finished.
    pub fn finish_streaming(&mut self, id: MessageId) -> bool {
        match self.find_streaming_mut(id) {
            Some(message) => {
                message.is_streaming = false;
                true
            }
            None => false,
        }
    }

    pub fn streaming_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_streaming)
            .count()
    }

    fn find_streaming_mut(&mut self, id: MessageId) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .find(|message| message.id == id && message.is_streaming)
    }
}

/// Lifecycle of the single outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(MessageId),
    Completed(MessageId),
    Failed {
        message_id: MessageId,
        kind: ErrorKind,
    },
}

/// State transition input for stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransition {
    Start(MessageId),
    Complete(MessageId),
    Fail {
        message_id: MessageId,
        kind: ErrorKind,
    },
    ResetToIdle,
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: MessageId,
        attempted: MessageId,
    },
    NoActiveStream,
    MessageMismatch {
        active: MessageId,
        attempted: MessageId,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Placeholder id while streaming.
    pub fn active_message(&self) -> Option<MessageId> {
        match self {
            Self::Streaming(id) => Some(*id),
            Self::Idle | Self::Completed(_) | Self::Failed { .. } => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.active_message().is_some()
    }

    /// Applies one transition deterministically.
    ///
    /// Any non-streaming state may start a new stream. Terminal transitions must
    /// name the active placeholder exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(id) => self.apply_start(id),
            StreamTransition::Complete(id) => {
                self.apply_terminal(id).map(|_| Self::Completed(id))
            }
            StreamTransition::Fail { message_id, kind } => self
                .apply_terminal(message_id)
                .map(|_| Self::Failed { message_id, kind }),
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, id: MessageId) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) => Err(StreamTransitionRejection::AlreadyStreaming {
                active: *active,
                attempted: id,
            }),
            Self::Idle | Self::Completed(_) | Self::Failed { .. } => Ok(Self::Streaming(id)),
        }
    }

    fn apply_terminal(&self, id: MessageId) -> Result<(), StreamTransitionRejection> {
        match self {
            Self::Streaming(active) if *active == id => Ok(()),
            Self::Streaming(active) => Err(StreamTransitionRejection::MessageMismatch {
                active: *active,
                attempted: id,
            }),
            Self::Idle | Self::Completed(_) | Self::Failed { .. } => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}
