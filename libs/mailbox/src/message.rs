//! Runtime Messages
//!
//! Every message flowing through a mailbox carries a [`MessageHeader`]: its
//! kind (Command, Event, Document, Request, Response), a unique id and an
//! immutable creation timestamp. Concrete message types are plain structs
//! implementing [`Message`]; the mailbox moves them around type-erased inside
//! an [`Envelope`] and handlers recover the concrete type by `TypeId`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Message kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Event,
    Document,
    Request,
    Response,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Document => "document",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        };
        f.write_str(name)
    }
}

/// Identity and provenance shared by all messages. No setters: a header is
/// fixed once the message is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    id: Uuid,
    kind: MessageKind,
    created_at: DateTime<Utc>,
    correlation_id: Option<Uuid>,
}

impl MessageHeader {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            created_at: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn command() -> Self {
        Self::new(MessageKind::Command)
    }

    pub fn event() -> Self {
        Self::new(MessageKind::Event)
    }

    pub fn document() -> Self {
        Self::new(MessageKind::Document)
    }

    pub fn request() -> Self {
        Self::new(MessageKind::Request)
    }

    /// Response header correlated to the request it answers
    pub fn response_to(request_id: Uuid) -> Self {
        Self {
            correlation_id: Some(request_id),
            ..Self::new(MessageKind::Response)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }
}

/// A message that can be sent to a mailbox
pub trait Message: Any + Send + Sync + fmt::Debug {
    fn header(&self) -> &MessageHeader;

    fn id(&self) -> Uuid {
        self.header().id()
    }

    fn kind(&self) -> MessageKind {
        self.header().kind()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.header().created_at()
    }
}

/// Implements [`Message`] for a struct holding its header in a `header` field.
///
/// ```rust
/// use mailbox::{impl_message, MessageHeader};
///
/// #[derive(Debug)]
/// struct Heartbeat {
///     header: MessageHeader,
/// }
/// impl_message!(Heartbeat);
/// ```
#[macro_export]
macro_rules! impl_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Message for $ty {
                fn header(&self) -> &$crate::MessageHeader {
                    &self.header
                }
            }
        )+
    };
}

/// Type-erased message as it sits in a mailbox queue.
///
/// Cloning is cheap: both views share one allocation.
#[derive(Clone)]
pub struct Envelope {
    message: Arc<dyn Message>,
    payload: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Envelope {
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_arc(Arc::new(message))
    }

    pub fn from_arc<M: Message>(message: Arc<M>) -> Self {
        let payload: Arc<dyn Any + Send + Sync> = message.clone();
        Self {
            message,
            payload,
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
        }
    }

    /// Borrow the concrete message if it is an `M`
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.payload.downcast_ref::<M>()
    }

    /// Shared handle to the concrete message if it is an `M`
    pub fn downcast<M: Message>(&self) -> Option<Arc<M>> {
        self.payload.clone().downcast::<M>().ok()
    }

    pub fn is<M: Message>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    pub fn message(&self) -> &dyn Message {
        self.message.as_ref()
    }

    pub fn header(&self) -> &MessageHeader {
        self.message.header()
    }

    pub fn id(&self) -> Uuid {
        self.header().id()
    }

    pub fn kind(&self) -> MessageKind {
        self.header().kind()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.header().created_at()
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("type", &self.type_name)
            .field("message", &self.message)
            .finish()
    }
}

impl<M: Message> From<M> for Envelope {
    fn from(message: M) -> Self {
        Envelope::new(message)
    }
}
