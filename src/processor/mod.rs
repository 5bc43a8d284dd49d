//! Message registry and router.
//!
//! A frame payload is a JSON object with exactly one key, the message kind:
//!
//! ```text
//! {"Hello": {"name": "leaf"}}
//!  └─kind─┘ └──── payload ───┘
//! ```
//!
//! Provides:
//! - [`Message`] - a serde type with a registered kind tag
//! - [`JsonProcessor`] - kind table: decode, dispatch and encode
//! - [`AsyncRouter`] / [`ChanRouter`] - forward typed messages to another task
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use wiregate::impl_message;
//! use wiregate::processor::{Inbound, JsonProcessor};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Hello {
//!     name: String,
//! }
//! impl_message!(Hello);
//!
//! let mut processor = JsonProcessor::<()>::new();
//! processor.register::<Hello>().unwrap();
//! processor
//!     .set_handler(|msg: &Hello, _ctx: &()| println!("hello {}", msg.name))
//!     .unwrap();
//!
//! let frame = processor.marshal(&Hello { name: "leaf".into() }).unwrap();
//! assert_eq!(&frame[..], br#"{"Hello":{"name":"leaf"}}"#);
//!
//! let inbound = processor.unmarshal(&frame).unwrap();
//! processor.route(inbound, &()).unwrap();
//! ```

mod json;
mod router;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use json::JsonProcessor;
pub use router::{AsyncRouter, ChanRouter, RoutedCall};

/// An application message that can travel in a JSON envelope.
///
/// Usually implemented with [`impl_message!`](crate::impl_message), which
/// uses the type's name as its kind.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Kind tag used as the envelope key.
    const KIND: &'static str;
}

/// Implement [`Message`] for one or more named types, using each type's
/// name as its kind.
///
/// ```
/// # use serde::{Deserialize, Serialize};
/// # use wiregate::processor::Message;
/// #[derive(Serialize, Deserialize)]
/// struct Login {
///     token: String,
/// }
///
/// wiregate::impl_message!(Login);
/// assert_eq!(Login::KIND, "Login");
/// ```
#[macro_export]
macro_rules! impl_message {
    ($($name:ident),+ $(,)?) => {
        $(
            impl $crate::processor::Message for $name {
                const KIND: &'static str = stringify!($name);
            }
        )+
    };
}

/// A decoded message of some registered type.
#[derive(Clone)]
pub struct TypedMessage {
    kind: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl TypedMessage {
    /// Wrap a message.
    pub fn new<M: Message>(msg: M) -> Self {
        Self {
            kind: M::KIND,
            value: Arc::new(msg),
        }
    }

    /// Kind tag of the wrapped message.
    #[inline]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Borrow the message as `M`, if that is its type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.value.downcast_ref::<M>()
    }

    /// Take shared ownership of the message as `M`.
    pub fn downcast<M: Message>(self) -> Result<Arc<M>, Self> {
        let kind = self.kind;
        self.value
            .downcast::<M>()
            .map_err(|value| Self { kind, value })
    }

    /// Concrete type of the wrapped message.
    pub(crate) fn type_id(&self) -> TypeId {
        (*self.value).type_id()
    }
}

impl fmt::Debug for TypedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedMessage")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// An undecoded envelope: the kind and the untouched JSON value bytes.
///
/// Produced for kinds that have a raw handler attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    kind: String,
    payload: Bytes,
}

impl RawMessage {
    pub fn new(kind: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// JSON text of the envelope's value, exactly as received.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Result of [`JsonProcessor::unmarshal`].
#[derive(Debug, Clone)]
pub enum Inbound {
    Typed(TypedMessage),
    Raw(RawMessage),
}

impl Inbound {
    pub fn kind(&self) -> &str {
        match self {
            Inbound::Typed(msg) => msg.kind(),
            Inbound::Raw(raw) => raw.kind(),
        }
    }
}

impl From<TypedMessage> for Inbound {
    fn from(msg: TypedMessage) -> Self {
        Inbound::Typed(msg)
    }
}

impl From<RawMessage> for Inbound {
    fn from(raw: RawMessage) -> Self {
        Inbound::Raw(raw)
    }
}
