//! JSON processor: the kind table.
//!
//! Registration and attachment take `&mut self`; decoding, routing and
//! encoding take `&self`. Build the table once at startup, then share it
//! behind an `Arc`.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::value::RawValue;

use super::{AsyncRouter, Inbound, Message, RawMessage, RoutedCall, TypedMessage};
use crate::error::{GateError, Result};

type Decode = fn(&RawValue) -> serde_json::Result<TypedMessage>;
type Handler<C> = Box<dyn Fn(&TypedMessage, &C) + Send + Sync>;
type RawHandler<C> = Box<dyn Fn(&RawMessage, &C) + Send + Sync>;

/// One registered kind.
struct MsgInfo<C> {
    type_id: TypeId,
    decode: Decode,
    handler: Option<Handler<C>>,
    router: Option<Arc<dyn AsyncRouter<C>>>,
    raw_handler: Option<RawHandler<C>>,
}

fn decode_typed<M: Message>(raw: &RawValue) -> serde_json::Result<TypedMessage> {
    let msg: M = serde_json::from_str(raw.get())?;
    Ok(TypedMessage::new(msg))
}

/// Registry mapping message kinds to types, handlers and routers.
///
/// `C` is the per-connection context handed to handlers and routers
/// (for example [`Session`](crate::gate::Session)).
pub struct JsonProcessor<C> {
    msg_info: HashMap<&'static str, MsgInfo<C>>,
}

impl<C> JsonProcessor<C> {
    /// Create an empty processor.
    pub fn new() -> Self {
        Self {
            msg_info: HashMap::new(),
        }
    }

    /// Register `M` under [`M::KIND`](Message::KIND) and return the kind.
    ///
    /// # Errors
    ///
    /// `InvalidRegistration` for an empty kind, `AlreadyRegistered` if the
    /// kind is taken.
    pub fn register<M: Message>(&mut self) -> Result<&'static str> {
        let kind = M::KIND;
        if kind.is_empty() {
            return Err(GateError::InvalidRegistration(format!(
                "unnamed json message {}",
                std::any::type_name::<M>()
            )));
        }
        if self.msg_info.contains_key(kind) {
            return Err(GateError::AlreadyRegistered(kind.to_string()));
        }

        self.msg_info.insert(
            kind,
            MsgInfo {
                type_id: TypeId::of::<M>(),
                decode: decode_typed::<M>,
                handler: None,
                router: None,
                raw_handler: None,
            },
        );
        Ok(kind)
    }

    /// Attach a local handler to `M`. It runs inline on the routing task.
    pub fn set_handler<M, F>(&mut self, handler: F) -> Result<()>
    where
        M: Message,
        F: Fn(&M, &C) + Send + Sync + 'static,
    {
        let info = self.info_for::<M>()?;
        if info.handler.is_some() {
            return Err(already_set(M::KIND, "handler"));
        }

        info.handler = Some(Box::new(move |msg: &TypedMessage, ctx: &C| {
            if let Some(msg) = msg.downcast_ref::<M>() {
                handler(msg, ctx);
            }
        }));
        Ok(())
    }

    /// Bind an external router to `M`.
    pub fn set_router<M: Message>(&mut self, router: Arc<dyn AsyncRouter<C>>) -> Result<()> {
        let info = self.info_for::<M>()?;
        if info.router.is_some() {
            return Err(already_set(M::KIND, "router"));
        }
        info.router = Some(router);
        Ok(())
    }

    /// Attach a raw handler to `kind`.
    ///
    /// From then on [`unmarshal`](Self::unmarshal) returns that kind as an
    /// undecoded [`RawMessage`], and typed handler and router are bypassed.
    pub fn set_raw_handler<F>(&mut self, kind: &str, handler: F) -> Result<()>
    where
        F: Fn(&RawMessage, &C) + Send + Sync + 'static,
    {
        let info = self
            .msg_info
            .get_mut(kind)
            .ok_or_else(|| GateError::NotRegistered(kind.to_string()))?;
        if info.raw_handler.is_some() {
            return Err(already_set(kind, "raw handler"));
        }
        info.raw_handler = Some(Box::new(handler));
        Ok(())
    }

    /// Whether `kind` has been registered.
    pub fn is_registered(&self, kind: &str) -> bool {
        self.msg_info.contains_key(kind)
    }

    /// Registered kinds, in no particular order.
    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.msg_info.keys().copied()
    }

    /// Decode one frame payload.
    ///
    /// # Errors
    ///
    /// `Json` if the payload is not a JSON object or the value does not
    /// decode, `InvalidData` unless the object has exactly one key,
    /// `NotRegistered` for an unknown kind.
    pub fn unmarshal(&self, data: &[u8]) -> Result<Inbound> {
        let envelope: HashMap<String, Box<RawValue>> = serde_json::from_slice(data)?;
        if envelope.len() != 1 {
            return Err(GateError::InvalidData(format!(
                "expected exactly one message kind, got {}",
                envelope.len()
            )));
        }

        let Some((kind, payload)) = envelope.into_iter().next() else {
            return Err(GateError::InvalidData("empty envelope".to_string()));
        };
        let info = self
            .msg_info
            .get(kind.as_str())
            .ok_or_else(|| GateError::NotRegistered(kind.clone()))?;

        if info.raw_handler.is_some() {
            let payload = Bytes::copy_from_slice(payload.get().as_bytes());
            return Ok(Inbound::Raw(RawMessage::new(kind, payload)));
        }

        let msg = (info.decode)(&payload)?;
        Ok(Inbound::Typed(msg))
    }

    /// Encode `msg` as `{"<KIND>": msg}`.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if `M` was never registered.
    pub fn marshal<M: Message>(&self, msg: &M) -> Result<Bytes> {
        match self.msg_info.get(M::KIND) {
            Some(info) if info.type_id == TypeId::of::<M>() => {}
            _ => return Err(GateError::NotRegistered(M::KIND.to_string())),
        }

        let envelope = HashMap::from([(M::KIND, msg)]);
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn info_for<M: Message>(&mut self) -> Result<&mut MsgInfo<C>> {
        match self.msg_info.get_mut(M::KIND) {
            Some(info) if info.type_id == TypeId::of::<M>() => Ok(info),
            _ => Err(GateError::NotRegistered(M::KIND.to_string())),
        }
    }
}

impl<C: Clone> JsonProcessor<C> {
    /// Dispatch a decoded message.
    ///
    /// Raw messages go to the raw handler only. Typed messages go to the
    /// handler, then to the router; either may be absent.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if the message kind was never registered.
    pub fn route(&self, msg: Inbound, ctx: &C) -> Result<()> {
        match msg {
            Inbound::Raw(raw) => {
                let info = self
                    .msg_info
                    .get(raw.kind())
                    .ok_or_else(|| GateError::NotRegistered(raw.kind().to_string()))?;
                if let Some(handler) = &info.raw_handler {
                    handler(&raw, ctx);
                }
            }
            Inbound::Typed(msg) => {
                let info = match self.msg_info.get(msg.kind()) {
                    Some(info) if msg.type_id() == info.type_id => info,
                    _ => return Err(GateError::NotRegistered(msg.kind().to_string())),
                };
                if let Some(handler) = &info.handler {
                    handler(&msg, ctx);
                }
                if let Some(router) = &info.router {
                    router.go(RoutedCall {
                        kind: msg.kind(),
                        message: msg,
                        ctx: ctx.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl<C> Default for JsonProcessor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for JsonProcessor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonProcessor")
            .field("kinds", &self.msg_info.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn already_set(kind: &str, slot: &'static str) -> GateError {
    GateError::AlreadySet {
        kind: kind.to_string(),
        slot,
    }
}
