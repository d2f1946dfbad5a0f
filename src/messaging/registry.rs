//! # Handler Registry
//!
//! Maps a message type discriminator to the code that processes it. Two kinds
//! of binding are kept side by side:
//!
//! - **handlers**: long-lived, stateless objects implementing [`MessageHandler`]
//!   (usually a typed [`Handler<M>`] wrapped by the registry);
//! - **callbacks**: lightweight synchronous functions.
//!
//! Both maps are `DashMap`s, so registration can race with lookups from a
//! running consumer. Re-registering a type overwrites the previous binding.
//! When a type has both kinds of binding, the handler wins.
//!
//! Typed bindings decode `Envelope::data` straight into the message type once,
//! at dispatch; a payload that does not fit the type is a [`HandlerError::Decode`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::envelope::{Envelope, Message, MessageType};

/// Why a handler or callback did not complete
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Failed to decode {message_type} payload: {message}")]
    Decode {
        message_type: String,
        message: String,
    },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn decode(message_type: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Decode {
            message_type: message_type.into(),
            message: message.to_string(),
        }
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Untyped handler bound to one message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn receive(&self, envelope: &Envelope) -> HandlerResult;
}

/// Typed handler for messages of type `M`
///
/// ```rust
/// use async_trait::async_trait;
/// use dispatch_core::messaging::{Envelope, Handler, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct IrrigationRequested { zone: u32 }
///
/// impl Message for IrrigationRequested {
///     const MESSAGE_TYPE: &'static str = "farm.irrigation.IrrigationRequested";
/// }
///
/// struct IrrigationHandler;
///
/// #[async_trait]
/// impl Handler<IrrigationRequested> for IrrigationHandler {
///     async fn handle(&self, message: IrrigationRequested, _envelope: &Envelope) -> anyhow::Result<()> {
///         anyhow::ensure!(message.zone > 0, "zone 0 does not exist");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M, envelope: &Envelope) -> anyhow::Result<()>;
}

struct TypedHandler<M, H> {
    inner: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> MessageHandler for TypedHandler<M, H>
where
    M: Message,
    H: Handler<M>,
{
    async fn receive(&self, envelope: &Envelope) -> HandlerResult {
        let message = envelope
            .decode::<M>()
            .map_err(|e| HandlerError::decode(M::MESSAGE_TYPE, e))?;
        self.inner.handle(message, envelope).await?;
        Ok(())
    }
}

struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, F, Fut> MessageHandler for FnHandler<M, F>
where
    M: Message,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn receive(&self, envelope: &Envelope) -> HandlerResult {
        let message = envelope
            .decode::<M>()
            .map_err(|e| HandlerError::decode(M::MESSAGE_TYPE, e))?;
        (self.f)(message).await?;
        Ok(())
    }
}

/// Lightweight synchronous binding
pub type Callback = Arc<dyn Fn(&Envelope) -> HandlerResult + Send + Sync>;

/// What a lookup found
#[derive(Clone)]
pub enum ResolvedHandler {
    Handler(Arc<dyn MessageHandler>),
    Callback(Callback),
}

impl ResolvedHandler {
    pub fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }
}

impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("ResolvedHandler::Handler"),
            Self::Callback(_) => f.write_str("ResolvedHandler::Callback"),
        }
    }
}

/// Concurrent message type -> handler/callback map
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<MessageType, Arc<dyn MessageHandler>>,
    callbacks: DashMap<MessageType, Callback>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a typed handler to `M::MESSAGE_TYPE`
    pub fn register<M, H>(&self, handler: H)
    where
        M: Message,
        H: Handler<M>,
    {
        self.register_handler(
            M::message_type(),
            Arc::new(TypedHandler {
                inner: handler,
                _message: PhantomData,
            }),
        );
    }

    /// Bind an async function to `M::MESSAGE_TYPE`
    pub fn register_fn<M, F, Fut>(&self, f: F)
    where
        M: Message,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_handler(
            M::message_type(),
            Arc::new(FnHandler {
                f,
                _message: PhantomData,
            }),
        );
    }

    /// Bind an untyped handler
    pub fn register_handler(
        &self,
        message_type: impl Into<MessageType>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let message_type = message_type.into();
        let replaced = self.handlers.insert(message_type.clone(), handler).is_some();
        debug!(message_type = %message_type, replaced, "Registered message handler");
    }

    /// Bind a typed synchronous callback to `M::MESSAGE_TYPE`
    pub fn register_callback<M, F>(&self, callback: F)
    where
        M: Message,
        F: Fn(M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_callback_for(M::message_type(), move |envelope: &Envelope| {
            let message = envelope
                .decode::<M>()
                .map_err(|e| HandlerError::decode(M::MESSAGE_TYPE, e))?;
            callback(message).map_err(HandlerError::from)
        });
    }

    /// Bind a synchronous callback that receives the whole envelope
    pub fn register_callback_for<F>(&self, message_type: impl Into<MessageType>, callback: F)
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        let replaced = self
            .callbacks
            .insert(message_type.clone(), Arc::new(callback))
            .is_some();
        debug!(message_type = %message_type, replaced, "Registered message callback");
    }

    /// Find the binding for a type; handlers take precedence over callbacks
    pub fn resolve(&self, message_type: &MessageType) -> Option<ResolvedHandler> {
        if let Some(handler) = self.handlers.get(message_type) {
            return Some(ResolvedHandler::Handler(handler.value().clone()));
        }
        self.callbacks
            .get(message_type)
            .map(|callback| ResolvedHandler::Callback(callback.value().clone()))
    }

    /// Remove both bindings for a type, returning whether anything was bound
    pub fn unregister(&self, message_type: &MessageType) -> bool {
        let handler = self.handlers.remove(message_type).is_some();
        let callback = self.callbacks.remove(message_type).is_some();
        handler || callback
    }

    pub fn contains(&self, message_type: &MessageType) -> bool {
        self.handlers.contains_key(message_type) || self.callbacks.contains_key(message_type)
    }

    /// Every type with at least one binding, sorted
    pub fn registered_types(&self) -> Vec<MessageType> {
        let mut types: Vec<MessageType> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.callbacks.iter().map(|entry| entry.key().clone()))
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn len(&self) -> usize {
        self.registered_types().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.callbacks.is_empty()
    }
}
