//! Message types and descriptors
//!
//! A message type is identified on the broker by its type name and an optional
//! namespace override declared on the type itself.

use serde::Serialize;
use tb_common::CorrelationContext;

use crate::Result;

/// A payload that can travel over the bus.
pub trait Message: Serialize + Send + Sync {
    /// Type name, e.g. `OrderPlaced`
    const NAME: &'static str;

    /// Namespace override; when set it replaces the tenant's default namespace
    const NAMESPACE: Option<&'static str> = None;
}

/// Point-to-point message with exactly one intended handler
pub trait Command: Message {}

/// Message published for zero or more subscribers
pub trait Event: Message {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
        }
    }
}

/// Type identity used by the naming conventions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageDescriptor {
    pub name: String,
    pub namespace: Option<String>,
}

impl MessageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn of<M: Message>() -> Self {
        Self {
            name: M::NAME.to_string(),
            namespace: M::NAMESPACE.map(str::to_string),
        }
    }
}

/// A serialized message ready to hand to a tenant's client
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub descriptor: MessageDescriptor,
    pub body: serde_json::Value,
    pub context: CorrelationContext,
}

impl OutboundMessage {
    pub fn new(
        kind: MessageKind,
        descriptor: MessageDescriptor,
        body: serde_json::Value,
        context: CorrelationContext,
    ) -> Self {
        Self {
            kind,
            descriptor,
            body,
            context,
        }
    }

    pub fn command<C: Command>(command: &C, context: &CorrelationContext) -> Result<Self> {
        Ok(Self::new(
            MessageKind::Command,
            MessageDescriptor::of::<C>(),
            serde_json::to_value(command)?,
            context.clone(),
        ))
    }

    pub fn event<E: Event>(event: &E, context: &CorrelationContext) -> Result<Self> {
        Ok(Self::new(
            MessageKind::Event,
            MessageDescriptor::of::<E>(),
            serde_json::to_value(event)?,
            context.clone(),
        ))
    }
}
