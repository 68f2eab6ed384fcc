//! Naming conventions
//!
//! Derives every broker-addressable name from a message descriptor and the
//! tenant's default namespace. Names are persisted on the broker, so every
//! function here must stay byte-for-byte stable across releases.
//!
//! Exchange names fall back to the type name when no namespace applies, while
//! routing keys and queue names simply drop the prefix. Existing deployments
//! rely on this asymmetry.

use std::time::Duration;

use crate::message::MessageDescriptor;

/// `OrderPlaced` -> `order_placed`.
///
/// An underscore goes before every upper-case character except the first,
/// so acronyms split per letter (`HTTPCall` -> `h_t_t_p_call`).
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if i > 0 && c.is_uppercase() {
            out.push('_');
        }
        out.push(c);
    }
    out.to_lowercase()
}

/// Every name derived for one message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameSet {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub error_exchange: String,
    pub retry_exchange: String,
    pub retry_queue: String,
}

/// Per-tenant naming conventions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConventions {
    namespace: String,
    process_identity: String,
}

impl NamingConventions {
    /// `process_identity` prefixes queue names so each service gets its own queues
    pub fn new(namespace: impl Into<String>, process_identity: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            process_identity: process_identity.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn process_identity(&self) -> &str {
        &self.process_identity
    }

    /// Override if declared, otherwise the tenant namespace; `None` when blank
    fn effective_namespace<'a>(&'a self, message: &'a MessageDescriptor) -> Option<&'a str> {
        let ns = message.namespace.as_deref().unwrap_or(&self.namespace);
        if ns.trim().is_empty() {
            None
        } else {
            Some(ns)
        }
    }

    fn prefix(&self, message: &MessageDescriptor) -> String {
        match self.effective_namespace(message) {
            Some(ns) => format!("{}.", ns),
            None => String::new(),
        }
    }

    pub fn exchange_name(&self, message: &MessageDescriptor) -> String {
        match self.effective_namespace(message) {
            Some(ns) => ns.to_lowercase(),
            None => snake_case(&message.name),
        }
    }

    pub fn routing_key(&self, message: &MessageDescriptor) -> String {
        format!("{}{}", self.prefix(message), snake_case(&message.name)).to_lowercase()
    }

    pub fn queue_name(&self, message: &MessageDescriptor) -> String {
        format!(
            "{}/{}{}",
            self.process_identity,
            self.prefix(message),
            snake_case(&message.name)
        )
        .to_lowercase()
    }

    pub fn error_exchange_name(&self) -> String {
        format!("{}.error", self.namespace).to_lowercase()
    }

    /// One retry exchange per namespace regardless of delay
    pub fn retry_exchange_name(&self, _delay: Duration) -> String {
        format!("{}.retry", self.namespace).to_lowercase()
    }

    /// The delay is rendered in whole milliseconds; any sub-millisecond part is
    /// truncated, so delays that differ only below 1ms share a retry queue.
    pub fn retry_queue_name(&self, exchange: &str, delay: Duration) -> String {
        format!(
            "{}.retry_for_{}_in_{}_ms",
            self.namespace,
            exchange.replace('.', "_"),
            delay.as_millis()
        )
        .to_lowercase()
    }

    pub fn name_set(&self, message: &MessageDescriptor, retry_delay: Duration) -> NameSet {
        let exchange = self.exchange_name(message);
        NameSet {
            routing_key: self.routing_key(message),
            queue: self.queue_name(message),
            error_exchange: self.error_exchange_name(),
            retry_exchange: self.retry_exchange_name(retry_delay),
            retry_queue: self.retry_queue_name(&exchange, retry_delay),
            exchange,
        }
    }
}
