//! Settlement planning for inbound deliveries
//!
//! Turns the outcome of a pipeline run into the broker actions needed to
//! settle the delivery. Planning is pure; the transport carries out the plan
//! and then acknowledges or requeues the original delivery.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::naming::NamingConventions;
use crate::pipeline::{Acknowledgement, Headers, PipeContext, RetryInformation};
use crate::Result;

/// Binds a retry queue to the headers-type retry exchange
pub const RETRY_QUEUE_HEADER: &str = "x-retry-queue";
/// Failure description attached to messages on the error exchange
pub const EXCEPTION_HEADER: &str = "x-exception";

/// Original headers plus the next attempt's retry counter and the retry queue address
pub fn retry_headers(
    original: &Headers,
    retry: &RetryInformation,
    retry_queue: &str,
    now: DateTime<Utc>,
) -> Headers {
    let mut headers = original.clone();
    headers.extend(retry.next_attempt_headers(now));
    headers.insert(RETRY_QUEUE_HEADER.to_string(), serde_json::Value::from(retry_queue));
    headers
}

pub fn error_headers(original: &Headers, reason: &str) -> Headers {
    let mut headers = original.clone();
    headers.remove(RETRY_QUEUE_HEADER);
    headers.insert(EXCEPTION_HEADER.to_string(), serde_json::Value::from(reason));
    headers
}

/// Broker actions required before the delivery can be acknowledged
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Ack,
    /// Park the message in a TTL queue that dead-letters back to its exchange
    Retry {
        retry_exchange: String,
        retry_queue: String,
        dead_letter_exchange: String,
        delay: Duration,
        routing_key: String,
        headers: Headers,
    },
    /// Move the message to the error exchange
    Error {
        error_exchange: String,
        routing_key: String,
        headers: Headers,
        reason: String,
    },
}

/// Decide how to settle a delivery.
///
/// `default_delay` applies to a `RetryLater` that carries no delay of its own.
/// A failed pipeline run is treated like a rejection with the error as reason.
pub fn plan_settlement(
    outcome: &Result<Acknowledgement>,
    ctx: &PipeContext,
    conventions: &NamingConventions,
    default_delay: Duration,
    now: DateTime<Utc>,
) -> Settlement {
    let reason = match outcome {
        Ok(Acknowledgement::Ack) => return Settlement::Ack,
        Ok(Acknowledgement::RetryLater { delay }) => {
            let delay = delay.unwrap_or(default_delay);
            let retry_queue = conventions.retry_queue_name(&ctx.exchange, delay);
            return Settlement::Retry {
                retry_exchange: conventions.retry_exchange_name(delay),
                headers: retry_headers(&ctx.headers, &ctx.retry, &retry_queue, now),
                retry_queue,
                dead_letter_exchange: ctx.exchange.clone(),
                delay,
                routing_key: ctx.routing_key.clone(),
            };
        }
        Ok(Acknowledgement::Reject { reason }) => reason.clone(),
        Err(e) => e.to_string(),
    };

    Settlement::Error {
        error_exchange: conventions.error_exchange_name(),
        routing_key: ctx.routing_key.clone(),
        headers: error_headers(&ctx.headers, &reason),
        reason,
    }
}

/// What happens to the original delivery once the settlement has been attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// The settlement could not be carried out; hand the delivery back to the broker
    NackRequeue,
}

impl Disposition {
    pub fn after<E>(settled: &std::result::Result<(), E>) -> Self {
        match settled {
            Ok(()) => Disposition::Ack,
            Err(_) => Disposition::NackRequeue,
        }
    }
}
