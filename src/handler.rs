// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Contract
//!
//! The types an application implements or fills in to consume a queue: the
//! [`Message`] it receives, the [`MessageHandler`] it provides, and the
//! [`ConsumerHandler`] configuration that binds both to a topic.

use crate::errors::{HandlerError, MessagingError};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};

/// One delivery handed to a [`MessageHandler`].
///
/// A message must be settled exactly once, either by the handler itself or by
/// the worker after the handler returns: `finish` on success, one of the
/// requeue variants otherwise.
#[async_trait]
pub trait Message: Send + Sync {
    /// Positively acknowledges the delivery.
    async fn finish(&mut self) -> Result<(), MessagingError>;

    /// Sends the delivery back to its queue, or rejects it for good once the
    /// attempts limit has been reached.
    ///
    /// `delay` is accepted for delayed-queue backends; the AMQP backend
    /// republishes immediately.
    async fn requeue(&mut self, delay: Duration) -> Result<(), MessagingError>;

    /// Like [`Message::requeue`] but ignores the attempts limit.
    async fn requeue_without_backoff(&mut self, delay: Duration) -> Result<(), MessagingError>;

    /// Number of times this delivery has been handed to a handler.
    fn attempts(&self) -> i32;

    /// Raw payload.
    fn body(&self) -> &[u8];
}

/// User supplied processing logic, invoked once per delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &mut dyn Message) -> Result<(), HandlerError>;
}

/// Per-consumer configuration plus the handler it drives.
///
/// Immutable once handed to a consumer.
#[derive(Clone, Default)]
pub struct ConsumerHandler {
    /// Queue to declare and consume.
    pub topic: String,
    /// Consumer tag. A unique one is generated when empty.
    pub channel: String,
    /// Number of worker tasks, at least 1.
    pub concurrent: usize,
    /// Deliveries beyond this many attempts are rejected, at least 1.
    pub max_attempts: i32,
    /// Prefetch bound applied as QoS, at least 1.
    pub max_in_flight: u16,
    pub enabled: bool,
    /// AMQP URI of the broker.
    pub url: String,
    pub handler: Option<Arc<dyn MessageHandler>>,
    pub(crate) extra_config: Option<Value>,
}

impl ConsumerHandler {
    pub fn new(topic: &str, url: &str, handler: Arc<dyn MessageHandler>) -> Self {
        ConsumerHandler {
            topic: topic.to_owned(),
            url: url.to_owned(),
            handler: Some(handler),
            ..Default::default()
        }
    }

    /// Stores the broker specific options for this consumer.
    pub fn set_extra_config(&mut self, extra: Value) {
        self.extra_config = Some(extra);
    }

    pub fn extra_config(&self) -> Option<&Value> {
        self.extra_config.as_ref()
    }

    /// Decodes the extra configuration into `T`.
    pub fn parse_extra_config<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.extra_config.clone().unwrap_or(Value::Null))
    }
}

impl fmt::Debug for ConsumerHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandler")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("concurrent", &self.concurrent)
            .field("max_attempts", &self.max_attempts)
            .field("max_in_flight", &self.max_in_flight)
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("handler", &self.handler.is_some())
            .field("extra_config", &self.extra_config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Flags {
        durable: bool,
    }

    #[test]
    fn parses_extra_config_into_typed_struct() {
        let mut handler = ConsumerHandler::default();
        handler.set_extra_config(json!({ "durable": true }));

        let flags: Flags = handler.parse_extra_config().unwrap();
        assert_eq!(flags, Flags { durable: true });
    }

    #[test]
    fn missing_extra_config_fails_to_parse_into_struct() {
        let handler = ConsumerHandler::default();
        assert!(handler.parse_extra_config::<Flags>().is_err());
    }

    #[test]
    fn debug_hides_handler_function() {
        let handler = ConsumerHandler {
            topic: "orders".to_owned(),
            ..Default::default()
        };
        let printed = format!("{:?}", handler);
        assert!(printed.contains("orders"));
        assert!(printed.contains("handler: false"));
    }
}
