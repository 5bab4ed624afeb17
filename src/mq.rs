// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Queue Facade
//!
//! [`MessageQueue`] is the broker-agnostic front door. It accepts any
//! [`ConsumerAdapter`], so the RabbitMQ [`ConsumerManager`](crate::manager::ConsumerManager)
//! can be swapped for another backend without touching call sites.

use crate::{
    errors::MessagingError,
    handler::{ConsumerHandler, MessageHandler},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Contract every broker backend implements.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerAdapter: Send + Sync {
    /// Adds a consumer for `handler`. Nothing is started until `run`.
    fn register_consumer_handler(&mut self, handler: ConsumerHandler) -> Result<(), MessagingError>;

    /// Starts every registered consumer.
    async fn run(&self) -> Result<(), MessagingError>;
}

/// Plain consumer configuration, loadable from JSON or any serde source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default)]
    pub concurrent: usize,
    #[serde(default)]
    pub max_attempts: i32,
    #[serde(default)]
    pub max_in_flight: u16,
    #[serde(default, rename = "enable")]
    pub enabled: bool,
    pub url: String,
    /// Broker specific options, e.g. queue flags for RabbitMQ.
    #[serde(default)]
    pub extra_config: Map<String, Value>,
}

/// Registers handlers on a [`ConsumerAdapter`] and starts it.
pub struct MessageQueue {
    consumer: Box<dyn ConsumerAdapter>,
}

impl MessageQueue {
    /// Wraps the backend that will run the consumers.
    ///
    /// # Parameters
    /// * `consumer` - The broker backend, e.g. a `ConsumerManager`.
    ///
    /// # Example
    /// ```
    /// use mq::{manager::ConsumerManager, mq::MessageQueue};
    ///
    /// let queue = MessageQueue::new(ConsumerManager::new());
    /// ```
    pub fn new<A: ConsumerAdapter + 'static>(consumer: A) -> Self {
        MessageQueue {
            consumer: Box::new(consumer),
        }
    }

    /// Registers `handler` for the consumer described by `config`.
    ///
    /// # Parameters
    /// * `config` - Queue name, broker URL, limits and broker specific options.
    /// * `handler` - Logic invoked for every delivery of the queue.
    ///
    /// # Returns
    /// * `Result<(), MessagingError>` - Whatever the backend reports on registration.
    pub fn register_consumer_handler(
        &mut self,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError> {
        let mut consumer = ConsumerHandler {
            topic: config.topic,
            channel: config.channel,
            concurrent: config.concurrent,
            max_attempts: config.max_attempts,
            max_in_flight: config.max_in_flight,
            enabled: config.enabled,
            url: config.url,
            handler: Some(handler),
            ..Default::default()
        };
        consumer.set_extra_config(Value::Object(config.extra_config));

        self.consumer.register_consumer_handler(consumer)
    }

    /// Starts every registered consumer.
    ///
    /// # Returns
    /// * `Result<(), MessagingError>` - The backend's outcome. The RabbitMQ
    ///   backend always succeeds and reports startup failures to its observer.
    pub async fn run_consumer(&self) -> Result<(), MessagingError> {
        self.consumer.run().await
    }
}
