// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Manager
//!
//! Collects one [`Consumer`] per registered handler and starts them together.
//! A consumer that fails to start is reported and skipped so the others still
//! come up; [`ConsumerManager::run_report`] exposes the per-consumer outcome
//! for callers that need it.

use crate::{
    consumer::Consumer,
    errors::{AmqpError, MessagingError},
    handler::ConsumerHandler,
    mq::ConsumerAdapter,
    observer::{ConsumerObserver, TracingObserver},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Startup outcome of one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerReport {
    pub topic: String,
    pub result: Result<(), AmqpError>,
}

/// RabbitMQ implementation of [`ConsumerAdapter`].
pub struct ConsumerManager {
    consumers: Vec<Consumer>,
    observer: Arc<dyn ConsumerObserver>,
}

impl Default for ConsumerManager {
    fn default() -> Self {
        ConsumerManager::new()
    }
}

impl ConsumerManager {
    /// Creates an empty manager reporting through [`TracingObserver`].
    pub fn new() -> Self {
        ConsumerManager {
            consumers: vec![],
            observer: Arc::new(TracingObserver),
        }
    }

    /// Observer shared by every consumer registered afterwards.
    pub fn with_observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    /// Runs every consumer and returns how each of them started.
    pub async fn run_report(&self) -> Vec<ConsumerReport> {
        let mut reports = Vec::with_capacity(self.consumers.len());

        for consumer in &self.consumers {
            let result = consumer.run().await;
            if let Err(err) = &result {
                self.observer.startup_failed(consumer.topic(), err);
            }

            reports.push(ConsumerReport {
                topic: consumer.topic().to_owned(),
                result,
            });
        }

        reports
    }

    /// Closes every consumer, returning the first error met.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut first_err = None;
        for consumer in &self.consumers {
            if let Err(err) = consumer.close().await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConsumerAdapter for ConsumerManager {
    fn register_consumer_handler(&mut self, handler: ConsumerHandler) -> Result<(), MessagingError> {
        let consumer = Consumer::builder(handler)
            .observer(self.observer.clone())
            .build();
        self.consumers.push(consumer);
        Ok(())
    }

    /// Starts every consumer. Always succeeds: startup failures only reach
    /// the observer.
    async fn run(&self) -> Result<(), MessagingError> {
        self.run_report().await;
        Ok(())
    }
}
