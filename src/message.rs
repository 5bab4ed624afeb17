// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message
//!
//! [`AmqpMessage`] wraps one delivery for the duration of a handler call. The
//! number of attempts travels in the `attempts` header, so a requeued copy
//! carries the count forward.
//!
//! Requeuing republishes a copy to the same queue and then nacks the original
//! without broker-level requeue. If the republish fails the original is still
//! nacked and the delivery is lost; the failure is kept on the message and
//! reported by the worker.

use crate::{
    channel::BrokerChannel,
    errors::{AmqpError, MessagingError},
    handler::Message,
    otel,
    worker::Redeliverable,
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};

/// Header holding the number of attempts of a delivery.
pub const AMQP_HEADERS_ATTEMPTS: &str = "attempts";

/// A delivery being processed by a worker.
pub struct AmqpMessage {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    data: Vec<u8>,
    properties: BasicProperties,
    topic: String,
    attempts: i32,
    max_attempts: i32,
    auto_ack: bool,
    requeued: bool,
    republish_failure: Option<MessagingError>,
}

impl AmqpMessage {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        delivery_tag: u64,
        data: Vec<u8>,
        properties: BasicProperties,
        topic: &str,
        max_attempts: i32,
    ) -> Self {
        let attempts = read_attempts(&properties);
        AmqpMessage {
            channel,
            delivery_tag,
            data,
            properties,
            topic: topic.to_owned(),
            attempts,
            max_attempts,
            auto_ack: false,
            requeued: false,
            republish_failure: None,
        }
    }

    /// Wraps a delivery received on `channel` from the `topic` queue.
    pub fn from_delivery(
        delivery: Delivery,
        channel: Arc<dyn BrokerChannel>,
        topic: &str,
        max_attempts: i32,
    ) -> Self {
        AmqpMessage::new(
            channel,
            delivery.delivery_tag,
            delivery.data,
            delivery.properties,
            topic,
            max_attempts,
        )
    }

    /// Marks the message as consumed in auto-ack mode, where the broker has
    /// already settled it.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    #[cfg(test)]
    pub(crate) fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    async fn republish(&self) -> Result<(), AmqpError> {
        self.channel
            .publish(&self.topic, &self.data, self.properties.clone())
            .await
    }

    async fn reject(&mut self) -> Result<(), MessagingError> {
        self.requeued = true;
        if self.auto_ack {
            return Ok(());
        }
        self.channel.reject(self.delivery_tag, false).await?;
        Ok(())
    }
}

#[async_trait]
impl Message for AmqpMessage {
    async fn finish(&mut self) -> Result<(), MessagingError> {
        if self.auto_ack {
            return Ok(());
        }
        self.channel.ack(self.delivery_tag).await?;
        Ok(())
    }

    async fn requeue(&mut self, delay: Duration) -> Result<(), MessagingError> {
        if self.exhausted() {
            return self.reject().await;
        }
        self.requeue_without_backoff(delay).await
    }

    async fn requeue_without_backoff(&mut self, _delay: Duration) -> Result<(), MessagingError> {
        if let Err(err) = self.republish().await {
            self.republish_failure = Some(err.into());
        }

        self.requeued = true;
        if self.auto_ack {
            return Ok(());
        }
        self.channel.nack(self.delivery_tag, false).await?;
        Ok(())
    }

    fn attempts(&self) -> i32 {
        self.attempts
    }

    fn body(&self) -> &[u8] {
        &self.data
    }
}

impl Redeliverable for AmqpMessage {
    fn increase_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);

        let mut headers = self.properties.headers().clone().unwrap_or_default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_ATTEMPTS),
            AMQPValue::LongInt(self.attempts),
        );
        self.properties = std::mem::take(&mut self.properties).with_headers(headers);
    }

    fn was_requeued(&self) -> bool {
        self.requeued
    }

    fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    fn take_republish_failure(&mut self) -> Option<MessagingError> {
        self.republish_failure.take()
    }

    fn trace_context(&self) -> Context {
        otel::extract_context(&self.properties)
    }
}

/// Reads the attempts header, 0 when absent or not an integer.
pub(crate) fn read_attempts(props: &BasicProperties) -> i32 {
    props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_ATTEMPTS))
        .map(attempts_from_value)
        .unwrap_or_default()
}

fn attempts_from_value(value: &AMQPValue) -> i32 {
    match value {
        AMQPValue::ShortShortInt(v) => i32::from(*v),
        AMQPValue::ShortShortUInt(v) => i32::from(*v),
        AMQPValue::ShortInt(v) => i32::from(*v),
        AMQPValue::ShortUInt(v) => i32::from(*v),
        AMQPValue::LongInt(v) => *v,
        AMQPValue::LongUInt(v) => i32::try_from(*v).unwrap_or(i32::MAX),
        AMQPValue::LongLongInt(v) => {
            i32::try_from(*v).unwrap_or(if *v < 0 { i32::MIN } else { i32::MAX })
        }
        _ => 0,
    }
}
