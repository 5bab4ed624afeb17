// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connections
//!
//! What a [`Consumer`](crate::consumer::Consumer) needs from the broker
//! client: dial, learn about connection loss, subscribe to a queue and close.
//! [`AmqpConnector`] provides it on top of lapin. Subscribing declares the
//! queue, applies the in-flight limit as QoS and turns the delivery stream
//! into [`AmqpMessage`]s.

use crate::{
    channel::{self, BrokerChannel, AMQP_REPLY_SUCCESS},
    errors::AmqpError,
    message::AmqpMessage,
    observer::ConsumerObserver,
    queue::{self, QueueOptions},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Connection,
};
use std::sync::Arc;
use tracing::error;

/// Invoked with the reason once the connection fails.
pub type CloseCallback = Box<dyn Fn(String) + Send + Sync>;

/// Dials the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection to `url`, shown by the broker as `name`.
    ///
    /// # Returns
    /// * `Result<Arc<dyn BrokerConnection>, AmqpError>` - The connection, or
    ///   `AmqpError::ConnectionError` when the dial fails.
    async fn connect(&self, url: &str, name: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One established broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Registers `callback` to run when the connection fails.
    fn on_close(&self, callback: CloseCallback);

    /// Opens a channel and starts consuming the queue described by `request`.
    async fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription, AmqpError>;

    /// Closes the connection with a normal reply code.
    async fn shutdown(&self) -> Result<(), AmqpError>;
}

/// Everything needed to consume one queue.
pub struct SubscribeRequest {
    pub topic: String,
    pub consumer_tag: String,
    pub max_in_flight: u16,
    pub max_attempts: i32,
    pub options: QueueOptions,
    /// Receives deliveries the client failed to decode.
    pub observer: Arc<dyn ConsumerObserver>,
}

/// An active consumption: the channel it runs on and its messages.
pub struct Subscription {
    pub channel: Arc<dyn BrokerChannel>,
    pub messages: BoxStream<'static, AmqpMessage>,
}

/// [`Connector`] backed by lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str, name: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let conn = channel::open_connection(url, name).await?;
        Ok(Arc::new(conn))
    }
}

#[async_trait]
impl BrokerConnection for Connection {
    fn on_close(&self, callback: CloseCallback) {
        self.on_error(move |err| callback(err.to_string()));
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription, AmqpError> {
        let channel = Arc::new(channel::open_channel(self).await?);

        queue::declare_queue(&channel, &request.topic, &request.options).await?;

        channel
            .basic_qos(request.max_in_flight, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        let deliveries = channel
            .basic_consume(
                &request.topic,
                &request.consumer_tag,
                BasicConsumeOptions {
                    no_local: request.options.no_local,
                    no_ack: request.options.auto_ack,
                    exclusive: request.options.exclusive,
                    nowait: request.options.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        let broker: Arc<dyn BrokerChannel> = channel;
        let SubscribeRequest {
            topic,
            max_attempts,
            options,
            observer,
            ..
        } = request;

        let settle_on = broker.clone();
        let messages = deliveries
            .filter_map(move |delivery| {
                let channel = settle_on.clone();
                let topic = topic.clone();
                let observer = observer.clone();
                async move {
                    match delivery {
                        Ok(delivery) => Some(
                            AmqpMessage::from_delivery(delivery, channel, &topic, max_attempts)
                                .with_auto_ack(options.auto_ack),
                        ),
                        Err(err) => {
                            observer.delivery_failed(&topic, &err.to_string());
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(Subscription {
            channel: broker,
            messages,
        })
    }

    async fn shutdown(&self) -> Result<(), AmqpError> {
        self.close(AMQP_REPLY_SUCCESS, "consumer closed")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connector_reports_invalid_uri() {
        let result = AmqpConnector.connect("not a uri", "orders").await;
        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
    }
}
