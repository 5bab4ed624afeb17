// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Queue Consumer
//!
//! `AmqpError` covers everything that can fail while talking to RabbitMQ:
//! dialing, opening channels, declaring the queue, QoS, consuming and settling
//! deliveries. `MessagingError` is the broker-agnostic error that crosses the
//! adapter contract, so call sites never depend on the AMQP backend.

use thiserror::Error;

/// Error returned by user handlers. Any error type can be boxed into it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failed to connect to RabbitMQ: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failed to open channel: {0}")]
    ChannelError(String),

    /// Error declaring a queue with the given name
    #[error("failed to declare queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failed to set qos `{0}`")]
    QoSDeclarationError(String),

    /// Error starting to consume from a queue
    #[error("failed to start consuming `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// The consumer was already configured for the current connection
    #[error("consumer handler already configured")]
    AlreadyConfigured,

    /// An operation needed a connection that is not established
    #[error("not connected")]
    NotConnected,

    /// `run` was called on a handler without a handler function
    #[error("no consumer handler specified")]
    MissingHandler,

    /// The consumer has been closed
    #[error("consumer is shutting down")]
    ShuttingDown,
}

/// Broker-agnostic errors surfaced through the adapter contract and by
/// message operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("failure to create consumer")]
    CreatingConsumerError,

    #[error(transparent)]
    Broker(#[from] AmqpError),
}
