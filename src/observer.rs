// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Observer
//!
//! Consumers report what happens to them through a [`ConsumerObserver`] handed
//! over at construction. [`TracingObserver`] is the default and turns every
//! notification into a `tracing` event.

use crate::errors::{AmqpError, HandlerError, MessagingError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receives lifecycle and delivery notifications from consumers.
///
/// Every method has a no-op default so implementations only override what
/// they care about.
pub trait ConsumerObserver: Send + Sync {
    fn connected(&self, _topic: &str) {}

    fn connection_lost(&self, _topic: &str, _reason: &str) {}

    fn reconnect_failed(&self, _topic: &str, _err: &AmqpError, _retry_in: Duration) {}

    fn reconnected(&self, _topic: &str) {}

    fn setup_failed(&self, _topic: &str, _err: &AmqpError) {}

    /// A consumer managed by a `ConsumerManager` failed to start.
    fn startup_failed(&self, _topic: &str, _err: &AmqpError) {}

    fn handler_failed(&self, _topic: &str, _attempts: i32, _err: &HandlerError) {}

    fn message_requeued(&self, _topic: &str, _attempts: i32, _delay: Duration) {}

    /// The delivery ran out of attempts and was rejected for good.
    fn message_rejected(&self, _topic: &str, _attempts: i32) {}

    /// The copy of a requeued delivery could not be published, so the
    /// delivery is lost.
    fn republish_failed(&self, _topic: &str, _err: &MessagingError) {}

    fn settle_failed(&self, _topic: &str, _err: &MessagingError) {}

    fn delivery_failed(&self, _topic: &str, _reason: &str) {}

    fn shutdown(&self, _topic: &str) {}
}

/// Logs every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ConsumerObserver for TracingObserver {
    fn connected(&self, topic: &str) {
        debug!(topic, "amqp connected");
    }

    fn connection_lost(&self, topic: &str, reason: &str) {
        warn!(topic, reason, "amqp connection lost, reconnecting");
    }

    fn reconnect_failed(&self, topic: &str, err: &AmqpError, retry_in: Duration) {
        warn!(
            topic,
            error = err.to_string(),
            retry_in_ms = retry_in.as_millis() as u64,
            "reconnect attempt failed"
        );
    }

    fn reconnected(&self, topic: &str) {
        info!(topic, "consumer reconnected");
    }

    fn setup_failed(&self, topic: &str, err: &AmqpError) {
        error!(topic, error = err.to_string(), "failure to setup consumer");
    }

    fn startup_failed(&self, topic: &str, err: &AmqpError) {
        error!(topic, error = err.to_string(), "{} failed to start", topic);
    }

    fn handler_failed(&self, topic: &str, attempts: i32, err: &HandlerError) {
        error!(topic, attempts, error = err.to_string(), "error whiling handling msg");
    }

    fn message_requeued(&self, topic: &str, attempts: i32, delay: Duration) {
        warn!(
            topic,
            attempts,
            delay_ms = delay.as_millis() as u64,
            "requeuing msg for latter"
        );
    }

    fn message_rejected(&self, topic: &str, attempts: i32) {
        error!(topic, attempts, "too many attempts, msg rejected");
    }

    fn republish_failed(&self, topic: &str, err: &MessagingError) {
        error!(topic, error = err.to_string(), "failure to republish msg, msg lost");
    }

    fn settle_failed(&self, topic: &str, err: &MessagingError) {
        error!(topic, error = err.to_string(), "failure to settle msg");
    }

    fn delivery_failed(&self, topic: &str, reason: &str) {
        error!(topic, reason, "errors consume msg");
    }

    fn shutdown(&self, topic: &str) {
        debug!(topic, "consumer closed");
    }
}
