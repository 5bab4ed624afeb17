// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options for RabbitMQ
//!
//! The extra configuration carried by a [`ConsumerHandler`](crate::handler::ConsumerHandler)
//! is decoded into [`QueueOptions`], which drives both the queue declaration
//! and the consumption mode. Malformed payloads never fail setup: they fall
//! back to the defaults.

use crate::errors::AmqpError;
use lapin::{options::QueueDeclareOptions, types::FieldTable, Channel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

/// Queue declaration and consumption flags.
///
/// Every flag defaults to `false`; unknown keys are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub auto_ack: bool,
    pub no_local: bool,
}

impl QueueOptions {
    /// Decodes options from an extra configuration payload.
    ///
    /// Returns the defaults when the payload is absent or does not have the
    /// expected shape.
    pub fn from_extra(extra: Option<&Value>) -> QueueOptions {
        match extra {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|err| {
                debug!(error = err.to_string(), "ignoring malformed extra config");
                QueueOptions::default()
            }),
            None => QueueOptions::default(),
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Declares and consumes without waiting for the broker to confirm.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Lets the broker settle deliveries as soon as they are sent.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Skips messages published on the consumer's own connection.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: self.no_wait,
        }
    }
}

/// Declares `name` on `channel` with the given options and no arguments.
pub(crate) async fn declare_queue(
    channel: &Channel,
    name: &str,
    options: &QueueOptions,
) -> Result<(), AmqpError> {
    debug!("declaring queue: {}", name);

    match channel
        .queue_declare(name, options.declare_options(), FieldTable::default())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue = name, "failure to declare queue");
            Err(AmqpError::DeclareQueueError(name.to_owned()))
        }
        _ => {
            debug!("queue: {} was declared", name);
            Ok(())
        }
    }
}
