// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod worker;

pub mod backoff;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod manager;
pub mod message;
pub mod mq;
pub mod observer;
pub mod queue;
