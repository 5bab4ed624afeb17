// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Pool
//!
//! A fixed number of tokio tasks share one delivery stream. Each task takes
//! one message at a time, bumps its attempts, runs the handler and then
//! finishes or requeues it with exponential backoff.

use crate::{
    backoff::Backoff,
    errors::MessagingError,
    handler::{Message, MessageHandler},
    observer::ConsumerObserver,
    otel,
};
use futures_util::{Stream, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::debug;

/// Worker-side view of a message: the bookkeeping that is not part of the
/// handler contract.
pub(crate) trait Redeliverable: Message {
    /// Bumps the attempts counter and records it in the outgoing headers.
    fn increase_attempts(&mut self);

    /// The message was requeued or rejected already.
    fn was_requeued(&self) -> bool;

    /// The attempts limit has been reached.
    fn exhausted(&self) -> bool;

    fn take_republish_failure(&mut self) -> Option<MessagingError>;

    fn trace_context(&self) -> Context {
        Context::new()
    }
}

pub(crate) struct WorkerPool {
    topic: String,
    handler: Arc<dyn MessageHandler>,
    backoff: Backoff,
    observer: Arc<dyn ConsumerObserver>,
}

impl WorkerPool {
    pub(crate) fn new(
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        backoff: Backoff,
        observer: Arc<dyn ConsumerObserver>,
    ) -> Arc<Self> {
        Arc::new(WorkerPool {
            topic: topic.to_owned(),
            handler,
            backoff,
            observer,
        })
    }

    /// Spawns `concurrency` workers draining `messages`.
    ///
    /// Workers stop when the stream ends or once `shutdown` turns true; a
    /// handler call in progress always runs to completion.
    pub(crate) fn spawn<S, M>(
        self: &Arc<Self>,
        messages: S,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>>
    where
        S: Stream<Item = M> + Send + Unpin + 'static,
        M: Redeliverable + 'static,
    {
        let messages = Arc::new(Mutex::new(messages));

        (0..concurrency.max(1))
            .map(|worker_id| {
                let pool = self.clone();
                let messages = messages.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.work(worker_id, messages, shutdown).await })
            })
            .collect()
    }

    async fn work<S, M>(
        self: Arc<Self>,
        worker_id: usize,
        messages: Arc<Mutex<S>>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: Stream<Item = M> + Send + Unpin,
        M: Redeliverable,
    {
        debug!(topic = self.topic, worker_id, "worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                msg = next_message(&messages) => msg,
            };

            let Some(msg) = next else {
                break;
            };

            self.process(msg).await;
        }

        debug!(topic = self.topic, worker_id, "worker stopped");
    }

    /// Runs the handler for one message and settles it.
    pub(crate) async fn process<M: Redeliverable>(&self, mut msg: M) {
        msg.increase_attempts();

        let ctx = msg.trace_context();
        let mut span = otel::new_span(&ctx, &global::tracer("amqp consumer"), &self.topic);

        let result = self.handler.exec(&ctx, &mut msg).await;
        if let Err(err) = result {
            let attempts = msg.attempts();
            span.record_error(err.as_ref());
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            self.observer.handler_failed(&self.topic, attempts, &err);

            if !msg.was_requeued() {
                let exhausted = msg.exhausted();
                let delay = self.backoff.delay(attempts);

                match msg.requeue(delay).await {
                    Err(err) => self.observer.settle_failed(&self.topic, &err),
                    Ok(()) if exhausted => self.observer.message_rejected(&self.topic, attempts),
                    Ok(()) => self.observer.message_requeued(&self.topic, attempts, delay),
                }
            }

            self.report_republish(&mut msg);
            return;
        }

        if msg.was_requeued() {
            self.report_republish(&mut msg);
            span.set_status(Status::Ok);
            return;
        }

        match msg.finish().await {
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                self.observer.settle_failed(&self.topic, &err);
            }
            Ok(()) => span.set_status(Status::Ok),
        }
    }

    fn report_republish<M: Redeliverable>(&self, msg: &mut M) {
        if let Some(err) = msg.take_republish_failure() {
            self.observer.republish_failed(&self.topic, &err);
        }
    }
}

async fn next_message<S>(messages: &Mutex<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    messages.lock().await.next().await
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{BrokerChannel, MockBrokerChannel},
        errors::{AmqpError, HandlerError},
        message::{read_attempts, AmqpMessage},
    };
    use async_trait::async_trait;
    use lapin::BasicProperties;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
        time::Duration,
    };

    #[derive(Default)]
    struct Recorder {
        handler_failures: AtomicUsize,
        requeued: StdMutex<Vec<(i32, Duration)>>,
        rejected: StdMutex<Vec<i32>>,
        republish_failures: AtomicUsize,
    }

    impl ConsumerObserver for Recorder {
        fn handler_failed(&self, _topic: &str, _attempts: i32, _err: &HandlerError) {
            self.handler_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn message_requeued(&self, _topic: &str, attempts: i32, delay: Duration) {
            self.requeued.lock().unwrap().push((attempts, delay));
        }

        fn message_rejected(&self, _topic: &str, attempts: i32) {
            self.rejected.lock().unwrap().push(attempts);
        }

        fn republish_failed(&self, _topic: &str, _err: &MessagingError) {
            self.republish_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// In-memory message recording how it was settled.
    struct FakeMessage {
        attempts: i32,
        max_attempts: i32,
        requeued: bool,
        settled: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl FakeMessage {
        fn new(settled: &Arc<StdMutex<Vec<&'static str>>>) -> Self {
            FakeMessage {
                attempts: 0,
                max_attempts: 3,
                requeued: false,
                settled: settled.clone(),
            }
        }
    }

    #[async_trait]
    impl Message for FakeMessage {
        async fn finish(&mut self) -> Result<(), MessagingError> {
            self.settled.lock().unwrap().push("finish");
            Ok(())
        }

        async fn requeue(&mut self, _delay: Duration) -> Result<(), MessagingError> {
            let outcome = if self.exhausted() { "reject" } else { "requeue" };
            self.settled.lock().unwrap().push(outcome);
            self.requeued = true;
            Ok(())
        }

        async fn requeue_without_backoff(&mut self, _delay: Duration) -> Result<(), MessagingError> {
            self.settled.lock().unwrap().push("requeue");
            self.requeued = true;
            Ok(())
        }

        fn attempts(&self) -> i32 {
            self.attempts
        }

        fn body(&self) -> &[u8] {
            b""
        }
    }

    impl Redeliverable for FakeMessage {
        fn increase_attempts(&mut self) {
            self.attempts += 1;
        }

        fn was_requeued(&self) -> bool {
            self.requeued
        }

        fn exhausted(&self) -> bool {
            self.attempts >= self.max_attempts
        }

        fn take_republish_failure(&mut self) -> Option<MessagingError> {
            None
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Counting {
        async fn exec(&self, _ctx: &Context, _msg: &mut dyn Message) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    struct AlwaysFails(Arc<StdMutex<Vec<i32>>>);

    #[async_trait]
    impl MessageHandler for AlwaysFails {
        async fn exec(&self, _ctx: &Context, msg: &mut dyn Message) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(msg.attempts());
            Err("downstream unavailable".into())
        }
    }

    struct RequeuesItself;

    #[async_trait]
    impl MessageHandler for RequeuesItself {
        async fn exec(&self, _ctx: &Context, msg: &mut dyn Message) -> Result<(), HandlerError> {
            msg.requeue_without_backoff(Duration::ZERO).await?;
            Err("retry later".into())
        }
    }

    fn pool(handler: Arc<dyn MessageHandler>, observer: Arc<Recorder>) -> Arc<WorkerPool> {
        WorkerPool::new("orders", handler, Backoff::default(), observer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_delivery_is_handled_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let settled = Arc::new(StdMutex::new(vec![]));
        let observer = Arc::new(Recorder::default());
        let pool = pool(Arc::new(Counting(calls.clone())), observer.clone());

        let messages: Vec<FakeMessage> = (0..200).map(|_| FakeMessage::new(&settled)).collect();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = pool.spawn(futures_util::stream::iter(messages), 4, shutdown_rx);
        assert_eq!(workers.len(), 4);
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 200);
        let settled = settled.lock().unwrap();
        assert_eq!(settled.len(), 200);
        assert!(settled.iter().all(|s| *s == "finish"));
        assert_eq!(observer.handler_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_concurrency_still_spawns_one_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let settled = Arc::new(StdMutex::new(vec![]));
        let pool = pool(Arc::new(Counting(calls.clone())), Arc::new(Recorder::default()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = pool.spawn(
            futures_util::stream::iter(vec![FakeMessage::new(&settled)]),
            0,
            shutdown_rx,
        );
        assert_eq!(workers.len(), 1);
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_is_requeued_then_rejected() {
        let published = Arc::new(StdMutex::new(Vec::<BasicProperties>::new()));
        let sink = published.clone();

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .times(2)
            .returning(move |_, _, props| {
                sink.lock().unwrap().push(props);
                Ok(())
            });
        channel.expect_nack().times(2).returning(|_, _| Ok(()));
        channel.expect_reject().times(1).returning(|_, _| Ok(()));
        channel.expect_ack().never();
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);

        let seen = Arc::new(StdMutex::new(vec![]));
        let observer = Arc::new(Recorder::default());
        let pool = pool(Arc::new(AlwaysFails(seen.clone())), observer.clone());

        let mut props = BasicProperties::default();
        for tag in 1..=3 {
            let msg = AmqpMessage::new(channel.clone(), tag, b"{}".to_vec(), props.clone(), "orders", 3);
            pool.process(msg).await;
            if let Some(last) = published.lock().unwrap().last() {
                props = last.clone();
            }
        }

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(read_attempts(&props), 2);
        assert_eq!(observer.handler_failures.load(Ordering::SeqCst), 3);
        assert_eq!(*observer.rejected.lock().unwrap(), vec![3]);

        let requeued = observer.requeued.lock().unwrap();
        assert_eq!(requeued.len(), 2);
        assert_eq!(requeued[0].0, 1);
        assert_eq!(requeued[1].0, 2);
        assert!(requeued[0].1 >= Duration::from_secs(1));
        assert!(requeued[0].1 <= Duration::from_millis(1500));
        assert!(requeued[1].1 >= Duration::from_secs(2));
        assert!(requeued[1].1 <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn message_requeued_by_handler_is_left_alone() {
        let settled = Arc::new(StdMutex::new(vec![]));
        let observer = Arc::new(Recorder::default());
        let pool = pool(Arc::new(RequeuesItself), observer.clone());

        pool.process(FakeMessage::new(&settled)).await;

        assert_eq!(*settled.lock().unwrap(), vec!["requeue"]);
        assert!(observer.requeued.lock().unwrap().is_empty());
        assert_eq!(observer.handler_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lost_republish_is_reported() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .returning(|_, _, _| Err(AmqpError::PublishingError));
        channel.expect_nack().times(1).returning(|_, _| Ok(()));

        let observer = Arc::new(Recorder::default());
        let pool = pool(Arc::new(AlwaysFails(Arc::default())), observer.clone());

        let msg = AmqpMessage::new(
            Arc::new(channel),
            1,
            b"{}".to_vec(),
            BasicProperties::default(),
            "orders",
            5,
        );
        pool.process(msg).await;

        assert_eq!(observer.republish_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let pool = pool(
            Arc::new(Counting(Arc::default())),
            Arc::new(Recorder::default()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = pool.spawn(
            futures_util::stream::pending::<FakeMessage>(),
            3,
            shutdown_rx,
        );
        shutdown_tx.send_replace(true);

        for worker in workers {
            tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
