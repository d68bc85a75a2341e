//! Inbound routing and outbound queueing for one CM connection.
//!
//! The [`Dispatcher`] owns the framed transport. Inbound frames are routed
//! one at a time, in arrival order, to the [`Handler`] registered for their
//! kind. Outbound traffic goes through an [`Outbound`] handle which never
//! blocks: direct sends are written as soon as the loop gets to them, while
//! deferred [`Job`]s are only written when no inbound frame is waiting.

use crate::error::{Result, SessionError};
use async_trait::async_trait;
use cm_proto::{CmFrameCodec, Message, MessageKind};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type JobId = u64;

/// Receives every inbound message of the kinds it is registered for.
///
/// Handlers run on the dispatch loop. They may send through `outbound` but
/// must never wait for a reply, or the loop would stall behind them.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message, outbound: &Outbound) -> Result<()>;
}

/// Immutable message-kind to handler routing table.
pub struct HandlerTable {
    routes: HashMap<MessageKind, Arc<dyn Handler>>,
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    routes: HashMap<MessageKind, Arc<dyn Handler>>,
}

impl HandlerTableBuilder {
    pub fn route(mut self, kind: MessageKind, handler: Arc<dyn Handler>) -> Self {
        if self.routes.insert(kind, handler).is_some() {
            warn!("Handler for {} registered twice, keeping the last one", kind);
        }
        self
    }

    pub fn route_all(mut self, kinds: &[MessageKind], handler: Arc<dyn Handler>) -> Self {
        for kind in kinds {
            self = self.route(*kind, handler.clone());
        }
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            routes: self.routes,
        }
    }
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, kind: MessageKind) -> Option<&Arc<dyn Handler>> {
        self.routes.get(&kind)
    }
}

/// A deferred request, written when the connection is otherwise idle.
#[derive(Debug)]
pub struct Job {
    pub name: &'static str,
    pub message: Message,
}

struct Shared {
    tx: mpsc::UnboundedSender<Message>,
    next_job: AtomicU64,
    pending: Mutex<Pending>,
    jobs: Mutex<VecDeque<Job>>,
    job_ready: Notify,
    heartbeat: watch::Sender<Option<Duration>>,
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<JobId, oneshot::Sender<Message>>,
    closed: bool,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle for sending requests on the connection.
#[derive(Clone)]
pub struct Outbound {
    shared: Arc<Shared>,
}

/// Receiving ends consumed by the [`Dispatcher`].
pub struct OutboundReceiver {
    messages: mpsc::UnboundedReceiver<Message>,
    heartbeat: watch::Receiver<Option<Duration>>,
}

impl Outbound {
    pub fn new() -> (Self, OutboundReceiver) {
        let (tx, messages) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat) = watch::channel(None);

        let outbound = Self {
            shared: Arc::new(Shared {
                tx,
                next_job: AtomicU64::new(1),
                pending: Mutex::new(Pending::default()),
                jobs: Mutex::new(VecDeque::new()),
                job_ready: Notify::new(),
                heartbeat: heartbeat_tx,
            }),
        };

        (outbound, OutboundReceiver { messages, heartbeat })
    }

    pub fn next_job_id(&self) -> JobId {
        self.shared.next_job.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues a message for immediate transmission.
    pub fn send(&self, message: Message) -> Result<()> {
        self.shared
            .tx
            .send(message)
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Sends a request and returns a receiver for the reply carrying its job id.
    pub fn call(&self, message: Message) -> Result<oneshot::Receiver<Message>> {
        let job = self.next_job_id();
        let rx = self.register(job);

        if let Err(e) = self.send(message.with_source_job(job)) {
            lock(&self.shared.pending).waiters.remove(&job);
            return Err(e);
        }

        Ok(rx)
    }

    /// Queues a deferred job. Never blocks and never fails; a dead connection
    /// only shows up when a reply is awaited.
    pub fn submit(&self, name: &'static str, message: Message) {
        let mut jobs = lock(&self.shared.jobs);
        jobs.push_back(Job { name, message });
        debug!("Queued job {} ({} pending)", name, jobs.len());
        drop(jobs);
        self.shared.job_ready.notify_one();
    }

    /// Queues a deferred job whose reply is wanted.
    pub fn submit_call(&self, name: &'static str, message: Message) -> oneshot::Receiver<Message> {
        let job = self.next_job_id();
        let rx = self.register(job);
        self.submit(name, message.with_source_job(job));
        rx
    }

    /// Asks the dispatch loop to send heartbeats at the given period.
    pub fn start_heartbeat(&self, period: Duration) {
        self.shared.heartbeat.send_replace(Some(period));
    }

    fn register(&self, job: JobId) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.shared.pending);
        // After close the sender is dropped right here, so the receiver
        // reports a closed connection.
        if !pending.closed {
            pending.waiters.insert(job, tx);
        }
        rx
    }

    fn resolve(&self, job: JobId, message: Message) {
        let waiter = lock(&self.shared.pending).waiters.remove(&job);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!("No waiter for job {}", job),
        }
    }

    fn pop_job(&self) -> Option<Job> {
        lock(&self.shared.jobs).pop_front()
    }

    async fn next_job(&self) -> Job {
        loop {
            if let Some(job) = self.pop_job() {
                return job;
            }
            self.shared.job_ready.notified().await;
        }
    }

    /// Fails every outstanding waiter and refuses new ones.
    fn close(&self) {
        let mut pending = lock(&self.shared.pending);
        pending.closed = true;
        let dropped = pending.waiters.len();
        pending.waiters.clear();
        drop(pending);

        lock(&self.shared.jobs).clear();

        if dropped > 0 {
            debug!("Dropped {} pending replies on close", dropped);
        }
    }
}

/// Awaits a reply receiver, mapping closure and timeout to session errors.
pub async fn wait_reply<T>(
    rx: oneshot::Receiver<T>,
    timeout: Duration,
    what: &'static str,
) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(SessionError::ConnectionClosed),
        Err(_) => Err(SessionError::Timeout(what)),
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Runs the handler for one inbound message, then completes any call waiting
/// on its target job.
async fn dispatch(handlers: &HandlerTable, outbound: &Outbound, message: Message) -> Result<()> {
    let handler = message.kind().and_then(|kind| handlers.get(kind));

    match handler {
        Some(handler) => handler.handle(&message, outbound).await?,
        None => debug!("No handler for message kind {}", message.payload.kind_code()),
    }

    if message.target_job != 0 {
        outbound.resolve(message.target_job, message);
    }

    Ok(())
}

/// Drives one connection: routes inbound frames and writes outbound ones.
pub struct Dispatcher<S> {
    framed: Framed<S, CmFrameCodec>,
    handlers: HandlerTable,
    outbound: Outbound,
    receiver: OutboundReceiver,
    cancel: CancellationToken,
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        framed: Framed<S, CmFrameCodec>,
        handlers: HandlerTable,
        outbound: Outbound,
        receiver: OutboundReceiver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            framed,
            handlers,
            outbound,
            receiver,
            cancel,
        }
    }

    /// Runs until the connection closes, is cancelled, or a handler raises a
    /// hard failure. Every outstanding reply waiter is failed on the way out.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;
        self.outbound.close();
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut heartbeat: Option<Interval> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.flush_outbound().await;
                    info!("Dispatcher stopped");
                    return Ok(());
                }

                frame = self.framed.next() => match frame {
                    Some(Ok(message)) => dispatch(&self.handlers, &self.outbound, message).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("Connection closed by server");
                        return Err(SessionError::ConnectionClosed);
                    }
                },

                Some(message) = self.receiver.messages.recv() => {
                    self.framed.send(message).await?;
                }

                Ok(()) = self.receiver.heartbeat.changed() => {
                    heartbeat = (*self.receiver.heartbeat.borrow()).map(|period| {
                        debug!("Heartbeat every {:?}", period);
                        let mut interval = interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        interval
                    });
                }

                _ = next_tick(&mut heartbeat) => {
                    self.framed.send(Message::heartbeat()).await?;
                }

                job = self.outbound.next_job() => {
                    debug!("Running job {}", job.name);
                    self.framed.send(job.message).await?;
                }
            }
        }
    }

    async fn flush_outbound(&mut self) {
        while let Ok(message) = self.receiver.messages.try_recv() {
            if let Err(e) = self.framed.send(message).await {
                warn!("Failed to flush outbound message: {}", e);
                break;
            }
        }
    }
}
