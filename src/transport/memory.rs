//! An in-process broker implementing the transport traits.
//!
//! `MemoryBroker` follows the AMQP 0-9-1 model closely enough to exercise the pools, the
//! publisher and the listeners without a running RabbitMq instance:
//! - the default exchange (`""`) routes to the queue named after the routing key;
//! - declared exchanges are direct exchanges, routing on an exact routing key match;
//! - publishing to a missing exchange fails and closes the channel (`NOT_FOUND`);
//! - publishing a message that cannot be routed fails (`NO_ROUTE`), as it would with
//!   publisher confirms and the mandatory flag enabled;
//! - consumers are served round-robin and respect the prefetch count of their channel;
//! - rejected-with-requeue messages go back to the head of the queue, flagged as redelivered;
//! - closing a channel (or its connection) cancels its consumers and requeues its unacked messages.
//!
//! ```rust
//! use carrot_hutch::transport::memory::MemoryBroker;
//! use carrot_hutch::transport::{Channel, Connection, Connector, Exchange, Message, QueueOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = MemoryBroker::new();
//! let channel = broker.connect().await?.create_channel().await?;
//! channel.declare_queue("greetings", &QueueOptions::default()).await?;
//!
//! let exchange = channel.get_exchange("", false).await?;
//! exchange.publish(Message::new("hello"), "greetings").await?;
//!
//! assert_eq!(broker.queue_stats("greetings").unwrap().ready, 1);
//! # Ok(())
//! # }
//! ```
use amq_protocol_types::DeliveryTag;
use lapin::BasicProperties;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use super::{
    Acker, Channel, Connection, Connector, ConsumerTag, DeliveryCallback, Exchange,
    IncomingMessage, Message, Queue, QueueOptions,
};

/// Counters describing the state of a queue in a [`MemoryBroker`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages routed to the queue.
    pub published: usize,
    /// Messages waiting to be delivered.
    pub ready: usize,
    /// Messages delivered and not yet settled.
    pub unacked: usize,
    pub acked: usize,
    /// Messages rejected with requeue (or requeued because their channel closed).
    pub requeued: usize,
    /// Messages rejected without requeue.
    pub discarded: usize,
    /// Active consumers.
    pub consumers: usize,
}

/// An in-process AMQP-like broker. Cloning it gives another handle on the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    /// channel id -> connection id, for every open channel.
    channels: HashMap<u64, u64>,
    open_connections: HashSet<u64>,
    connections_opened: usize,
    exchange_declarations: usize,
    next_id: u64,
    next_delivery_tag: DeliveryTag,
}

struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<DeliveryTag, Unacked>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    stats: QueueStats,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    consumer_tag: ConsumerTag,
    channel_id: u64,
}

struct Consumer {
    tag: ConsumerTag,
    channel_id: u64,
    /// `0` means unlimited.
    prefetch: u16,
    in_flight: usize,
    callback: DeliveryCallback,
}

enum Settle {
    Ack,
    Reject { requeue: bool },
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent connection attempt fail, simulating a broker outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Statistics for `queue`, `None` if the queue was never declared.
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = self.state.lock();
        state.queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
            ..q.stats
        })
    }

    /// Names of the declared exchanges, sorted. The default exchange is not listed.
    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    /// How many exchange declarations the broker received, including redundant ones.
    pub fn exchange_declarations(&self) -> usize {
        self.state.lock().exchange_declarations
    }

    /// How many connections have been opened since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    /// How many connections are currently open.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections.len()
    }

    /// How many channels are currently open.
    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    fn next_id(state: &mut BrokerState) -> u64 {
        state.next_id += 1;
        state.next_id
    }

    fn declare_exchange(&self, name: &str) {
        let mut state = self.state.lock();
        state.exchange_declarations += 1;
        state.exchanges.entry(name.to_owned()).or_default();
    }

    fn exchange_exists(&self, name: &str) -> bool {
        name.is_empty() || self.state.lock().exchanges.contains_key(name)
    }

    fn declare_queue(&self, name: &str) {
        self.state.lock().queues.entry(name.to_owned()).or_default();
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            anyhow::bail!("NOT_FOUND - no queue '{queue}'");
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND - no exchange '{exchange}'"))?;
        if !bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key)
        {
            bindings.push(Binding {
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<(), anyhow::Error> {
        let targets: Vec<String> = {
            let mut state = self.state.lock();
            let targets: Vec<String> = if exchange.is_empty() {
                state
                    .queues
                    .contains_key(routing_key)
                    .then(|| vec![routing_key.to_owned()])
                    .unwrap_or_default()
            } else {
                let bindings = state
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| anyhow::anyhow!("NOT_FOUND - no exchange '{exchange}'"))?;
                bindings
                    .iter()
                    .filter(|b| b.routing_key == routing_key)
                    .map(|b| b.queue.clone())
                    .collect()
            };
            if targets.is_empty() {
                anyhow::bail!(
                    "NO_ROUTE - message to exchange '{exchange}' with routing key '{routing_key}' cannot be routed"
                );
            }
            for queue in &targets {
                if let Some(q) = state.queues.get_mut(queue) {
                    q.stats.published += 1;
                    q.ready.push_back(StoredMessage {
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        properties: message.properties.clone(),
                        payload: message.payload.clone(),
                        redelivered: false,
                    });
                }
            }
            targets
        };
        for queue in targets {
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn register_consumer(
        &self,
        queue: &str,
        channel_id: u64,
        prefetch: u16,
        callback: DeliveryCallback,
    ) -> Result<ConsumerTag, anyhow::Error> {
        let tag = ConsumerTag::generate();
        {
            let mut state = self.state.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| anyhow::anyhow!("NOT_FOUND - no queue '{queue}'"))?;
            q.consumers.push(Consumer {
                tag: tag.clone(),
                channel_id,
                prefetch,
                in_flight: 0,
                callback,
            });
        }
        self.dispatch(queue);
        Ok(tag)
    }

    fn cancel_consumer(&self, queue: &str, tag: &ConsumerTag) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.retain(|c| &c.tag != tag);
        }
    }

    /// Hand ready messages to consumers with spare capacity, round-robin.
    ///
    /// Callbacks are invoked outside of the broker lock; the futures they return are spawned.
    fn dispatch(&self, queue: &str) {
        let deliveries = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let mut deliveries = Vec::new();
            while !q.ready.is_empty() && !q.consumers.is_empty() {
                let n_consumers = q.consumers.len();
                let Some(index) = (0..n_consumers)
                    .map(|offset| (q.next_consumer + offset) % n_consumers)
                    .find(|&i| {
                        let c = &q.consumers[i];
                        c.prefetch == 0 || c.in_flight < usize::from(c.prefetch)
                    })
                else {
                    break;
                };
                q.next_consumer = (index + 1) % n_consumers;
                let Some(message) = q.ready.pop_front() else {
                    break;
                };
                state.next_delivery_tag += 1;
                let delivery_tag = state.next_delivery_tag;
                let consumer = &mut q.consumers[index];
                consumer.in_flight += 1;
                q.unacked.insert(
                    delivery_tag,
                    Unacked {
                        message: message.clone(),
                        consumer_tag: consumer.tag.clone(),
                        channel_id: consumer.channel_id,
                    },
                );
                let acker = MemoryAcker {
                    broker: self.clone(),
                    queue: queue.to_owned(),
                    delivery_tag,
                };
                let incoming =
                    IncomingMessage::new(delivery_tag, consumer.tag.clone(), message.payload, acker)
                        .with_routing(message.exchange, message.routing_key)
                        .with_properties(message.properties)
                        .redelivered(message.redelivered);
                deliveries.push((Arc::clone(&consumer.callback), incoming));
            }
            deliveries
        };
        for (callback, incoming) in deliveries {
            tokio::spawn(callback(incoming));
        }
    }

    fn settle(&self, queue: &str, delivery_tag: DeliveryTag, settle: Settle) -> Result<(), anyhow::Error> {
        {
            let mut state = self.state.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| anyhow::anyhow!("NOT_FOUND - no queue '{queue}'"))?;
            let unacked = q.unacked.remove(&delivery_tag).ok_or_else(|| {
                anyhow::anyhow!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")
            })?;
            if let Some(consumer) = q
                .consumers
                .iter_mut()
                .find(|c| c.tag == unacked.consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            match settle {
                Settle::Ack => q.stats.acked += 1,
                Settle::Reject { requeue: false } => q.stats.discarded += 1,
                Settle::Reject { requeue: true } => {
                    q.stats.requeued += 1;
                    q.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
            }
        }
        self.dispatch(queue);
        Ok(())
    }

    fn close_channel(&self, channel_id: u64) {
        let queues: Vec<String> = {
            let mut state = self.state.lock();
            if state.channels.remove(&channel_id).is_none() {
                return;
            }
            let mut touched = Vec::new();
            for (name, q) in state.queues.iter_mut() {
                q.consumers.retain(|c| c.channel_id != channel_id);
                let orphaned: Vec<DeliveryTag> = q
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.channel_id == channel_id)
                    .map(|(tag, _)| *tag)
                    .collect();
                let mut orphaned_messages: Vec<(DeliveryTag, StoredMessage)> = orphaned
                    .into_iter()
                    .filter_map(|tag| q.unacked.remove(&tag).map(|u| (tag, u.message)))
                    .collect();
                // Oldest deliveries end up at the head of the queue.
                orphaned_messages.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
                for (_, message) in orphaned_messages {
                    q.stats.requeued += 1;
                    q.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..message
                    });
                }
                touched.push(name.clone());
            }
            touched
        };
        for queue in queues {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&self, connection_id: u64) {
        let channels: Vec<u64> = {
            let mut state = self.state.lock();
            if !state.open_connections.remove(&connection_id) {
                return;
            }
            state
                .channels
                .iter()
                .filter(|(_, conn)| **conn == connection_id)
                .map(|(channel, _)| *channel)
                .collect()
        };
        for channel_id in channels {
            self.close_channel(channel_id);
        }
    }
}

#[async_trait::async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, anyhow::Error> {
        let mut state = self.state.lock();
        if state.unavailable {
            anyhow::bail!("Connection refused: the broker is unavailable");
        }
        let id = Self::next_id(&mut state);
        state.open_connections.insert(id);
        state.connections_opened += 1;
        Ok(MemoryConnection {
            broker: self.clone(),
            id,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, anyhow::Error> {
        if self.is_closed() {
            anyhow::bail!("Cannot open a channel on a closed connection");
        }
        let mut state = self.broker.state.lock();
        let id = MemoryBroker::next_id(&mut state);
        state.channels.insert(id, self.id);
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
            closed: Arc::new(AtomicBool::new(false)),
            connection_closed: Arc::clone(&self.closed),
            prefetch: Arc::new(AtomicU16::new(0)),
            declared_exchanges: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.close_connection(self.id);
        }
        Ok(())
    }
}

/// A channel opened on a [`MemoryConnection`]. Clones share the same channel.
#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    closed: Arc<AtomicBool>,
    connection_closed: Arc<AtomicBool>,
    prefetch: Arc<AtomicU16>,
    declared_exchanges: Arc<Mutex<HashSet<String>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), anyhow::Error> {
        if self.is_closed() {
            anyhow::bail!("The channel is closed");
        }
        Ok(())
    }

    /// A channel-level error: the broker closes the channel.
    fn fail(&self, error: anyhow::Error) -> anyhow::Error {
        self.closed.store(true, Ordering::Release);
        self.broker.close_channel(self.id);
        error
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    type Exchange = MemoryExchange;
    type Queue = MemoryQueue;

    async fn get_exchange(&self, name: &str, ensure: bool) -> Result<MemoryExchange, anyhow::Error> {
        self.ensure_open()?;
        if ensure && !name.is_empty() {
            let mut declared = self.declared_exchanges.lock();
            if !declared.contains(name) {
                self.broker.declare_exchange(name);
                declared.insert(name.to_owned());
            }
        }
        Ok(MemoryExchange {
            channel: self.clone(),
            name: name.to_owned(),
        })
    }

    async fn declare_queue(&self, name: &str, _options: &QueueOptions) -> Result<MemoryQueue, anyhow::Error> {
        self.ensure_open()?;
        self.broker.declare_queue(name);
        Ok(MemoryQueue {
            channel: self.clone(),
            name: name.to_owned(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        self.broker
            .bind_queue(queue, exchange, routing_key)
            .map_err(|e| self.fail(e))
    }

    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection_closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.close_channel(self.id);
        }
        Ok(())
    }
}

/// An exchange handle resolved through a [`MemoryChannel`].
pub struct MemoryExchange {
    channel: MemoryChannel,
    name: String,
}

#[async_trait::async_trait]
impl Exchange for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: Message, routing_key: &str) -> Result<(), anyhow::Error> {
        self.channel.ensure_open()?;
        if !self.channel.broker.exchange_exists(&self.name) {
            return Err(self.channel.fail(anyhow::anyhow!(
                "NOT_FOUND - no exchange '{}'",
                self.name
            )));
        }
        self.channel.broker.publish(&self.name, routing_key, message)
    }
}

/// A queue handle resolved through a [`MemoryChannel`].
pub struct MemoryQueue {
    channel: MemoryChannel,
    name: String,
}

#[async_trait::async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, callback: DeliveryCallback) -> Result<ConsumerTag, anyhow::Error> {
        self.channel.ensure_open()?;
        let prefetch = self.channel.prefetch.load(Ordering::Acquire);
        self.channel
            .broker
            .register_consumer(&self.name, self.channel.id, prefetch, callback)
    }

    async fn cancel(&self, consumer_tag: &ConsumerTag) -> Result<(), anyhow::Error> {
        self.channel.ensure_open()?;
        self.channel.broker.cancel_consumer(&self.name, consumer_tag);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    delivery_tag: DeliveryTag,
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.broker.settle(&self.queue, self.delivery_tag, Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.broker
            .settle(&self.queue, self.delivery_tag, Settle::Reject { requeue })
    }
}
