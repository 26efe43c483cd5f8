// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Broker-side queues and exchanges outlive connections, like durable resources
//! on a real broker, and redeclaring one with different attributes fails.

use crate::{
    config::{test_settings, ConnectionConfig},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerChannel, BrokerConnection, Connector, Link, OutgoingMessage},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Semaphore};

pub(crate) fn test_config(automatic_recovery: bool) -> Arc<ConnectionConfig> {
    let mut settings = test_settings();
    settings.automatic_recovery = automatic_recovery;
    Arc::new(ConnectionConfig::new(settings).unwrap())
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    nack_publishes: bool,
    connect_attempts: u32,
    queues: HashMap<String, QueueDefinition>,
    exchanges: HashMap<String, ExchangeDefinition>,
    declarations: Vec<String>,
    published: Vec<OutgoingMessage>,
    live: Option<(Arc<AtomicBool>, mpsc::UnboundedSender<String>)>,
    declare_gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    pub(crate) fn nack_publishes(&self) {
        self.state.lock().nack_publishes = true;
    }

    /// Kills the live connection as a network failure would.
    pub(crate) fn drop_connection(&self, reason: &str) {
        if let Some((open, lost)) = self.state.lock().live.take() {
            open.store(false, Ordering::SeqCst);
            let _ = lost.send(reason.to_owned());
        }
    }

    /// Holds every `queue.declare` until a permit is added to the returned gate.
    pub(crate) fn hold_queue_declarations(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().declare_gate = Some(gate.clone());
        gate
    }

    /// Creates a queue as if another client had declared it.
    pub(crate) fn seed_queue(&self, def: QueueDefinition) {
        self.state.lock().queues.insert(def.name.clone(), def);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state
            .lock()
            .live
            .as_ref()
            .is_some_and(|(open, _)| open.load(Ordering::SeqCst))
    }

    pub(crate) fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Every declare/bind request received, e.g. `queue:auth-server`.
    pub(crate) fn declarations(&self) -> Vec<String> {
        self.state.lock().declarations.clone()
    }

    pub(crate) fn published(&self) -> Vec<OutgoingMessage> {
        self.state.lock().published.clone()
    }
}

#[async_trait]
impl Connector for FakeBroker {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Link, AmqpError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.unreachable {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let open = Arc::new(AtomicBool::new(true));
        let (notify, lost) = mpsc::unbounded_channel();
        state.live = Some((open.clone(), notify));

        Ok(Link {
            connection: Arc::new(FakeConnection {
                open,
                broker: self.state.clone(),
            }),
            lost,
        })
    }
}

struct FakeConnection {
    open: Arc<AtomicBool>,
    broker: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError);
        }

        Ok(Arc::new(FakeChannel {
            connection: self.open.clone(),
            open: AtomicBool::new(true),
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);

        let mut state = self.broker.lock();
        if state
            .live
            .as_ref()
            .is_some_and(|(open, _)| Arc::ptr_eq(open, &self.open))
        {
            state.live = None;
        }

        Ok(())
    }
}

struct FakeChannel {
    connection: Arc<AtomicBool>,
    open: AtomicBool,
    broker: Arc<Mutex<BrokerState>>,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelError)
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let gate = self.broker.lock().declare_gate.clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }

        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.declarations.push(format!("queue:{}", def.name));

        match state.queues.get(&def.name) {
            Some(existing) if existing != def => Err(AmqpError::DeclareQueueError(def.name.clone())),
            _ => {
                state.queues.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.declarations.push(format!("exchange:{}", def.name));

        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.lock().declarations.push(format!(
            "bind:{}->{}",
            binding.queue_name, binding.exchange_name
        ));
        Ok(())
    }

    async fn basic_publish(&self, msg: OutgoingMessage) -> Result<bool, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError);
        }

        let mut state = self.broker.lock();
        state.published.push(msg);
        Ok(!state.nack_publishes)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
