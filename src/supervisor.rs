// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! The [`ConnectionSupervisor`] owns the single physical broker connection and
//! drives it through the [`ConnectionState`] machine:
//!
//! - `connect` performs the initial attempt. A failure is reported to the caller
//!   and never retried here.
//! - An unsolicited connection loss moves to `Recovering` and a background task
//!   retries at the configured fixed interval, or to `Disconnected` when
//!   automatic recovery is disabled.
//! - `shutdown` closes sub-channels then the connection, logging close errors,
//!   and leaves the supervisor in its terminal `Disconnected` state.
//!
//! Transitions are serialized by an async mutex. Reading the live [`Session`]
//! never waits on it, so callers observe `NotConnected` while a recovery is running.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    state::{ConnectionState, SupervisorEvent},
    transport::{BrokerChannel, BrokerConnection, Connector},
};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

const EVENTS_CAPACITY: usize = 32;

/// The live, supervised connection and its multiplexed sub-channels.
///
/// Sessions are replaced, never repaired, after a connection loss: hold one only
/// for the duration of a single operation.
pub struct Session {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
    primary: Mutex<Arc<dyn BrokerChannel>>,
    pool: parking_lot::Mutex<Vec<Arc<dyn BrokerChannel>>>,
}

impl Session {
    fn new(id: u64, connection: Arc<dyn BrokerConnection>, primary: Arc<dyn BrokerChannel>) -> Self {
        Session {
            id,
            connection,
            primary: Mutex::new(primary),
            pool: parking_lot::Mutex::new(vec![]),
        }
    }

    /// Identifier of this session; grows every time a connection is established.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Returns the primary sub-channel, reopening it if the broker closed it.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut primary = self.primary.lock().await;

        if !primary.is_open() {
            if !self.connection.is_open() {
                return Err(AmqpError::NotConnected);
            }

            debug!(session = self.id, "primary channel closed, opening a new one");
            *primary = self.connection.create_channel().await?;
        }

        Ok(primary.clone())
    }

    /// Opens an additional sub-channel owned by this session. Channels closed in
    /// the meantime are forgotten.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.connection.is_open() {
            return Err(AmqpError::NotConnected);
        }

        let channel = self.connection.create_channel().await?;
        let mut pool = self.pool.lock();
        pool.retain(|open| open.is_open());
        pool.push(channel.clone());
        Ok(channel)
    }

    /// Closes every sub-channel, then the connection. Errors are logged only.
    async fn close(&self) {
        let mut channels = std::mem::take(&mut *self.pool.lock());
        channels.push(self.primary.lock().await.clone());

        for channel in channels {
            if !channel.is_open() {
                continue;
            }

            match channel.close().await {
                Ok(()) => debug!(session = self.id, "RabbitMQ channel closed"),
                Err(err) => warn!(error = err.to_string(), "error closing RabbitMQ channel"),
            }
        }

        if self.connection.is_open() {
            match self.connection.close().await {
                Ok(()) => info!(session = self.id, "RabbitMQ connection closed"),
                Err(err) => warn!(error = err.to_string(), "error closing RabbitMQ connection"),
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Owns the broker connection and keeps it alive.
pub struct ConnectionSupervisor {
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    transition: Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SupervisorEvent>,
    shutdown: watch::Sender<bool>,
    sessions: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(config: Arc<ConnectionConfig>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Arc::new(ConnectionSupervisor {
            config,
            connector,
            transition: Mutex::new(()),
            session: RwLock::new(None),
            state,
            events,
            shutdown,
            sessions: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receives lifecycle notifications emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Opens the connection and its administrative channel.
    ///
    /// Only valid from `Disconnected`. A failed attempt leaves the supervisor
    /// `Disconnected` and is not retried: retrying at startup is up to the caller.
    /// Once connected, losses of the connection are watched for and, if enabled,
    /// recovered from in the background.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `Ok` once `Connected`. `ConnectionError`,
    ///   `ConnectionTimeout` or `ChannelError` when the attempt failed,
    ///   `AlreadyConnected` outside `Disconnected` and `ShutDown` after `shutdown`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _transition = self.transition.lock().await;

        if self.is_shut_down() {
            return Err(AmqpError::ShutDown);
        }

        if self.state() != ConnectionState::Disconnected {
            return Err(AmqpError::AlreadyConnected);
        }

        debug!(
            host = self.config.host(),
            port = self.config.port(),
            "creating amqp connection..."
        );
        self.state.send_replace(ConnectionState::Connecting);

        match self.establish().await {
            Ok((session, lost)) => {
                let id = session.id();
                self.install(session);
                info!(
                    "Successfully connected to RabbitMQ server at {}:{}",
                    self.config.host(),
                    self.config.port()
                );
                self.emit(SupervisorEvent::Connected { session: id });
                self.watch_connection(id, lost);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failed to connect to RabbitMQ server");
                self.state.send_replace(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Returns the live session, or `NotConnected` in any state but `Connected`.
    /// Never blocks and never retries.
    pub fn session(&self) -> Result<Arc<Session>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::NotConnected);
        }

        self.session.read().clone().ok_or(AmqpError::NotConnected)
    }

    /// Waits until the supervisor is `Connected`.
    ///
    /// Fails with `ShutDown` once the supervisor has been shut down.
    pub async fn wait_connected(&self) -> Result<(), AmqpError> {
        let mut state = self.state.subscribe();

        loop {
            if self.is_shut_down() {
                return Err(AmqpError::ShutDown);
            }

            if state.borrow_and_update().is_connected() {
                return Ok(());
            }

            if state.changed().await.is_err() {
                return Err(AmqpError::InternalError);
            }
        }
    }

    /// Closes sub-channels and the connection, in that order, and stops any
    /// running recovery. Close errors are logged, never returned. In-flight
    /// publishes are not cancelled and may fail individually.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            debug!("connection supervisor already shut down");
            return;
        }

        info!("shutting down RabbitMQ connection");
        let _transition = self.transition.lock().await;

        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }

        self.state.send_replace(ConnectionState::Disconnected);
        self.emit(SupervisorEvent::Closed);
    }

    async fn establish(
        &self,
    ) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<String>), AmqpError> {
        let link = match timeout(
            self.config.connection_timeout(),
            self.connector.connect(&self.config),
        )
        .await
        {
            Ok(link) => link?,
            Err(_) => {
                error!(
                    timeout = ?self.config.connection_timeout(),
                    "connection attempt timed out"
                );
                return Err(AmqpError::ConnectionTimeout);
            }
        };
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let primary = match link.connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(err) = link.connection.close().await {
                    warn!(error = err.to_string(), "error closing RabbitMQ connection");
                }
                return Err(err);
            }
        };
        debug!("channel created");

        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((Arc::new(Session::new(id, link.connection, primary)), link.lost))
    }

    fn install(&self, session: Arc<Session>) {
        *self.session.write() = Some(session);
        self.state.send_replace(ConnectionState::Connected);
    }

    fn current_session_id(&self) -> Option<u64> {
        self.session.read().as_ref().map(|session| session.id())
    }

    fn emit(&self, event: SupervisorEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn watch_connection(self: &Arc<Self>, session: u64, mut lost: mpsc::UnboundedReceiver<String>) {
        let supervisor = Arc::downgrade(self);

        tokio::spawn(async move {
            let reason = lost
                .recv()
                .await
                .unwrap_or_else(|| "connection closed".to_owned());

            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.on_connection_lost(session, reason).await;
            }
        });
    }

    async fn on_connection_lost(self: Arc<Self>, session: u64, reason: String) {
        {
            let _transition = self.transition.lock().await;

            if self.is_shut_down() {
                debug!(session, "connection closed by shutdown");
                return;
            }

            if self.current_session_id() != Some(session) {
                debug!(session, "loss reported for a replaced session");
                return;
            }

            warn!(reason, "RabbitMQ connection lost");
            self.session.write().take();
            self.emit(SupervisorEvent::ConnectionLost {
                reason: reason.clone(),
            });

            if !self.config.automatic_recovery() {
                warn!("automatic recovery disabled, staying disconnected");
                self.state.send_replace(ConnectionState::Disconnected);
                self.emit(SupervisorEvent::Disconnected { reason });
                return;
            }

            info!("RabbitMQ connection recovery started");
            self.state.send_replace(ConnectionState::Recovering);
            self.emit(SupervisorEvent::RecoveryStarted);
        }

        self.recover().await;
    }

    /// Retries at a constant interval until a connection is re-established or
    /// the supervisor is shut down. The transition lock is only held during an
    /// attempt, never while sleeping.
    async fn recover(self: Arc<Self>) {
        let interval = self.config.recovery_interval();
        let mut shutdown = self.shutdown.subscribe();
        let mut attempts: u32 = 0;

        loop {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.wait_for(|closed| *closed) => {
                    debug!("recovery stopped by shutdown");
                    return;
                }
            }

            attempts += 1;
            let transition = self.transition.lock().await;
            if self.is_shut_down() {
                return;
            }

            match self.establish().await {
                Ok((session, lost)) => {
                    let id = session.id();
                    self.install(session);
                    info!(attempts, "RabbitMQ connection recovered successfully");
                    self.emit(SupervisorEvent::Recovered {
                        session: id,
                        attempts,
                    });
                    drop(transition);
                    self.watch_connection(id, lost);
                    return;
                }
                Err(err) => {
                    warn!(
                        attempts,
                        error = err.to_string(),
                        "RabbitMQ connection recovery attempt failed"
                    );
                }
            }
        }
    }
}
