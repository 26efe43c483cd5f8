// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Routing
//!
//! The [`RoutingRegistry`] maps logical channel names to their [`RoutingTarget`]
//! and makes sure the broker-side resources of a channel are declared on the
//! current session before it is used.
//!
//! Declarations are cached per session: the first `resolve` of a channel on a
//! session declares it, later ones reuse the result. A new session (after a
//! recovery) starts from an empty cache, so every channel is redeclared exactly
//! once on its next use. Failed declarations are never cached.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    state::SupervisorEvent,
    supervisor::{ConnectionSupervisor, Session},
    topology::{ChannelTopology, RoutingTarget},
    transport::OutgoingMessage,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::{
    sync::{broadcast::error::RecvError, OnceCell},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// A resolved channel: where to publish and the session it was declared on.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub target: RoutingTarget,
    pub session: Arc<Session>,
}

#[derive(Default)]
struct Declarations {
    session: u64,
    channels: HashMap<String, Arc<OnceCell<()>>>,
}

/// Resolves logical channels and provisions them lazily.
pub struct RoutingRegistry {
    config: Arc<ConnectionConfig>,
    supervisor: Arc<ConnectionSupervisor>,
    declared: Mutex<Declarations>,
}

impl RoutingRegistry {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Arc<RoutingRegistry> {
        Arc::new(RoutingRegistry {
            config: supervisor.config().clone(),
            supervisor,
            declared: Mutex::new(Declarations::default()),
        })
    }

    /// Looks up the routing target of `channel` without any broker I/O.
    pub fn target(&self, channel: &str) -> Result<RoutingTarget, AmqpError> {
        self.config.route(channel).ok_or_else(|| {
            warn!(channel, "publish requested to an unknown channel");
            AmqpError::UnknownChannel(channel.to_owned())
        })
    }

    /// Every configured logical channel with its target.
    pub fn targets(&self) -> BTreeMap<String, RoutingTarget> {
        self.config.routes()
    }

    /// Resolves `channel` and guarantees its resources are declared on the
    /// session returned alongside.
    ///
    /// The first resolve of a channel on a session declares its queue, exchange
    /// and binding; concurrent callers wait for that single declaration. Failed
    /// declarations are retried by the next call.
    ///
    /// # Parameters
    /// * `channel` - Logical channel name from the routing table.
    ///
    /// # Returns
    /// * `Result<Resolved, AmqpError>` - The routing target and the live session,
    ///   `UnknownChannel` without any broker I/O, `NotConnected` while no session
    ///   is live, or the declaration error.
    pub async fn resolve(&self, channel: &str) -> Result<Resolved, AmqpError> {
        let target = self.target(channel)?;
        let session = self.supervisor.session()?;

        self.entry(channel, session.id())
            .get_or_try_init(|| self.declare(channel, &target, &session))
            .await?;

        Ok(Resolved { target, session })
    }

    /// Publishes an already serialized message to `channel`.
    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<bool, AmqpError> {
        let Resolved { target, session } = self.resolve(channel).await?;
        let broker = session.channel().await?;

        let msg = OutgoingMessage::new(target.exchange(), target.routing_key(), payload);
        debug!(
            channel,
            exchange = msg.exchange,
            routing_key = msg.routing_key,
            "publishing message"
        );

        broker.basic_publish(msg).await.map_err(|err| {
            error!(error = err.to_string(), channel, "error publishing message");
            err
        })
    }

    /// Forgets every declaration: the next `resolve` of each channel redeclares it.
    pub fn invalidate(&self) {
        let mut declared = self.declared.lock();
        if !declared.channels.is_empty() {
            debug!(
                channels = declared.channels.len(),
                "dropping cached declarations"
            );
        }
        declared.channels.clear();
    }

    /// Clears the declaration cache whenever the supervisor replaces its session.
    /// The task ends when the supervisor is shut down.
    pub fn spawn_invalidation(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let mut events = self.supervisor.subscribe();

        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };

                match event {
                    Ok(SupervisorEvent::ConnectionLost { .. })
                    | Ok(SupervisorEvent::Recovered { .. }) => registry.invalidate(),
                    Ok(SupervisorEvent::Closed) | Err(RecvError::Closed) => return,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed supervisor events");
                        registry.invalidate();
                    }
                }
            }
        })
    }

    /// Number of channels with a cached declaration cell.
    pub fn cached(&self) -> usize {
        self.declared.lock().channels.len()
    }

    fn entry(&self, channel: &str, session: u64) -> Arc<OnceCell<()>> {
        let mut declared = self.declared.lock();

        if session > declared.session {
            declared.channels.clear();
            declared.session = session;
        } else if session < declared.session {
            // resolved against a session that was already replaced
            return Arc::new(OnceCell::new());
        }

        declared
            .channels
            .entry(channel.to_owned())
            .or_default()
            .clone()
    }

    async fn declare(
        &self,
        channel: &str,
        target: &RoutingTarget,
        session: &Session,
    ) -> Result<(), AmqpError> {
        debug!(channel, session = session.id(), "declaring channel topology");
        let broker = session.channel().await?;

        ChannelTopology::plan(channel, target, &self.config)
            .install(broker.as_ref())
            .await
    }
}
