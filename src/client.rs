// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! Wires a validated [`ConnectionConfig`] to a [`ConnectionSupervisor`], a
//! [`RoutingRegistry`] and the [`MessagePublisher`] facade. A host creates one
//! client at startup, connects it, and shuts it down when it stops.
//!
//! ```ignore
//! let config = ConnectionConfig::new(ConnectionSettings::from_json(&raw)?)?;
//! let client = RabbitMQClient::new(config)?;
//! client.connect().await?;
//!
//! client.publisher().add("type", "join").send_to("events").await?;
//! client.shutdown().await;
//! ```

use crate::{
    channel::LapinConnector,
    config::ConnectionConfig,
    errors::AmqpError,
    publisher::{MessagePublisher, PublishFuture},
    routing::RoutingRegistry,
    state::{ConnectionState, SupervisorEvent},
    supervisor::ConnectionSupervisor,
    transport::Connector,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{error, info};

pub struct RabbitMQClient {
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<RoutingRegistry>,
    runtime: Handle,
}

impl RabbitMQClient {
    /// Creates a client backed by lapin. Must be called within a tokio runtime.
    pub fn new(config: ConnectionConfig) -> Result<RabbitMQClient, AmqpError> {
        Self::with_connector(config, Arc::new(LapinConnector::new()))
    }

    /// Creates a client on top of any transport.
    pub fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<RabbitMQClient, AmqpError> {
        let runtime = Handle::try_current().map_err(|err| {
            error!(error = err.to_string(), "no tokio runtime available");
            AmqpError::InternalError
        })?;

        let supervisor = ConnectionSupervisor::new(Arc::new(config), connector);
        let registry = RoutingRegistry::new(supervisor.clone());
        let _ = registry.spawn_invalidation();

        Ok(RabbitMQClient {
            supervisor,
            registry,
            runtime,
        })
    }

    /// Performs the initial connection attempt.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.supervisor.connect().await
    }

    /// Connects on a background task, for hosts that must not wait on startup.
    pub fn connect_in_background(&self) -> JoinHandle<Result<(), AmqpError>> {
        let supervisor = self.supervisor.clone();

        self.runtime.spawn(async move {
            let result = supervisor.connect().await;
            if result.is_ok() {
                info!("RabbitMQ client ready");
            }
            result
        })
    }

    /// Starts a new, empty message.
    pub fn publisher(&self) -> MessagePublisher {
        MessagePublisher::new(self.registry.clone(), self.runtime.clone())
    }

    /// Sends `data` to `channel` in one call.
    pub fn send(&self, channel: &str, data: Map<String, Value>) -> PublishFuture {
        self.publisher().data(data).send_to(channel)
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.supervisor.subscribe()
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.supervisor.config()
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<RoutingRegistry> {
        &self.registry
    }

    /// Closes the broker connection. The client cannot be reconnected afterwards.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await
    }
}
