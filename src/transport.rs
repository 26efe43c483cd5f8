// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! The supervisor and the routing registry only talk to the broker through the
//! traits of this module. The production implementation lives in
//! [`crate::channel`] and is backed by lapin; tests plug in a simulated broker.
//!
//! The transport must provide connection open/close, channel open/close,
//! `queue.declare`, `exchange.declare`, `queue.bind` and `basic.publish`, plus a
//! notification when an established connection is lost.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A freshly opened broker connection together with its loss notifications.
///
/// Every unsolicited connection failure is reported on `lost` with a
/// human-readable reason. A closed sender counts as a lost connection too.
pub struct Link {
    pub connection: Arc<dyn BrokerConnection>,
    pub lost: mpsc::UnboundedReceiver<String>,
}

/// A serialized message ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_id: String,
    pub content_type: String,
}

impl OutgoingMessage {
    /// Creates a JSON message with a random message id.
    pub fn new(exchange: &str, routing_key: &str, payload: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload,
            message_id: Uuid::new_v4().to_string(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
        }
    }
}

/// Opens physical connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection using the endpoint, credentials and TLS material of `config`.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Link, AmqpError>;
}

/// One physical broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a multiplexed sub-channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One sub-channel of a broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message. Resolves to `true` once the broker accepted it and
    /// to `false` if the broker refused it.
    async fn basic_publish(&self, msg: OutgoingMessage) -> Result<bool, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
