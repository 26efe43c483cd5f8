// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ exchanges. Exchanges are the
//! routing mechanism in RabbitMQ that determine how messages are distributed to
//! queues. Exchange channels of the bridge are backed by fanout exchanges, which
//! broadcast every message to all bound queues regardless of routing keys.

use crate::config::{Arguments, ConnectionConfig};

/// Definition of a fanout exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) params: Arguments,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is neither durable nor auto-deleted and has no arguments.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            delete: false,
            durable: false,
            params: Arguments::default(),
        }
    }

    /// Creates a fanout exchange definition carrying the configured exchange defaults.
    pub fn fanout_from_config(name: &str, config: &ConnectionConfig) -> ExchangeDefinition {
        let mut def = ExchangeDefinition::new(name).params(config.exchange_arguments());
        if config.exchange_durable() {
            def = def.durable();
        }
        if config.exchange_auto_delete() {
            def = def.delete();
        }
        def
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange parameters.
    pub fn params(mut self, params: Arguments) -> Self {
        self.params = params;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}
