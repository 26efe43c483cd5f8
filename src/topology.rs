// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module describes where a logical channel routes to and which broker-side
//! resources it needs. A [`ChannelTopology`] is the provisioning plan of one
//! channel: an exchange, a queue and a binding between them, each optional.
//! Installing it declares everything in that order.
//!
//! - `DirectQueue` channels declare one queue named after the channel.
//! - `FanoutExchange` channels declare a fanout exchange and, when the process
//!   subscribes to its channels, a queue named `<identity>.<channel>` bound to it.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use tracing::{debug, error};

/// Destination a logical channel publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingTarget {
    /// Published through the default exchange straight into the named queue.
    DirectQueue(String),
    /// Published to the named fanout exchange.
    FanoutExchange(String),
}

impl RoutingTarget {
    /// Exchange to publish to; the default exchange for direct queues.
    pub fn exchange(&self) -> &str {
        match self {
            RoutingTarget::DirectQueue(_) => "",
            RoutingTarget::FanoutExchange(exchange) => exchange,
        }
    }

    /// Routing key to publish with; ignored by fanout exchanges.
    pub fn routing_key(&self) -> &str {
        match self {
            RoutingTarget::DirectQueue(queue) => queue,
            RoutingTarget::FanoutExchange(_) => "",
        }
    }
}

/// Name of the queue an identity consumes an exchange channel from.
pub fn subscription_queue(identity: &str, channel: &str) -> String {
    format!("{identity}.{channel}")
}

/// Broker-side resources needed by one logical channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTopology {
    pub(crate) channel: String,
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) binding: Option<QueueBinding>,
}

impl ChannelTopology {
    /// Builds the provisioning plan of `channel` from the configured defaults.
    pub fn plan(channel: &str, target: &RoutingTarget, config: &ConnectionConfig) -> Self {
        match target {
            RoutingTarget::DirectQueue(queue) => ChannelTopology {
                channel: channel.to_owned(),
                exchange: None,
                queue: Some(QueueDefinition::from_config(queue, config)),
                binding: None,
            },
            RoutingTarget::FanoutExchange(exchange) => {
                let mut topology = ChannelTopology {
                    channel: channel.to_owned(),
                    exchange: Some(ExchangeDefinition::fanout_from_config(exchange, config)),
                    queue: None,
                    binding: None,
                };

                if config.auto_subscribe() {
                    let queue = subscription_queue(config.consumer_name(), channel);
                    topology.binding = Some(QueueBinding::new(&queue).exchange(exchange));
                    topology.queue = Some(QueueDefinition::from_config(&queue, config));
                }

                topology
            }
        }
    }

    /// Declares the exchange, the queue and the binding, in that order.
    ///
    /// A declaration whose attributes differ from an existing broker resource
    /// fails and the error is propagated as is.
    pub async fn install(&self, broker: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchange(broker).await?;
        self.install_queue(broker).await?;
        self.binding_queue(broker).await
    }

    async fn install_exchange(&self, broker: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let Some(exch) = &self.exchange else {
            return Ok(());
        };

        debug!(channel = self.channel, "creating exchange: {}", exch.name);
        if let Err(err) = broker.exchange_declare(exch).await {
            error!(
                error = err.to_string(),
                name = exch.name,
                "error to declare the exchange"
            );
            return Err(err);
        }
        debug!("exchange: {} was created", exch.name);

        Ok(())
    }

    async fn install_queue(&self, broker: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let Some(def) = &self.queue else {
            return Ok(());
        };

        debug!(channel = self.channel, "creating queue: {}", def.name);
        if let Err(err) = broker.queue_declare(def).await {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the queue"
            );
            return Err(err);
        }
        debug!("queue: {} was created", def.name);

        Ok(())
    }

    async fn binding_queue(&self, broker: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let Some(binding) = &self.binding else {
            return Ok(());
        };

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        if let Err(err) = broker.queue_bind(binding).await {
            error!(error = err.to_string(), "error to bind queue to exchange");
            return Err(err);
        }

        Ok(())
    }
}
