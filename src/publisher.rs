// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! A fluent builder accumulating one JSON message and publishing it to a logical
//! channel. A publisher is consumed by [`MessagePublisher::send_to`]: build a new
//! one for every message.
//!
//! ```ignore
//! let accepted = client
//!     .publisher()
//!     .add("type", "login")
//!     .add("player", "steve")
//!     .send_to("auth-server")
//!     .await?;
//! ```

use crate::{errors::AmqpError, routing::RoutingRegistry};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error};

/// Builds and sends a single message.
pub struct MessagePublisher {
    registry: Arc<RoutingRegistry>,
    runtime: Handle,
    data: Map<String, Value>,
}

impl MessagePublisher {
    /// Creates an empty publisher whose sends run on `runtime`.
    pub fn new(registry: Arc<RoutingRegistry>, runtime: Handle) -> MessagePublisher {
        MessagePublisher {
            registry,
            runtime,
            data: Map::new(),
        }
    }

    /// Replaces the message data.
    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Adds a single key-value pair to the message data.
    pub fn add(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Adds a structured value, serialized to JSON.
    pub fn add_serialized<T: Serialize>(
        mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, AmqpError> {
        let value = serde_json::to_value(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize message value");
            AmqpError::ParsePayloadError
        })?;
        self.data.insert(key.into(), value);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sends the message to `channel`.
    ///
    /// Returns immediately, the publish runs on the runtime the publisher was
    /// created with. Without data, or for a channel missing from the routing
    /// table, the future is already failed and the broker is never contacted.
    ///
    /// # Parameters
    /// * `channel` - Logical channel name from the routing table.
    ///
    /// # Returns
    /// * `PublishFuture` - Resolves to `Ok(true)` once the broker accepted the
    ///   message, which says nothing about consumers, `Ok(false)` if the broker
    ///   refused it, or the error that prevented the publish.
    ///
    /// # Example
    /// ```ignore
    /// let accepted = publisher.add("type", "login").send_to("auth-server").await?;
    /// ```
    pub fn send_to(self, channel: &str) -> PublishFuture {
        if self.data.is_empty() {
            return PublishFuture::ready(Err(AmqpError::EmptyMessage));
        }

        if let Err(err) = self.registry.target(channel) {
            return PublishFuture::ready(Err(err));
        }

        let payload = match serde_json::to_vec(&self.data) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize message");
                return PublishFuture::ready(Err(AmqpError::ParsePayloadError));
            }
        };

        debug!(channel, bytes = payload.len(), "dispatching message");
        let registry = self.registry;
        let channel = channel.to_owned();
        let handle = self
            .runtime
            .spawn(async move { registry.publish(&channel, payload).await });

        PublishFuture {
            inner: Inner::Spawned(handle),
        }
    }
}

enum Inner {
    Ready(Option<Result<bool, AmqpError>>),
    Spawned(JoinHandle<Result<bool, AmqpError>>),
}

/// Completion of a publish. It can only be awaited: a message handed to the
/// transport cannot be cancelled, dropping the future does not stop the send.
#[must_use = "the publish outcome is only reported through this future"]
pub struct PublishFuture {
    inner: Inner,
}

impl PublishFuture {
    fn ready(result: Result<bool, AmqpError>) -> PublishFuture {
        PublishFuture {
            inner: Inner::Ready(Some(result)),
        }
    }
}

impl Future for PublishFuture {
    type Output = Result<bool, AmqpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(AmqpError::InternalError))),
            Inner::Spawned(handle) => handle.poll_unpin(cx).map(|joined| match joined {
                Ok(result) => result,
                Err(err) => {
                    error!(error = err.to_string(), "publish task failed");
                    Err(AmqpError::InternalError)
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        supervisor::ConnectionSupervisor,
        testing::{test_config, FakeBroker},
        transport::MockConnector,
    };
    use serde_json::json;

    async fn registry(broker: &Arc<FakeBroker>) -> Arc<RoutingRegistry> {
        let supervisor = ConnectionSupervisor::new(test_config(true), broker.clone());
        supervisor.connect().await.unwrap();
        RoutingRegistry::new(supervisor)
    }

    fn untouched_registry() -> Arc<RoutingRegistry> {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        RoutingRegistry::new(ConnectionSupervisor::new(test_config(true), Arc::new(connector)))
    }

    #[tokio::test]
    async fn empty_message_fails_without_transport() {
        let publisher = MessagePublisher::new(untouched_registry(), Handle::current());

        assert_eq!(
            publisher.send_to("auth-server").await,
            Err(AmqpError::EmptyMessage)
        );
    }

    #[tokio::test]
    async fn unknown_channel_fails_without_transport() {
        let publisher = MessagePublisher::new(untouched_registry(), Handle::current());

        assert_eq!(
            publisher.add("type", "login").send_to("no-such-channel").await,
            Err(AmqpError::UnknownChannel("no-such-channel".to_owned()))
        );
    }

    #[tokio::test]
    async fn publishes_to_direct_and_exchange_channels() {
        let broker = FakeBroker::new();
        let registry = registry(&broker).await;

        let login = MessagePublisher::new(registry.clone(), Handle::current())
            .add("type", "login")
            .send_to("auth-server");
        let join = MessagePublisher::new(registry.clone(), Handle::current())
            .add("type", "join")
            .send_to("events");

        assert_eq!(login.await, Ok(true));
        assert_eq!(join.await, Ok(true));

        let published = broker.published();
        assert_eq!(published.len(), 2);
        let to_queue = published.iter().find(|m| m.routing_key == "auth-server").unwrap();
        assert_eq!(to_queue.exchange, "");
        assert_eq!(
            serde_json::from_slice::<Value>(&to_queue.payload).unwrap(),
            json!({"type": "login"})
        );
        let to_exchange = published.iter().find(|m| m.exchange == "events-exchange").unwrap();
        assert_eq!(to_exchange.routing_key, "");
        assert_eq!(
            serde_json::from_slice::<Value>(&to_exchange.payload).unwrap(),
            json!({"type": "join"})
        );
        assert_eq!(to_exchange.content_type, "application/json");
    }

    #[tokio::test]
    async fn data_replaces_and_add_serialized_nests() {
        #[derive(Serialize)]
        struct Player {
            name: String,
            level: u32,
        }

        let broker = FakeBroker::new();
        let registry = registry(&broker).await;
        let mut data = Map::new();
        data.insert("stale".to_owned(), json!(1));

        let publisher = MessagePublisher::new(registry, Handle::current())
            .add("dropped", true)
            .data(data)
            .add_serialized(
                "player",
                &Player {
                    name: "steve".to_owned(),
                    level: 3,
                },
            )
            .unwrap();

        assert!(publisher.send_to("auth-server").await.unwrap());
        assert_eq!(
            serde_json::from_slice::<Value>(&broker.published()[0].payload).unwrap(),
            json!({"stale": 1, "player": {"name": "steve", "level": 3}})
        );
    }

    #[tokio::test]
    async fn reports_not_connected_through_the_future() {
        let broker = FakeBroker::new();
        let supervisor = ConnectionSupervisor::new(test_config(true), broker.clone());
        let registry = RoutingRegistry::new(supervisor);

        let sent = MessagePublisher::new(registry, Handle::current())
            .add("type", "login")
            .send_to("auth-server");

        assert_eq!(sent.await, Err(AmqpError::NotConnected));
    }

    #[tokio::test]
    async fn broker_refusal_resolves_to_false() {
        let broker = FakeBroker::new();
        broker.nack_publishes();
        let registry = registry(&broker).await;

        let sent = MessagePublisher::new(registry, Handle::current())
            .add("type", "login")
            .send_to("auth-server");

        assert_eq!(sent.await, Ok(false));
    }
}
