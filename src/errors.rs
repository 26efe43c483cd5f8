// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Bridge
//!
//! This module provides the error type shared by every layer of the bridge.
//! The `AmqpError` enum covers configuration validation, connection supervision,
//! topology provisioning, routing and publishing failures.

use thiserror::Error;

/// Represents errors that can occur while configuring, supervising or using
/// a broker connection.
///
/// Every failure is surfaced to the immediate caller through this type. The
/// supervisor only retries unsolicited disconnects internally, never initial
/// connects or declarations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A required configuration field is missing or invalid
    #[error("invalid configuration: `{0}` must be configured")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection attempt did not complete within the configured timeout
    #[error("connection attempt timed out")]
    ConnectionTimeout,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error loading or applying TLS material
    #[error("tls error: {0}")]
    TlsError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The logical channel is not part of the routing table
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    /// The supervisor is not in the `Connected` state
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection is open or being opened
    #[error("connection already established or in progress")]
    AlreadyConnected,

    /// The supervisor was shut down
    #[error("connection supervisor was shut down")]
    ShutDown,

    /// A publish was requested without any message data
    #[error("no data provided, use data() or add() before send_to()")]
    EmptyMessage,

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error handing a message to the transport
    #[error("failure to publish")]
    PublishingError,

    /// Error closing a channel or connection
    #[error("failure to close")]
    CloseError,
}
