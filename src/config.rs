// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! This module turns raw, deserializable [`ConnectionSettings`] into an immutable,
//! fully validated [`ConnectionConfig`]. Validation happens once, at construction
//! time, so an invalid configuration fails before any connection attempt.
//!
//! Every accessor returning a collection hands out an owned copy: mutating it can
//! never affect the stored configuration.

use crate::{errors::AmqpError, topology::RoutingTarget};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Broker-side arguments attached to a queue or exchange declaration
/// (e.g. `x-message-ttl`, `alternate-exchange`).
///
/// An absent argument map and an empty one mean the same thing: the resource is
/// declared with an empty argument table.
pub type Arguments = BTreeMap<String, serde_json::Value>;

/// A credential that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret::new(value)
    }
}

/// Raw TLS settings as provided by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub protocol: String,
    pub trust_store: Option<PathBuf>,
    pub trust_store_password: Option<Secret>,
    pub key_store: Option<PathBuf>,
    pub key_store_password: Option<Secret>,
    pub validate_server_certificate: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            enabled: false,
            protocol: TlsProtocol::TlsV13.as_str().to_owned(),
            trust_store: None,
            trust_store_password: None,
            key_store: None,
            key_store_password: None,
            validate_server_certificate: true,
        }
    }
}

/// Attributes every queue is declared with.
///
/// Changing them for a queue that already exists on the broker makes the
/// declaration fail; existing queues are never migrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::default(),
        }
    }
}

/// Attributes every exchange is declared with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        ExchangeSettings {
            durable: true,
            auto_delete: false,
            arguments: Arguments::default(),
        }
    }
}

/// Unvalidated connection settings.
///
/// Required fields default to empty/zero so that omitting them is caught by
/// [`ConnectionConfig::new`]. Durations are expressed in milliseconds.
///
/// # Example
/// ```ignore
/// let settings = ConnectionSettings::from_json(r#"{
///     "host": "localhost", "port": 5672, "username": "guest", "password": "guest",
///     "virtual_host": "/", "connection_timeout_ms": 5000, "recovery_interval_ms": 5000,
///     "direct_channels": ["auth-server"], "channels": { "events": "events-exchange" }
/// }"#)?;
/// let config = ConnectionConfig::new(settings)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<Secret>,
    pub virtual_host: String,
    pub connection_timeout_ms: u64,
    pub recovery_interval_ms: u64,
    pub automatic_recovery: bool,
    pub tls: TlsSettings,
    /// Identity used as connection name and as prefix of subscription queues.
    /// A random one is generated when absent.
    pub consumer_name: Option<String>,
    /// Exchange channels: logical channel name to exchange name.
    pub channels: BTreeMap<String, String>,
    /// Direct channels: the logical name is also the queue name.
    pub direct_channels: BTreeSet<String>,
    pub auto_subscribe: bool,
    pub queue: QueueSettings,
    pub exchange: ExchangeSettings,
}

impl ConnectionSettings {
    /// Parses settings from a JSON document.
    pub fn from_json(raw: &str) -> Result<ConnectionSettings, AmqpError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to parse connection settings");
            AmqpError::ConfigError(format!("settings ({err})"))
        })
    }
}

/// TLS protocol versions the bridge accepts as pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocol {
    /// Let the transport negotiate the highest common version.
    Tls,
    TlsV12,
    TlsV13,
}

impl TlsProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsProtocol::Tls => "TLS",
            TlsProtocol::TlsV12 => "TLSv1.2",
            TlsProtocol::TlsV13 => "TLSv1.3",
        }
    }

    fn parse(raw: &str) -> Option<TlsProtocol> {
        match raw {
            "TLS" => Some(TlsProtocol::Tls),
            "TLSv1.2" => Some(TlsProtocol::TlsV12),
            "TLSv1.3" => Some(TlsProtocol::TlsV13),
            _ => None,
        }
    }
}

/// Validated TLS configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    enabled: bool,
    protocol: TlsProtocol,
    trust_store: Option<PathBuf>,
    trust_store_password: Option<Secret>,
    key_store: Option<PathBuf>,
    key_store_password: Option<Secret>,
    validate_server_certificate: bool,
}

impl TlsConfig {
    fn new(settings: TlsSettings) -> Result<TlsConfig, AmqpError> {
        let protocol = TlsProtocol::parse(&settings.protocol)
            .ok_or_else(|| AmqpError::ConfigError("tls.protocol".to_owned()))?;

        if settings.enabled
            && settings.key_store.is_some()
            && settings.key_store_password.is_none()
        {
            return Err(AmqpError::ConfigError("tls.key_store_password".to_owned()));
        }

        Ok(TlsConfig {
            enabled: settings.enabled,
            protocol,
            trust_store: settings.trust_store,
            trust_store_password: settings.trust_store_password,
            key_store: settings.key_store,
            key_store_password: settings.key_store_password,
            validate_server_certificate: settings.validate_server_certificate,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn protocol(&self) -> TlsProtocol {
        self.protocol
    }

    pub fn trust_store(&self) -> Option<&Path> {
        self.trust_store.as_deref()
    }

    pub fn trust_store_password(&self) -> Option<&Secret> {
        self.trust_store_password.as_ref()
    }

    pub fn key_store(&self) -> Option<&Path> {
        self.key_store.as_deref()
    }

    pub fn key_store_password(&self) -> Option<&Secret> {
        self.key_store_password.as_ref()
    }

    pub fn validate_server_certificate(&self) -> bool {
        self.validate_server_certificate
    }
}

/// Immutable, validated description of a broker connection and its routing table.
///
/// Build one with [`ConnectionConfig::new`]; changing anything means building a
/// new instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    username: String,
    password: Secret,
    virtual_host: String,
    connection_timeout: Duration,
    recovery_interval: Duration,
    automatic_recovery: bool,
    tls: TlsConfig,
    consumer_name: String,
    routes: BTreeMap<String, RoutingTarget>,
    auto_subscribe: bool,
    queue: QueueSettings,
    exchange: ExchangeSettings,
}

impl ConnectionConfig {
    /// Validates the settings and builds the configuration.
    ///
    /// Host, port, username, password, virtual host, connection timeout and
    /// recovery interval are required and checked in that order. TLS settings
    /// and the routing table are validated next, and a random consumer name is
    /// generated when none is configured.
    ///
    /// # Parameters
    /// * `settings` - Raw settings, usually parsed with [`ConnectionSettings::from_json`].
    ///
    /// # Returns
    /// * `Result<ConnectionConfig, AmqpError>` - The immutable configuration, or
    ///   [`AmqpError::ConfigError`] naming the first missing or invalid field.
    ///
    /// # Example
    /// ```ignore
    /// let config = ConnectionConfig::new(ConnectionSettings::from_json(&raw)?)?;
    /// ```
    pub fn new(settings: ConnectionSettings) -> Result<ConnectionConfig, AmqpError> {
        required(!settings.host.is_empty(), "host")?;
        required(settings.port > 0, "port")?;
        required(!settings.username.is_empty(), "username")?;
        let password = settings
            .password
            .ok_or_else(|| AmqpError::ConfigError("password".to_owned()))?;
        required(!settings.virtual_host.is_empty(), "virtual_host")?;
        required(settings.connection_timeout_ms > 0, "connection_timeout")?;
        required(settings.recovery_interval_ms > 0, "recovery_interval")?;

        let tls = TlsConfig::new(settings.tls)?;
        let routes = routing_table(settings.channels, settings.direct_channels)?;

        let consumer_name = match settings.consumer_name {
            Some(name) if !name.is_empty() => name,
            _ => {
                let generated = Uuid::new_v4().to_string();
                debug!(consumer = generated, "no consumer name configured, generated one");
                generated
            }
        };

        Ok(ConnectionConfig {
            host: settings.host,
            port: settings.port,
            username: settings.username,
            password,
            virtual_host: settings.virtual_host,
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            recovery_interval: Duration::from_millis(settings.recovery_interval_ms),
            automatic_recovery: settings.automatic_recovery,
            tls,
            consumer_name,
            routes,
            auto_subscribe: settings.auto_subscribe,
            queue: settings.queue,
            exchange: settings.exchange,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &Secret {
        &self.password
    }

    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Constant delay between two recovery attempts.
    pub fn recovery_interval(&self) -> Duration {
        self.recovery_interval
    }

    pub fn automatic_recovery(&self) -> bool {
        self.automatic_recovery
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn auto_subscribe(&self) -> bool {
        self.auto_subscribe
    }

    /// Looks up the routing target of a logical channel.
    pub fn route(&self, channel: &str) -> Option<RoutingTarget> {
        self.routes.get(channel).cloned()
    }

    /// Full routing table.
    pub fn routes(&self) -> BTreeMap<String, RoutingTarget> {
        self.routes.clone()
    }

    /// Exchange channels as a channel name to exchange name map.
    pub fn channels(&self) -> BTreeMap<String, String> {
        self.routes
            .iter()
            .filter_map(|(name, target)| match target {
                RoutingTarget::FanoutExchange(exchange) => Some((name.clone(), exchange.clone())),
                RoutingTarget::DirectQueue(_) => None,
            })
            .collect()
    }

    pub fn direct_channels(&self) -> BTreeSet<String> {
        self.routes
            .iter()
            .filter(|(_, target)| matches!(target, RoutingTarget::DirectQueue(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn queue_durable(&self) -> bool {
        self.queue.durable
    }

    pub fn queue_exclusive(&self) -> bool {
        self.queue.exclusive
    }

    pub fn queue_auto_delete(&self) -> bool {
        self.queue.auto_delete
    }

    pub fn queue_arguments(&self) -> Arguments {
        self.queue.arguments.clone()
    }

    pub fn exchange_durable(&self) -> bool {
        self.exchange.durable
    }

    pub fn exchange_auto_delete(&self) -> bool {
        self.exchange.auto_delete
    }

    pub fn exchange_arguments(&self) -> Arguments {
        self.exchange.arguments.clone()
    }
}

fn required(present: bool, field: &str) -> Result<(), AmqpError> {
    if present {
        return Ok(());
    }

    error!(field, "invalid connection configuration");
    Err(AmqpError::ConfigError(field.to_owned()))
}

fn routing_table(
    channels: BTreeMap<String, String>,
    direct_channels: BTreeSet<String>,
) -> Result<BTreeMap<String, RoutingTarget>, AmqpError> {
    let mut routes = BTreeMap::new();

    for queue in direct_channels {
        required(!queue.is_empty(), "direct_channels")?;
        routes.insert(queue.clone(), RoutingTarget::DirectQueue(queue));
    }

    for (channel, exchange) in channels {
        required(!channel.is_empty(), "channels")?;
        required(!exchange.is_empty(), &format!("channels.{channel}"))?;
        if routes.contains_key(&channel) {
            error!(channel, "channel registered both as direct and exchange channel");
            return Err(AmqpError::ConfigError(format!("channels.{channel}")));
        }
        routes.insert(channel, RoutingTarget::FanoutExchange(exchange));
    }

    Ok(routes)
}

#[cfg(test)]
pub(crate) fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        host: "localhost".to_owned(),
        port: 5672,
        username: "guest".to_owned(),
        password: Some(Secret::new("guest")),
        virtual_host: "/".to_owned(),
        connection_timeout_ms: 1_000,
        recovery_interval_ms: 500,
        automatic_recovery: true,
        consumer_name: Some("lobby-1".to_owned()),
        channels: BTreeMap::from([("events".to_owned(), "events-exchange".to_owned())]),
        direct_channels: BTreeSet::from(["auth-server".to_owned()]),
        ..ConnectionSettings::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_every_required_field() {
        let config = ConnectionConfig::new(test_settings()).unwrap();

        assert_eq!(config.host(), "localhost");
        assert_eq!(config.port(), 5672);
        assert_eq!(config.password().expose(), "guest");
        assert_eq!(config.connection_timeout(), Duration::from_millis(1_000));
        assert_eq!(config.recovery_interval(), Duration::from_millis(500));
        assert_eq!(config.consumer_name(), "lobby-1");
    }

    #[test]
    fn names_the_missing_field() {
        let cases: Vec<(&str, fn(&mut ConnectionSettings))> = vec![
            ("host", |s| s.host.clear()),
            ("port", |s| s.port = 0),
            ("username", |s| s.username.clear()),
            ("password", |s| s.password = None),
            ("virtual_host", |s| s.virtual_host.clear()),
            ("connection_timeout", |s| s.connection_timeout_ms = 0),
            ("recovery_interval", |s| s.recovery_interval_ms = 0),
        ];

        for (field, break_it) in cases {
            let mut settings = test_settings();
            break_it(&mut settings);

            assert_eq!(
                ConnectionConfig::new(settings),
                Err(AmqpError::ConfigError(field.to_owned())),
                "field {field}"
            );
        }
    }

    #[test]
    fn empty_password_is_accepted() {
        let mut settings = test_settings();
        settings.password = Some(Secret::new(""));

        assert!(ConnectionConfig::new(settings).is_ok());
    }

    #[test]
    fn defaults_follow_broker_friendly_values() {
        let settings = ConnectionSettings::default();

        assert!(settings.queue.durable);
        assert!(!settings.queue.exclusive);
        assert!(!settings.queue.auto_delete);
        assert!(settings.exchange.durable);
        assert!(!settings.exchange.auto_delete);
        assert_eq!(settings.tls.protocol, "TLSv1.3");
        assert!(settings.tls.validate_server_certificate);
        assert!(ConnectionConfig::new(settings).is_err());
    }

    #[test]
    fn routing_table_holds_both_styles() {
        let config = ConnectionConfig::new(test_settings()).unwrap();

        assert_eq!(
            config.route("auth-server"),
            Some(RoutingTarget::DirectQueue("auth-server".to_owned()))
        );
        assert_eq!(
            config.route("events"),
            Some(RoutingTarget::FanoutExchange("events-exchange".to_owned()))
        );
        assert_eq!(config.route("nope"), None);
        assert_eq!(config.direct_channels().len(), 1);
        assert_eq!(config.channels().len(), 1);
    }

    #[test]
    fn rejects_a_channel_registered_twice() {
        let mut settings = test_settings();
        settings.direct_channels.insert("events".to_owned());

        assert_eq!(
            ConnectionConfig::new(settings),
            Err(AmqpError::ConfigError("channels.events".to_owned()))
        );
    }

    #[test]
    fn accessors_hand_out_copies() {
        let mut settings = test_settings();
        settings
            .queue
            .arguments
            .insert("x-message-ttl".to_owned(), serde_json::json!(5000));
        let config = ConnectionConfig::new(settings).unwrap();

        let mut args = config.queue_arguments();
        args.clear();
        let mut routes = config.routes();
        routes.clear();

        assert_eq!(config.queue_arguments().len(), 1);
        assert_eq!(config.routes().len(), 2);
    }

    #[test]
    fn generates_an_identity_when_absent() {
        let mut settings = test_settings();
        settings.consumer_name = None;

        let first = ConnectionConfig::new(settings.clone()).unwrap();
        let second = ConnectionConfig::new(settings).unwrap();

        assert!(!first.consumer_name().is_empty());
        assert_ne!(first.consumer_name(), second.consumer_name());
    }

    #[test]
    fn validates_tls_settings() {
        let mut settings = test_settings();
        settings.tls.protocol = "SSLv3".to_owned();
        assert_eq!(
            ConnectionConfig::new(settings),
            Err(AmqpError::ConfigError("tls.protocol".to_owned()))
        );

        let mut settings = test_settings();
        settings.tls.enabled = true;
        settings.tls.key_store = Some(PathBuf::from("/etc/client.p12"));
        assert_eq!(
            ConnectionConfig::new(settings),
            Err(AmqpError::ConfigError("tls.key_store_password".to_owned()))
        );
    }

    #[test]
    fn password_is_redacted() {
        let mut settings = test_settings();
        settings.password = Some(Secret::new("hunter2"));
        let config = ConnectionConfig::new(settings).unwrap();

        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn parses_json_settings() {
        let settings = ConnectionSettings::from_json(
            r#"{
                "host": "mq.internal",
                "port": 5671,
                "username": "svc",
                "password": "s3cret",
                "virtual_host": "game",
                "connection_timeout_ms": 5000,
                "recovery_interval_ms": 2000,
                "automatic_recovery": true,
                "direct_channels": ["auth-server"],
                "channels": { "events": "events-exchange" },
                "queue": { "arguments": { "x-max-length": 1000 } }
            }"#,
        )
        .unwrap();

        let config = ConnectionConfig::new(settings).unwrap();
        assert_eq!(config.host(), "mq.internal");
        assert!(config.queue_durable());
        assert_eq!(config.queue_arguments()["x-max-length"], 1000);
        assert!(ConnectionSettings::from_json("{ not json").is_err());
    }
}
