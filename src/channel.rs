// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module is the lapin-backed implementation of the transport traits. It
//! establishes connections to the RabbitMQ server and creates communication
//! channels in publisher-confirm mode so that a publish resolves once the broker
//! acknowledged the message. With TLS enabled the socket is wrapped by a rustls
//! connector built in [`crate::tls`] before lapin takes it over.

use crate::{
    config::{Arguments, ConnectionConfig},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    queue::{QueueBinding, QueueDefinition},
    tls,
    transport::{BrokerChannel, BrokerConnection, Connector, Link, OutgoingMessage},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::{AMQPScheme, AMQPUri},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tcp_stream::{HandshakeError, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> LapinConnector {
        LapinConnector
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, cfg: &ConnectionConfig) -> Result<Link, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.consumer_name().to_owned()));
        let uri = amqp_uri(cfg);

        let conn = if cfg.tls().enabled() {
            let connector = tls::rustls_connector(cfg.tls()).await?;
            Connection::connector(
                uri,
                Box::new(move |uri: &AMQPUri| {
                    let addr = (uri.authority.host.as_str(), uri.authority.port);
                    let stream = TcpStream::connect(addr).map_err(HandshakeError::Failure)?;
                    stream.into_rustls(&connector, &uri.authority.host)
                }),
                options,
            )
            .await
        } else {
            Connection::connect_uri(uri, options).await
        };

        let conn = match conn {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        let (notify, lost) = mpsc::unbounded_channel();
        conn.on_error(move |err| {
            // the receiver is gone once the supervisor dropped the session
            let _ = notify.send(err.to_string());
        });
        debug!("amqp connected");

        Ok(Link {
            connection: Arc::new(LapinConnection { conn }),
            lost,
        })
    }
}

/// Builds the broker URI. Going through `AMQPUri` avoids escaping credentials
/// and virtual host by hand.
fn amqp_uri(cfg: &ConnectionConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();

    uri.scheme = if cfg.tls().enabled() {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };
    uri.authority.host = cfg.host().to_owned();
    uri.authority.port = cfg.port();
    uri.authority.userinfo.username = cfg.username().to_owned();
    uri.authority.userinfo.password = cfg.password().expose().to_owned();
    uri.vhost = cfg.virtual_host().to_owned();
    uri.query.connection_timeout = Some(cfg.connection_timeout().as_millis() as u64);

    uri
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }

        debug!("channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            warn!(error = err.to_string(), "error closing connection");
            AmqpError::CloseError
        })
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                field_table(&def.params),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                field_table(&def.params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "failure to declare exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(&self, msg: OutgoingMessage) -> Result<bool, AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_current_context(&mut headers);

        let confirm = match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(msg.content_type))
                    .with_message_id(ShortString::from(msg.message_id))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                warn!(exchange = msg.exchange, "broker refused the message");
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::PublishingError)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            warn!(error = err.to_string(), "error closing channel");
            AmqpError::CloseError
        })
    }
}

/// Converts configured arguments into an AMQP field table.
pub(crate) fn field_table(args: &Arguments) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = args
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();

    FieldTable::from(table)
}

fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;

    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => match i32::try_from(v) {
                Ok(v) => AMQPValue::LongInt(v),
                Err(_) => AMQPValue::LongLongInt(v),
            },
            (None, Some(v)) => AMQPValue::Double(v),
            (None, None) => AMQPValue::Void,
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        Value::Array(values) => {
            AMQPValue::FieldArray(FieldArray::from(values.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let table: BTreeMap<ShortString, AMQPValue> = map
                .iter()
                .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
                .collect();
            AMQPValue::FieldTable(FieldTable::from(table))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_settings, ConnectionConfig, Secret};
    use serde_json::json;

    #[test]
    fn uri_carries_endpoint_and_credentials() {
        let mut settings = test_settings();
        settings.password = Some(Secret::new("p@ss/word"));
        settings.virtual_host = "game/prod".to_owned();
        let uri = amqp_uri(&ConnectionConfig::new(settings).unwrap());

        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.password, "p@ss/word");
        assert_eq!(uri.vhost, "game/prod");
        assert_eq!(uri.query.connection_timeout, Some(1_000));
    }

    #[test]
    fn tls_switches_to_amqps() {
        let mut settings = test_settings();
        settings.tls.enabled = true;
        let uri = amqp_uri(&ConnectionConfig::new(settings).unwrap());

        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
    }

    #[test]
    fn arguments_map_to_amqp_values() {
        let args = Arguments::from([
            ("x-message-ttl".to_owned(), json!(5000)),
            ("x-big".to_owned(), json!(10_000_000_000_i64)),
            ("x-ratio".to_owned(), json!(0.5)),
            ("x-queue-mode".to_owned(), json!("lazy")),
            ("x-flag".to_owned(), json!(true)),
        ]);

        let table = field_table(&args);
        let inner = table.inner();

        assert_eq!(inner.get(&ShortString::from("x-message-ttl")), Some(&AMQPValue::LongInt(5000)));
        assert_eq!(
            inner.get(&ShortString::from("x-big")),
            Some(&AMQPValue::LongLongInt(10_000_000_000))
        );
        assert_eq!(inner.get(&ShortString::from("x-ratio")), Some(&AMQPValue::Double(0.5)));
        assert_eq!(
            inner.get(&ShortString::from("x-queue-mode")),
            Some(&AMQPValue::LongString("lazy".into()))
        );
        assert_eq!(inner.get(&ShortString::from("x-flag")), Some(&AMQPValue::Boolean(true)));
        assert!(field_table(&Arguments::default()).inner().is_empty());
    }
}
