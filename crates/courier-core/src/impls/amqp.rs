//! AmqpLink - the broker link on top of `lapin`.
//!
//! # Topology
//! Declared once by [`AmqpLink::connect`], in this order:
//! 1. dead-letter exchange, its queue and binding (when `deadexchange.name` is set)
//! 2. the work exchange, the work queue and its binding (when `exchange.name` is set)
//!
//! An empty exchange name means the default exchange, which needs no
//! declaration.
//!
//! # Channels
//! Deliveries come in on one channel. Republishing uses a second one in
//! confirm mode, so a slow publish never blocks acknowledgments and every
//! publish returns only after the broker acked it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Settings;
use crate::domain::{Delivery, HeaderValue, Headers, Publication};
use crate::error::BrokerError;
use crate::ports::{DeliveryLease, DeliverySource, Publisher};

/// An open connection with the topology declared and QoS set.
pub struct AmqpLink {
    connection: Connection,
    channel: Channel,
    queue: String,
}

impl AmqpLink {
    pub async fn connect(settings: &Settings) -> Result<Self, BrokerError> {
        info!(host = %settings.rabbitmq.host, vhost = %settings.rabbitmq.vhost, "connecting to broker");
        let connection = Connection::connect(&settings.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to open a channel: {e}")))?;

        info!(count = settings.prefetch.count, global = settings.prefetch.global, "setting QoS");
        channel
            .basic_qos(
                settings.prefetch.count,
                BasicQosOptions {
                    global: settings.prefetch.global,
                },
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to set QoS: {e}")))?;

        declare_topology(&channel, settings).await?;

        Ok(Self {
            connection,
            channel,
            queue: settings.queue.name.clone(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Register a manual-ack consumer on the work queue.
    pub async fn subscribe(&self) -> Result<AmqpSubscription, BrokerError> {
        info!(queue = %self.queue, "registering consumer");
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to register a consumer: {e}")))?;
        Ok(AmqpSubscription { consumer })
    }

    /// A publisher on its own channel, for republishing retries. The channel
    /// is in confirm mode.
    pub async fn publisher(&self) -> Result<AmqpPublisher, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to open publish channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to enable publisher confirms: {e}")))?;
        Ok(AmqpPublisher {
            channel: Mutex::new(channel),
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "worker stopped").await {
            error!(error = %e, "failed closing broker connection");
        }
    }
}

async fn declare_topology(channel: &Channel, settings: &Settings) -> Result<(), BrokerError> {
    let topology = |e: lapin::Error| BrokerError::Topology(e.to_string());
    let mut queue_args = FieldTable::default();

    let dlx = &settings.deadexchange;
    if !dlx.name.is_empty() {
        info!(exchange = %dlx.name, "declaring dead-letter exchange");
        channel
            .exchange_declare(
                &dlx.name,
                exchange_kind(&dlx.kind),
                ExchangeDeclareOptions {
                    durable: dlx.durable,
                    auto_delete: dlx.autodelete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(topology)?;

        info!(queue = %dlx.queue, "declaring error queue");
        channel
            .queue_declare(
                &dlx.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(topology)?;

        info!(queue = %dlx.queue, exchange = %dlx.name, "binding error queue to dead-letter exchange");
        channel
            .queue_bind(&dlx.queue, &dlx.name, "", QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(topology)?;

        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.name.as_str().into()),
        );
    }
    if settings.queue.max_length > 0 {
        queue_args.insert(
            "x-max-length".into(),
            AMQPValue::LongUInt(settings.queue.max_length),
        );
    }

    let exchange = &settings.exchange;
    if exchange.name.is_empty() {
        return Ok(());
    }

    info!(exchange = %exchange.name, "declaring exchange");
    channel
        .exchange_declare(
            &exchange.name,
            exchange_kind(&exchange.kind),
            ExchangeDeclareOptions {
                durable: exchange.durable,
                auto_delete: exchange.autodelete,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(topology)?;

    let queue = &settings.queue;
    info!(queue = %queue.name, args = ?queue_args, "declaring queue");
    channel
        .queue_declare(
            &queue.name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            queue_args.clone(),
        )
        .await
        .map_err(topology)?;

    info!(queue = %queue.name, exchange = %exchange.name, key = %queue.key, "binding queue");
    channel
        .queue_bind(
            &queue.name,
            &exchange.name,
            &queue.key,
            QueueBindOptions::default(),
            queue_args,
        )
        .await
        .map_err(topology)?;
    Ok(())
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "" | "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

pub struct AmqpSubscription {
    consumer: Consumer,
}

#[async_trait]
impl DeliverySource for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Box<dyn DeliveryLease>> {
        match self.consumer.next().await? {
            Ok(raw) => {
                let props = &raw.properties;
                let delivery = Delivery {
                    tag: raw.delivery_tag,
                    body: raw.data,
                    headers: props.headers().as_ref().map(headers_from_table).unwrap_or_default(),
                    content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
                    content_encoding: props.content_encoding().as_ref().map(|s| s.as_str().to_string()),
                };
                Some(Box::new(AmqpLease {
                    delivery,
                    acker: raw.acker,
                }))
            }
            Err(e) => {
                error!(error = %e, "consumer stream failed");
                None
            }
        }
    }
}

struct AmqpLease {
    delivery: Delivery,
    acker: Acker,
}

#[async_trait]
impl DeliveryLease for AmqpLease {
    fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge {
                tag: self.delivery.tag,
                reason: e.to_string(),
            })
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Acknowledge {
                tag: self.delivery.tag,
                reason: e.to_string(),
            })
    }
}

/// Publishes to the default exchange, routed by queue name.
pub struct AmqpPublisher {
    channel: Mutex<Channel>,
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, queue: &str, publication: Publication) -> Result<(), BrokerError> {
        let publish_err = |e: lapin::Error| BrokerError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let mut props = BasicProperties::default()
            .with_timestamp(publication.timestamp.timestamp().max(0) as u64)
            .with_headers(table_from_headers(&publication.headers));
        if let Some(ct) = publication.content_type {
            props = props.with_content_type(ct.into());
        }
        if let Some(ce) = publication.content_encoding {
            props = props.with_content_encoding(ce.into());
        }

        let channel = self.channel.lock().await;
        let confirmation = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &publication.body,
                props,
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;
        check_confirmation(queue, confirmation)
    }
}

fn check_confirmation(queue: &str, confirmation: Confirmation) -> Result<(), BrokerError> {
    let reason = match confirmation {
        Confirmation::Ack(_) => return Ok(()),
        Confirmation::Nack(_) => "broker nacked the message",
        Confirmation::NotRequested => "channel is not in confirm mode",
    };
    Err(BrokerError::Publish {
        queue: queue.to_string(),
        reason: reason.to_string(),
    })
}

fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), header_from_amqp(v)))
        .collect()
}

fn header_from_amqp(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(b) => HeaderValue::Boolean(*b),
        AMQPValue::ShortShortInt(n) => HeaderValue::Integer(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => HeaderValue::Integer(i64::from(*n)),
        AMQPValue::ShortInt(n) => HeaderValue::Integer(i64::from(*n)),
        AMQPValue::ShortUInt(n) => HeaderValue::Integer(i64::from(*n)),
        AMQPValue::LongInt(n) => HeaderValue::Integer(i64::from(*n)),
        AMQPValue::LongUInt(n) => HeaderValue::Integer(i64::from(*n)),
        AMQPValue::LongLongInt(n) => HeaderValue::Integer(*n),
        AMQPValue::Float(f) => HeaderValue::Float(f64::from(*f)),
        AMQPValue::Double(f) => HeaderValue::Float(*f),
        AMQPValue::DecimalValue(d) => {
            HeaderValue::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
        }
        AMQPValue::ShortString(s) => HeaderValue::Text(s.as_str().to_string()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => HeaderValue::Text(text.to_string()),
            Err(_) => HeaderValue::Bytes(s.as_bytes().to_vec()),
        },
        AMQPValue::FieldArray(items) => {
            HeaderValue::List(items.as_slice().iter().map(header_from_amqp).collect())
        }
        AMQPValue::Timestamp(t) => HeaderValue::Timestamp(*t),
        AMQPValue::FieldTable(t) => HeaderValue::Table(headers_from_table(t)),
        AMQPValue::ByteArray(b) => HeaderValue::Bytes(b.as_slice().to_vec()),
        AMQPValue::Void => HeaderValue::Void,
    }
}

fn table_from_headers(headers: &Headers) -> FieldTable {
    let inner: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(k, v)| (ShortString::from(k.as_str()), amqp_from_header(v)))
        .collect();
    FieldTable::from(inner)
}

fn amqp_from_header(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Text(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        HeaderValue::Integer(n) => AMQPValue::LongLongInt(*n),
        HeaderValue::Float(f) => AMQPValue::Double(*f),
        HeaderValue::Boolean(b) => AMQPValue::Boolean(*b),
        HeaderValue::Bytes(b) => AMQPValue::ByteArray(b.clone().into()),
        HeaderValue::Timestamp(t) => AMQPValue::Timestamp(*t),
        HeaderValue::List(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(amqp_from_header).collect::<Vec<_>>(),
        )),
        HeaderValue::Table(t) => AMQPValue::FieldTable(table_from_headers(t)),
        HeaderValue::Void => AMQPValue::Void,
    }
}
