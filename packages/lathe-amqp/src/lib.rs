//! RabbitMQ implementation of the lathe [`Broker`] contract.
//!
//! Publisher confirms are enabled on the shared publish channel; every
//! publish awaits its confirm and maps a nack, a basic.return or a confirm
//! timeout to a transient broker error, which is what the engine's retry
//! policy expects. Consumers get their own channel with the requested
//! prefetch.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lathe::broker::{AckHandle, Broker, Publication, PublishReceipt, TaskDelivery, TaskSource};
use lathe::topology::{ArgValue, ExchangeKind, Topology};
use lathe::EngineError;

/// Connection settings for the broker.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub uri: String,
    /// How long to wait for a publisher confirm before treating the publish
    /// as failed.
    pub confirm_timeout: Duration,
}

impl AmqpConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            confirm_timeout: Duration::from_secs(10),
        }
    }
}

/// Broker backed by one AMQP connection: a confirmed publish channel plus a
/// dedicated channel per subscription.
pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Mutex<Channel>,
    config: AmqpConfig,
}

impl AmqpBroker {
    pub async fn connect(config: AmqpConfig) -> Result<Self, EngineError> {
        let connection = Connection::connect(&config.uri, ConnectionProperties::default())
            .await
            .map_err(broker_err)?;
        let publish_channel = connection.create_channel().await.map_err(broker_err)?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_err)?;
        info!(uri = %config.uri, "amqp broker connected");
        Ok(Self {
            connection,
            publish_channel: Mutex::new(publish_channel),
            config,
        })
    }

    async fn ops_channel(&self) -> Result<Channel, EngineError> {
        self.connection.create_channel().await.map_err(broker_err)
    }
}

fn broker_err(err: lapin::Error) -> EngineError {
    EngineError::Transient {
        subsystem: lathe::Subsystem::Broker,
        message: err.to_string(),
    }
}

fn field_table(args: &[(String, ArgValue)]) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        let amqp_value = match value {
            ArgValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
            ArgValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        table.insert(ShortString::from(key.as_str()), amqp_value);
    }
    table
}

fn headers_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    table
}

fn headers_from_properties(properties: &BasicProperties) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(s.as_bytes()).into_owned(),
                );
            }
        }
    }
    headers
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl AckHandle for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), EngineError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(broker_err)
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), EngineError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(broker_err)
    }
}

fn delivery_into_task(delivery: lapin::message::Delivery) -> TaskDelivery {
    let headers = headers_from_properties(&delivery.properties);
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    TaskDelivery {
        payload: delivery.data,
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers,
        message_id,
        acker: Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

struct AmqpTaskSource {
    consumer: lapin::Consumer,
    // Held so the channel (and its prefetch window) lives with the source.
    _channel: Channel,
}

#[async_trait]
impl TaskSource for AmqpTaskSource {
    async fn next(&mut self) -> Result<Option<TaskDelivery>, EngineError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(delivery_into_task(delivery))),
            Some(Err(err)) => Err(broker_err(err)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), EngineError> {
        let channel = self.ops_channel().await?;

        for exchange in &topology.exchanges {
            let kind = match exchange.kind {
                ExchangeKind::Direct => lapin::ExchangeKind::Direct,
                ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            };
            channel
                .exchange_declare(
                    &exchange.name,
                    kind,
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(broker_err)?;
        }

        for queue in &topology.queues {
            channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        ..Default::default()
                    },
                    field_table(&queue.args),
                )
                .await
                .map_err(broker_err)?;
        }

        for binding in &topology.bindings {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker_err)?;
        }

        debug!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "topology declared"
        );
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<PublishReceipt, EngineError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(if publication.persistent { 2 } else { 1 })
            .with_priority(publication.priority)
            .with_message_id(ShortString::from(publication.message_id.as_str()))
            .with_headers(headers_table(&publication.headers));

        let channel = self.publish_channel.lock().await;
        let confirm = channel
            .basic_publish(
                &publication.exchange,
                &publication.routing_key,
                BasicPublishOptions {
                    mandatory: publication.mandatory,
                    ..Default::default()
                },
                &publication.payload,
                properties,
            )
            .await
            .map_err(broker_err)?;
        drop(channel);

        let confirmation = tokio::time::timeout(self.config.confirm_timeout, confirm)
            .await
            .map_err(|_| EngineError::broker("publisher confirm timed out"))?
            .map_err(broker_err)?;

        match confirmation {
            Confirmation::Ack(None) => Ok(PublishReceipt {
                task_id: publication.message_id,
            }),
            Confirmation::Ack(Some(_returned)) => {
                warn!(
                    routing_key = %publication.routing_key,
                    "mandatory publish was returned unroutable"
                );
                Err(EngineError::broker(format!(
                    "unroutable message for key {}",
                    publication.routing_key
                )))
            }
            Confirmation::Nack(_) => Err(EngineError::broker("publish nacked by broker")),
            Confirmation::NotRequested => Ok(PublishReceipt {
                task_id: publication.message_id,
            }),
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn TaskSource>, EngineError> {
        let channel = self.ops_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(broker_err)?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("lathe-{}", lathe::ids::new_trace_id()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        Ok(Box::new(AmqpTaskSource {
            consumer,
            _channel: channel,
        }))
    }

    async fn get(&self, queue: &str) -> Result<Option<TaskDelivery>, EngineError> {
        let channel = self.ops_channel().await?;
        let message = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(broker_err)?;
        Ok(message.map(|m| delivery_into_task(m.delivery)))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, EngineError> {
        let channel = self.ops_channel().await?;
        let queue = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        Ok(queue.message_count() as u64)
    }

    async fn purge(&self, queue: &str) -> Result<u64, EngineError> {
        let channel = self.ops_channel().await?;
        let purged = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(broker_err)?;
        Ok(purged as u64)
    }
}
