//! Declarative queue topology.
//!
//! One direct exchange fans tasks out to per-kind primary queues; every
//! primary queue dead-letters into its own DLX/DLQ pair. The structure is
//! data: brokers reconcile it idempotently on startup and on demand.

use serde::{Deserialize, Serialize};

use crate::job::JobKind;
use crate::routing::{
    dlq_name, dlx_name, queue_name, routing_key, RoutingTable, DEAD_LETTER_ROUTING_KEY,
    JOBS_EXCHANGE,
};

/// Queue argument value, kept narrow so every broker can map it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgValue {
    Str(String),
    Int(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub args: Vec<(String, ArgValue)>,
}

impl QueueSpec {
    pub fn arg(&self, key: &str) -> Option<&ArgValue> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Tunables applied uniformly across the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub max_message_bytes: i64,
    pub max_priority: i64,
    pub dlq_ttl_ms: i64,
    pub dlq_max_len: i64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 10 * 1024 * 1024,
            max_priority: 10,
            dlq_ttl_ms: 86_400_000,
            dlq_max_len: 10_000,
        }
    }
}

/// The full declared topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// Build the standard per-kind topology from the routing table.
    pub fn standard(routing: &RoutingTable, config: &TopologyConfig) -> Self {
        let mut exchanges = vec![ExchangeSpec {
            name: JOBS_EXCHANGE.to_string(),
            kind: ExchangeKind::Direct,
            durable: true,
        }];
        let mut queues = Vec::new();
        let mut bindings = Vec::new();

        for kind in JobKind::ALL {
            let policy = routing.policy(kind);

            exchanges.push(ExchangeSpec {
                name: dlx_name(kind),
                kind: ExchangeKind::Direct,
                durable: true,
            });

            queues.push(QueueSpec {
                name: queue_name(kind),
                durable: true,
                args: vec![
                    (
                        "x-dead-letter-exchange".to_string(),
                        ArgValue::Str(dlx_name(kind)),
                    ),
                    (
                        "x-dead-letter-routing-key".to_string(),
                        ArgValue::Str(DEAD_LETTER_ROUTING_KEY.to_string()),
                    ),
                    (
                        "x-max-length-bytes".to_string(),
                        ArgValue::Int(config.max_message_bytes),
                    ),
                    (
                        "x-message-ttl".to_string(),
                        ArgValue::Int(policy.message_ttl_ms as i64),
                    ),
                    ("x-max-priority".to_string(), ArgValue::Int(config.max_priority)),
                ],
            });

            queues.push(QueueSpec {
                name: dlq_name(kind),
                durable: true,
                args: vec![
                    ("x-message-ttl".to_string(), ArgValue::Int(config.dlq_ttl_ms)),
                    ("x-max-length".to_string(), ArgValue::Int(config.dlq_max_len)),
                    (
                        "x-queue-mode".to_string(),
                        ArgValue::Str("lazy".to_string()),
                    ),
                ],
            });

            bindings.push(BindingSpec {
                exchange: JOBS_EXCHANGE.to_string(),
                queue: queue_name(kind),
                routing_key: routing_key(kind),
            });
            bindings.push(BindingSpec {
                exchange: dlx_name(kind),
                queue: dlq_name(kind),
                routing_key: DEAD_LETTER_ROUTING_KEY.to_string(),
            });
        }

        Self {
            exchanges,
            queues,
            bindings,
        }
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> Topology {
        Topology::standard(&RoutingTable::standard(), &TopologyConfig::default())
    }

    #[test]
    fn one_primary_and_one_dlq_per_kind() {
        let topology = standard();
        assert_eq!(topology.queues.len(), JobKind::ALL.len() * 2);
        assert_eq!(topology.exchanges.len(), 1 + JobKind::ALL.len());
        for kind in JobKind::ALL {
            assert!(topology.queue(&queue_name(kind)).is_some());
            assert!(topology.queue(&dlq_name(kind)).is_some());
        }
    }

    #[test]
    fn primary_queue_carries_the_full_argument_set() {
        let topology = standard();
        let queue = topology.queue("q.model").unwrap();
        assert_eq!(
            queue.arg("x-dead-letter-exchange"),
            Some(&ArgValue::Str("q.model.dlx".to_string()))
        );
        assert_eq!(
            queue.arg("x-dead-letter-routing-key"),
            Some(&ArgValue::Str("#".to_string()))
        );
        assert_eq!(
            queue.arg("x-max-length-bytes"),
            Some(&ArgValue::Int(10 * 1024 * 1024))
        );
        assert_eq!(queue.arg("x-message-ttl"), Some(&ArgValue::Int(3_600_000)));
        assert_eq!(queue.arg("x-max-priority"), Some(&ArgValue::Int(10)));
    }

    #[test]
    fn dlq_is_lazy_and_bounded() {
        let topology = standard();
        let dlq = topology.queue("q.report.dlq").unwrap();
        assert_eq!(
            dlq.arg("x-queue-mode"),
            Some(&ArgValue::Str("lazy".to_string()))
        );
        assert_eq!(dlq.arg("x-max-length"), Some(&ArgValue::Int(10_000)));
        assert_eq!(dlq.arg("x-message-ttl"), Some(&ArgValue::Int(86_400_000)));
    }

    #[test]
    fn bindings_connect_exchange_to_queue_and_dlx_to_dlq() {
        let topology = standard();
        assert!(topology.bindings.iter().any(|b| {
            b.exchange == "jobs.direct" && b.queue == "q.cam" && b.routing_key == "jobs.cam"
        }));
        assert!(topology.bindings.iter().any(|b| {
            b.exchange == "q.cam.dlx" && b.queue == "q.cam.dlq" && b.routing_key == "#"
        }));
    }
}
