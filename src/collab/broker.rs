//! Message broker: queues, exchanges, publishing and acknowledged
//! consumption.
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CollabError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Every bound queue gets every message.
    Fanout,
    /// Bound queues get the messages whose routing key is their name.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fanout => f.write_str("fanout"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fanout" => Ok(Self::Fanout),
            "direct" => Ok(Self::Direct),
            _ => Err(CollabError::InvalidExchangeKind(s.to_string())),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Value,
    /// Set when the message was delivered before without being acknowledged.
    pub redelivered: bool,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CollabError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Collects acknowledgements during a [`MessageBroker::consume`] call.
#[derive(Debug, Default)]
pub struct Acknowledger {
    acked: HashSet<u64>,
}

impl Acknowledger {
    pub fn ack(&mut self, delivery_tag: u64) {
        self.acked.insert(delivery_tag);
    }
}

pub trait MessageBroker {
    /// Create the queue if it does not exist.
    fn declare_queue(&self, name: &str) -> Result<(), CollabError>;
    /// Create the exchange if it does not exist. Declaring an existing
    /// exchange with another kind fails.
    fn declare_exchange(&self, name: &str, durable: bool, kind: ExchangeKind)
        -> Result<(), CollabError>;
    fn bind(&self, exchange: &str, queue: &str) -> Result<(), CollabError>;
    /// Route a message through an exchange. The empty exchange name routes
    /// straight to the queue named by `routing_key`.
    fn publish(&self, exchange: &str, routing_key: &str, body: Value) -> Result<(), CollabError>;
    /// Deliver the messages waiting in `queue` to `callback`, returning how
    /// many were delivered. Unless `auto_ack` is set, messages the callback
    /// does not acknowledge go back to the queue.
    fn consume(
        &self,
        queue: &str,
        callback: &mut dyn FnMut(&Delivery, &mut Acknowledger),
        auto_ack: bool,
    ) -> Result<usize, CollabError>;
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Delivery>>,
    exchanges: HashMap<String, Exchange>,
    next_tag: u64,
}

/// A broker living in process memory.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting in a queue.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(VecDeque::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MessageBroker for MemoryBroker {
    fn declare_queue(&self, name: &str) -> Result<(), CollabError> {
        self.lock().queues.entry(name.to_string()).or_default();
        Ok(())
    }

    fn declare_exchange(
        &self,
        name: &str,
        durable: bool,
        kind: ExchangeKind,
    ) -> Result<(), CollabError> {
        let mut state = self.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(CollabError::ExchangeMismatch {
                name: name.to_string(),
                existing: existing.kind,
            }),
            Some(_) => Ok(()),
            None => {
                debug!("declared {} exchange {} (durable: {})", kind, name, durable);
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&self, exchange: &str, queue: &str) -> Result<(), CollabError> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(CollabError::UnknownQueue(queue.to_string()));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| CollabError::UnknownExchange(exchange.to_string()))?;
        if !exchange.bindings.iter().any(|bound| bound == queue) {
            exchange.bindings.push(queue.to_string());
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: Value) -> Result<(), CollabError> {
        let mut state = self.lock();
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let ex = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| CollabError::UnknownExchange(exchange.to_string()))?;
            match ex.kind {
                ExchangeKind::Fanout => ex.bindings.clone(),
                ExchangeKind::Direct => ex
                    .bindings
                    .iter()
                    .filter(|queue| *queue == routing_key)
                    .cloned()
                    .collect(),
            }
        };
        for target in targets {
            state.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered: false,
            };
            match state.queues.get_mut(&target) {
                Some(queue) => queue.push_back(delivery),
                // Unroutable messages are dropped.
                None => trace!("no queue {} for message on {:?}", target, exchange),
            }
        }
        Ok(())
    }

    fn consume(
        &self,
        queue: &str,
        callback: &mut dyn FnMut(&Delivery, &mut Acknowledger),
        auto_ack: bool,
    ) -> Result<usize, CollabError> {
        let pending: Vec<Delivery> = {
            let mut state = self.lock();
            let messages = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| CollabError::UnknownQueue(queue.to_string()))?;
            messages.drain(..).collect()
        };
        let mut acks = Acknowledger::default();
        for delivery in &pending {
            callback(delivery, &mut acks);
        }
        let delivered = pending.len();
        if !auto_ack {
            let mut unacked: Vec<Delivery> = pending
                .into_iter()
                .filter(|delivery| !acks.acked.contains(&delivery.delivery_tag))
                .collect();
            if !unacked.is_empty() {
                debug!("requeueing {} unacknowledged messages on {}", unacked.len(), queue);
                let mut state = self.lock();
                let messages = state.queues.entry(queue.to_string()).or_default();
                for delivery in unacked.iter_mut().rev() {
                    delivery.redelivered = true;
                    messages.push_front(delivery.clone());
                }
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn fanout_broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        for queue in ["abc1", "abc2", "abc3"] {
            broker.declare_queue(queue).unwrap();
        }
        broker.declare_exchange("orders", true, ExchangeKind::Fanout).unwrap();
        broker.bind("orders", "abc1").unwrap();
        broker.bind("orders", "abc3").unwrap();
        broker
    }

    #[test]
    fn test_fanout_reaches_bound_queues() {
        let broker = fanout_broker();
        for i in 0..3 {
            broker.publish("orders", "", json!({ "OrderId": format!("1000{}", i) })).unwrap();
        }
        assert_eq!(broker.queue_len("abc1"), Some(3));
        assert_eq!(broker.queue_len("abc2"), Some(0));
        assert_eq!(broker.queue_len("abc3"), Some(3));
    }

    #[test]
    fn test_direct_routes_by_key() {
        let broker = MemoryBroker::new();
        broker.declare_queue("a").unwrap();
        broker.declare_queue("b").unwrap();
        broker.declare_exchange("direct", false, ExchangeKind::Direct).unwrap();
        broker.bind("direct", "a").unwrap();
        broker.bind("direct", "b").unwrap();
        broker.publish("direct", "b", json!(1)).unwrap();
        broker.publish("", "a", json!(2)).unwrap();
        assert_eq!(broker.queue_len("a"), Some(1));
        assert_eq!(broker.queue_len("b"), Some(1));
    }

    #[test]
    fn test_unacked_messages_are_requeued() {
        let broker = fanout_broker();
        broker.publish("orders", "", json!({"OrderId": "1"})).unwrap();
        broker.publish("orders", "", json!({"OrderId": "2"})).unwrap();

        let mut seen = vec![];
        let delivered = broker
            .consume(
                "abc1",
                &mut |delivery, acks| {
                    let order: HashMap<String, String> = delivery.decode().unwrap();
                    if order["OrderId"] == "1" {
                        acks.ack(delivery.delivery_tag);
                    }
                    seen.push(delivery.redelivered);
                },
                false,
            )
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(seen, vec![false, false]);
        assert_eq!(broker.queue_len("abc1"), Some(1));

        let mut redelivered = vec![];
        broker
            .consume("abc1", &mut |delivery, _| redelivered.push(delivery.clone()), true)
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert!(redelivered[0].redelivered);
        assert_eq!(redelivered[0].body, json!({"OrderId": "2"}));
        assert_eq!(broker.queue_len("abc1"), Some(0));
    }

    #[test]
    fn test_errors() {
        let broker = fanout_broker();
        assert!(matches!(
            broker.declare_exchange("orders", true, ExchangeKind::Direct),
            Err(CollabError::ExchangeMismatch { .. })
        ));
        assert!(matches!(broker.bind("nope", "abc1"), Err(CollabError::UnknownExchange(_))));
        assert!(matches!(broker.bind("orders", "nope"), Err(CollabError::UnknownQueue(_))));
        assert!(matches!(
            broker.consume("nope", &mut |_, _| (), true),
            Err(CollabError::UnknownQueue(_))
        ));
        assert_eq!("fanout".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert!("topic".parse::<ExchangeKind>().is_err());
    }
}
