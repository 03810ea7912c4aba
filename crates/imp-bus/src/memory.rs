//! In-process bus with topic routing, used by tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::delivery::{AckOutcome, Acknowledger};
use crate::{
    BusClient, BusError, Delivery, DeliveryStream, Headers, Subscriber, SubscriberConfig,
    TopologyError, topic_matches,
};

#[derive(Clone, Debug)]
pub struct Published {
    pub subject: String,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Published {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub subject: String,
    pub outcome: AckOutcome,
}

struct Queue {
    binding: String,
    exclusive: bool,
    auto_delete: bool,
    consumers: Vec<mpsc::UnboundedSender<Delivery>>,
    cursor: usize,
    backlog: VecDeque<(String, Headers, Bytes)>,
}

impl Queue {
    fn prune(&mut self) {
        self.consumers.retain(|consumer| !consumer.is_closed());
    }
}

#[derive(Default)]
struct Inner {
    published: Mutex<Vec<Published>>,
    queues: Mutex<HashMap<String, Queue>>,
    settled: Mutex<Vec<Settlement>>,
    settled_notify: Notify,
}

/// Exclusive queues get their own copy of every matching message; consumers
/// sharing a queue compete round-robin.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything published so far.
    pub async fn take_published(&self) -> Vec<Published> {
        let mut guard = self.inner.published.lock().await;
        std::mem::take(&mut *guard)
    }

    pub async fn settlements(&self) -> Vec<Settlement> {
        self.inner.settled.lock().await.clone()
    }

    /// Waits until at least `count` deliveries were acked or nacked.
    pub async fn wait_settled(&self, count: usize) -> Vec<Settlement> {
        loop {
            let notified = self.inner.settled_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let settled = self.inner.settled.lock().await;
                if settled.len() >= count {
                    return settled.clone();
                }
            }
            notified.await;
        }
    }

    /// Queue names with at least one live consumer.
    pub async fn active_queues(&self) -> Vec<String> {
        let mut queues = self.inner.queues.lock().await;
        let mut names: Vec<String> = queues
            .iter_mut()
            .filter_map(|(name, queue)| {
                queue.prune();
                (!queue.consumers.is_empty()).then(|| name.clone())
            })
            .collect();
        names.sort();
        names
    }

    fn deliver(inner: &Arc<Inner>, name: &str, queue: &mut Queue, message: (String, Headers, Bytes)) {
        queue.prune();
        if queue.consumers.is_empty() {
            if !queue.auto_delete {
                queue.backlog.push_back(message);
            }
            return;
        }
        let (subject, headers, payload) = message;
        let acker = MemoryAcker {
            bus: Arc::downgrade(inner),
            queue: name.to_string(),
            subject: subject.clone(),
            headers: headers.clone(),
            payload: payload.clone(),
        };
        let delivery = Delivery::new(subject, headers, payload, Box::new(acker));
        let index = queue.cursor % queue.consumers.len();
        queue.cursor = queue.cursor.wrapping_add(1);
        let _ = queue.consumers[index].unbounded_send(delivery);
    }
}

#[async_trait]
impl BusClient for InMemoryBus {
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.inner.published.lock().await.push(Published {
            subject: subject.to_string(),
            headers: headers.clone(),
            payload: payload.clone(),
        });

        let mut queues = self.inner.queues.lock().await;
        queues.retain(|_, queue| {
            queue.prune();
            !(queue.auto_delete && queue.consumers.is_empty())
        });
        for (name, queue) in queues.iter_mut() {
            if topic_matches(&queue.binding, subject) {
                let message = (subject.to_string(), headers.clone(), payload.clone());
                Self::deliver(&self.inner, name, queue, message);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, config: &SubscriberConfig) -> Result<DeliveryStream, BusError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded();

        let mut queues = self.inner.queues.lock().await;
        let queue = queues.entry(config.queue.clone()).or_insert_with(|| Queue {
            binding: config.binding.clone(),
            exclusive: config.exclusive_queue,
            auto_delete: config.auto_delete_queue,
            consumers: Vec::new(),
            cursor: 0,
            backlog: VecDeque::new(),
        });
        queue.prune();
        let exclusive = queue.exclusive || config.exclusive_queue || config.exclusive_consumer;
        if exclusive && !queue.consumers.is_empty() {
            return Err(TopologyError::QueueInUse(config.queue.clone()).into());
        }
        queue.binding = config.binding.clone();
        queue.consumers.push(tx);

        let backlog: Vec<_> = queue.backlog.drain(..).collect();
        for message in backlog {
            Self::deliver(&self.inner, &config.queue, queue, message);
        }
        Ok(rx.boxed())
    }
}

struct MemoryAcker {
    bus: Weak<Inner>,
    queue: String,
    subject: String,
    headers: Headers,
    payload: Bytes,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn settle(&self, outcome: AckOutcome) -> Result<(), BusError> {
        let Some(inner) = self.bus.upgrade() else {
            return Err(BusError::Ack(anyhow::anyhow!("bus dropped")));
        };
        inner.settled.lock().await.push(Settlement {
            queue: self.queue.clone(),
            subject: self.subject.clone(),
            outcome,
        });
        inner.settled_notify.notify_waiters();

        if outcome == (AckOutcome::Nack { requeue: true }) {
            let mut queues = inner.queues.lock().await;
            if let Some(queue) = queues.get_mut(&self.queue) {
                let message = (self.subject.clone(), self.headers.clone(), self.payload.clone());
                InMemoryBus::deliver(&inner, &self.queue, queue, message);
            }
        }
        Ok(())
    }
}
