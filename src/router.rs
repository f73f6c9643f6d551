//! Pub/sub subscription bookkeeping.
//!
//! The router tracks, per concrete topic, which instances and which SDK
//! connections want data, plus the in-degree counts that drive producer
//! `open_topic`/`close_topic`. It is owned and mutated by the scheduler
//! task only; everything here is plain single-threaded state.

use crate::data::Topic;
use crate::error::{Result, WardError};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Who is subscribing: an SDK connection or a same-process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscriber {
    Sdk(u64),
    Instance(String),
}

impl Subscriber {
    pub fn label(&self) -> String {
        match self {
            Subscriber::Sdk(conn) => format!("sdk:{conn}"),
            Subscriber::Instance(name) => name.clone(),
        }
    }
}

/// One subscription edge for QUERY_SUB_GRAPH output.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubEdge {
    pub subscriber: String,
    pub topic: String,
}

#[derive(Debug, Default)]
pub struct Router {
    /// Active subscriber count per sub_key. Never negative: decrements only
    /// happen for recorded subscriptions.
    in_degree: HashMap<String, usize>,
    topic_sdk: HashMap<String, BTreeSet<u64>>,
    topic_instance: HashMap<String, BTreeSet<String>>,
    /// Reverse maps for disconnect/force-disable cleanup.
    conn_subs: HashMap<u64, HashSet<String>>,
    instance_subs: HashMap<String, HashSet<String>>,
    /// The concrete Topic behind each sub_key, for open/close callbacks.
    topics: HashMap<String, Topic>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription. Returns `true` when this was the 0→positive
    /// transition for the topic (the producer's `open_topic` moment).
    /// A duplicate subscribe by the same subscriber is a no-op.
    pub fn subscribe(&mut self, sub: &Subscriber, topic: &Topic) -> Result<bool> {
        let key = topic.sub_key();
        let newly_recorded = match sub {
            Subscriber::Sdk(conn) => {
                self.topic_sdk.entry(key.clone()).or_default().insert(*conn)
                    && self.conn_subs.entry(*conn).or_default().insert(key.clone())
            }
            Subscriber::Instance(name) => {
                self.topic_instance
                    .entry(key.clone())
                    .or_default()
                    .insert(name.clone())
                    && self
                        .instance_subs
                        .entry(name.clone())
                        .or_default()
                        .insert(key.clone())
            }
        };
        if !newly_recorded {
            return Ok(false);
        }

        self.topics.entry(key.clone()).or_insert_with(|| topic.clone());
        let degree = self.in_degree.entry(key).or_insert(0);
        *degree += 1;
        Ok(*degree == 1)
    }

    /// Remove a subscription. Returns `true` on the positive→0 transition
    /// (the producer's `close_topic` moment). Unsubscribing a topic the
    /// caller never held fails without touching anyone else's in-degree.
    pub fn unsubscribe(&mut self, sub: &Subscriber, topic: &Topic) -> Result<bool> {
        let key = topic.sub_key();
        let was_recorded = match sub {
            Subscriber::Sdk(conn) => {
                self.topic_sdk.get_mut(&key).is_some_and(|s| s.remove(conn))
                    && self.conn_subs.get_mut(conn).is_some_and(|s| s.remove(&key))
            }
            Subscriber::Instance(name) => {
                self.topic_instance
                    .get_mut(&key)
                    .is_some_and(|s| s.remove(name))
                    && self
                        .instance_subs
                        .get_mut(name)
                        .is_some_and(|s| s.remove(&key))
            }
        };
        if !was_recorded {
            return Err(WardError::AlreadyUnsubscribed(key));
        }
        Ok(self.drop_degree(&key))
    }

    fn drop_degree(&mut self, key: &str) -> bool {
        let Some(degree) = self.in_degree.get_mut(key) else {
            return false;
        };
        *degree -= 1;
        if *degree == 0 {
            self.in_degree.remove(key);
            self.topic_sdk.remove(key);
            self.topic_instance.remove(key);
            self.topics.remove(key);
            true
        } else {
            false
        }
    }

    /// Drop every subscription an SDK connection holds (disconnect path).
    /// Returns the topics whose in-degree reached zero.
    pub fn unsubscribe_conn(&mut self, conn: u64) -> Vec<Topic> {
        let keys = self.conn_subs.remove(&conn).unwrap_or_default();
        let mut closed = Vec::new();
        for key in keys {
            let topic = self.topics.get(&key).cloned();
            if let Some(set) = self.topic_sdk.get_mut(&key) {
                set.remove(&conn);
            }
            if self.drop_degree(&key) {
                if let Some(topic) = topic {
                    closed.push(topic);
                }
            }
        }
        closed
    }

    /// Drop every subscription an instance holds (force-disable path).
    pub fn unsubscribe_instance(&mut self, name: &str) -> Vec<Topic> {
        let keys = self.instance_subs.remove(name).unwrap_or_default();
        let mut closed = Vec::new();
        for key in keys {
            let topic = self.topics.get(&key).cloned();
            if let Some(set) = self.topic_instance.get_mut(&key) {
                set.remove(name);
            }
            if self.drop_degree(&key) {
                if let Some(topic) = topic {
                    closed.push(topic);
                }
            }
        }
        closed
    }

    pub fn sdk_subscribers(&self, sub_key: &str) -> Vec<u64> {
        self.topic_sdk
            .get(sub_key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn instance_subscribers(&self, sub_key: &str) -> Vec<String> {
        self.topic_instance
            .get(sub_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Topics an instance currently subscribes to.
    pub fn subscriptions_of(&self, name: &str) -> Vec<Topic> {
        self.instance_subs
            .get(name)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.topics.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total live subscriber count across all of a producer's topics.
    pub fn producer_in_degree(&self, producer: &str) -> usize {
        self.topics
            .values()
            .filter(|t| t.instance_name == producer)
            .map(|t| self.in_degree.get(&t.sub_key()).copied().unwrap_or(0))
            .sum()
    }

    /// Does any instance other than those listed subscribe to one of the
    /// given producers' topics? Drives the HasDependents removal check.
    pub fn has_external_instance_subscriber(&self, producers: &[String]) -> bool {
        self.topics.values().any(|t| {
            producers.contains(&t.instance_name)
                && self
                    .topic_instance
                    .get(&t.sub_key())
                    .is_some_and(|subs| subs.iter().any(|s| !producers.contains(s)))
        })
    }

    /// All subscription edges, optionally filtered to one producer.
    pub fn edges(&self, producer: Option<&str>) -> Vec<SubEdge> {
        let mut out = Vec::new();
        for (key, topic) in &self.topics {
            if let Some(p) = producer {
                if topic.instance_name != p {
                    continue;
                }
            }
            if let Some(conns) = self.topic_sdk.get(key) {
                for conn in conns {
                    out.push(SubEdge {
                        subscriber: Subscriber::Sdk(*conn).label(),
                        topic: key.clone(),
                    });
                }
            }
            if let Some(instances) = self.topic_instance.get(key) {
                for name in instances {
                    out.push(SubEdge {
                        subscriber: name.clone(),
                        topic: key.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| (&a.topic, &a.subscriber).cmp(&(&b.topic, &b.subscriber)));
        out
    }

    pub fn in_degree_of(&self, sub_key: &str) -> usize {
        self.in_degree.get(sub_key).copied().unwrap_or(0)
    }

    /// Drop every subscription to topics the given producers own. Used when
    /// a plugin is removed: its topics cease to exist, so lingering SDK
    /// subscriptions to them are dropped silently.
    pub fn purge_producers(&mut self, producers: &[String]) {
        let keys: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, t)| producers.contains(&t.instance_name))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(conns) = self.topic_sdk.remove(&key) {
                for conn in conns {
                    if let Some(subs) = self.conn_subs.get_mut(&conn) {
                        subs.remove(&key);
                    }
                }
            }
            if let Some(instances) = self.topic_instance.remove(&key) {
                for name in instances {
                    if let Some(subs) = self.instance_subs.get_mut(&name) {
                        subs.remove(&key);
                    }
                }
            }
            self.in_degree.remove(&key);
            self.topics.remove(&key);
        }
    }
}
