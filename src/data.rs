//! Topics, published data batches and the payload codec registry.

use crate::codec::{Decode, Decoder, Encode, Encoder};
use crate::error::{Result, WardError};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifies one data stream produced by a named instance.
///
/// `params` may select a variant of the stream (e.g. a time window), so it
/// is part of the subscription key but not of the payload type key.
/// Immutable value type; recreated rather than mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub instance_name: String,
    pub topic_name: String,
    pub params: String,
}

impl Topic {
    pub fn new(
        instance_name: impl Into<String>,
        topic_name: impl Into<String>,
        params: impl Into<String>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            topic_name: topic_name.into(),
            params: params.into(),
        }
    }

    /// Codec-registry key for the payload type.
    pub fn data_type(&self) -> String {
        if self.topic_name.is_empty() {
            self.instance_name.clone()
        } else {
            format!("{}::{}", self.instance_name, self.topic_name)
        }
    }

    /// Subscription key; distinct `params` are distinct subscriptions.
    pub fn sub_key(&self) -> String {
        format!("{}::{}::{}", self.instance_name, self.topic_name, self.params)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sub_key())
    }
}

impl Encode for Topic {
    fn encode(&self, enc: &mut Encoder) {
        self.instance_name.encode(enc);
        self.topic_name.encode(enc);
        self.params.encode(enc);
    }
}

impl Decode for Topic {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            instance_name: String::decode(dec)?,
            topic_name: String::decode(dec)?,
            params: String::decode(dec)?,
        })
    }
}

/// Type-erased payload object carried in a [`DataList`].
///
/// Payloads are shared via `Arc`, which gives every entry a single release
/// point: same-process subscribers clone the handle, SDK delivery works
/// from a serialized copy.
pub trait TopicData: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

/// One published unit: a topic plus a batch of opaque payload entries.
#[derive(Debug, Clone)]
pub struct DataList {
    pub topic: Topic,
    pub entries: Vec<Arc<dyn TopicData>>,
}

impl DataList {
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            entries: Vec::new(),
        }
    }

    pub fn push<T: TopicData>(&mut self, entry: T) -> &mut Self {
        self.entries.push(Arc::new(entry));
        self
    }
}

/// Serialize/deserialize function pair for one payload type. The decode
/// side doubles as the polymorphic constructor.
#[derive(Clone, Copy)]
pub struct CodecEntry {
    pub encode: fn(&dyn TopicData, &mut Encoder) -> Result<()>,
    pub decode: fn(&mut Decoder<'_>) -> Result<Arc<dyn TopicData>>,
}

impl CodecEntry {
    /// Entry for a concrete payload type implementing the codec traits.
    pub fn of<T>() -> Self
    where
        T: TopicData + Encode + Decode,
    {
        Self {
            encode: |data, enc| {
                let concrete = data.as_any().downcast_ref::<T>().ok_or_else(|| {
                    WardError::Codec(format!(
                        "payload is not a {}",
                        std::any::type_name::<T>()
                    ))
                })?;
                concrete.encode(enc);
                Ok(())
            },
            decode: |dec| Ok(Arc::new(T::decode(dec)?) as Arc<dyn TopicData>),
        }
    }
}

impl fmt::Debug for CodecEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CodecEntry")
    }
}

/// Maps a topic's type string to the codec entry for its payload.
///
/// Built once at startup from a fixed table and passed to components as
/// shared context; topics without an entry are unreadable and their
/// payloads are dropped rather than dereferenced.
#[derive(Debug, Default)]
pub struct DataCodecRegistry {
    entries: HashMap<String, CodecEntry>,
}

impl DataCodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_key: impl Into<String>, entry: CodecEntry) {
        self.entries.insert(type_key.into(), entry);
    }

    pub fn register_type<T>(&mut self, type_key: impl Into<String>)
    where
        T: TopicData + Encode + Decode,
    {
        self.register(type_key, CodecEntry::of::<T>());
    }

    /// Two-step lookup: fully qualified `instance::topic` first, then the
    /// bare instance name for plugins exposing one payload shape for all
    /// their topics.
    pub fn resolve(&self, data_type: &str) -> Option<&CodecEntry> {
        if let Some(entry) = self.entries.get(data_type) {
            return Some(entry);
        }
        let (instance, _) = data_type.split_once("::")?;
        self.entries.get(instance)
    }

    fn entry_for(&self, topic: &Topic) -> Result<&CodecEntry> {
        let key = topic.data_type();
        self.resolve(&key)
            .ok_or_else(|| WardError::Codec(format!("no codec registered for topic type {key}")))
    }

    /// Encode a whole DataList: topic, entry count, entries.
    pub fn encode_data_list(&self, data: &DataList, enc: &mut Encoder) -> Result<()> {
        let entry = self.entry_for(&data.topic)?;
        data.topic.encode(enc);
        (data.entries.len() as u64).encode(enc);
        for payload in &data.entries {
            (entry.encode)(payload.as_ref(), enc)?;
        }
        Ok(())
    }

    pub fn decode_data_list(&self, dec: &mut Decoder<'_>) -> Result<DataList> {
        let topic = Topic::decode(dec)?;
        let entry = self.entry_for(&topic)?;
        let count = u64::decode(dec)? as usize;
        if count > dec.remaining() {
            return Err(WardError::Codec(format!(
                "entry count {} exceeds {} remaining bytes",
                count,
                dec.remaining()
            )));
        }
        let mut data = DataList::new(topic);
        for _ in 0..count {
            data.entries.push((entry.decode)(dec)?);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::MetricBatch;

    #[test]
    fn topic_keys() {
        let t = Topic::new("cpu_stat", "usage", "window=10");
        assert_eq!(t.data_type(), "cpu_stat::usage");
        assert_eq!(t.sub_key(), "cpu_stat::usage::window=10");

        let bare = Topic::new("cpu_stat", "", "");
        assert_eq!(bare.data_type(), "cpu_stat");
        assert_eq!(bare.sub_key(), "cpu_stat::::");
    }

    #[test]
    fn registry_falls_back_to_instance_key() {
        let mut reg = DataCodecRegistry::new();
        reg.register_type::<MetricBatch>("cpu_stat");

        assert!(reg.resolve("cpu_stat").is_some());
        assert!(reg.resolve("cpu_stat::usage").is_some());
        assert!(reg.resolve("other::usage").is_none());
    }

    #[test]
    fn qualified_entry_wins_over_fallback() {
        let mut reg = DataCodecRegistry::new();
        reg.register_type::<MetricBatch>("cpu_stat");
        reg.register_type::<MetricBatch>("cpu_stat::usage");
        // Both resolve; the qualified key must be consulted first. The
        // entries here are the same type, so observable behavior is
        // identical; the lookup order is what this pins down.
        assert!(reg.resolve("cpu_stat::usage").is_some());
    }

    #[test]
    fn unregistered_topic_is_unreadable() {
        let reg = DataCodecRegistry::new();
        let data = DataList::new(Topic::new("ghost", "t", ""));
        let mut enc = Encoder::new();
        assert!(matches!(
            reg.encode_data_list(&data, &mut enc),
            Err(WardError::Codec(_))
        ));
    }
}
