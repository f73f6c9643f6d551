//! Built-in payload types and the fixed startup codec table.
//!
//! The registry is populated once at daemon startup; plugins do not
//! register payload codecs dynamically. A new payload shape means a new
//! entry in [`default_registry`].

use crate::codec::{Decode, Decoder, Encode, Encoder};
use crate::data::{DataCodecRegistry, TopicData};
use crate::error::Result;
use std::any::Any;

/// One named measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: i64,
}

impl Encode for MetricSample {
    fn encode(&self, enc: &mut Encoder) {
        self.name.encode(enc);
        self.value.encode(enc);
    }
}

impl Decode for MetricSample {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            name: String::decode(dec)?,
            value: i64::decode(dec)?,
        })
    }
}

/// A collector's refresh output: a batch of samples taken at one instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricBatch {
    pub timestamp_ms: u64,
    pub samples: Vec<MetricSample>,
}

impl TopicData for MetricBatch {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Encode for MetricBatch {
    fn encode(&self, enc: &mut Encoder) {
        self.timestamp_ms.encode(enc);
        (self.samples.len() as u64).encode(enc);
        for sample in &self.samples {
            sample.encode(enc);
        }
    }
}

impl Decode for MetricBatch {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let timestamp_ms = u64::decode(dec)?;
        let count = u64::decode(dec)? as usize;
        if count > dec.remaining() {
            return Err(crate::error::WardError::Codec(format!(
                "sample count {} exceeds {} remaining bytes",
                count,
                dec.remaining()
            )));
        }
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            samples.push(MetricSample::decode(dec)?);
        }
        Ok(Self {
            timestamp_ms,
            samples,
        })
    }
}

/// A scenario's analysis output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalysisReport {
    pub summary: String,
    pub findings: Vec<String>,
}

impl TopicData for AnalysisReport {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Encode for AnalysisReport {
    fn encode(&self, enc: &mut Encoder) {
        self.summary.encode(enc);
        self.findings.encode(enc);
    }
}

impl Decode for AnalysisReport {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            summary: String::decode(dec)?,
            findings: Vec::<String>::decode(dec)?,
        })
    }
}

/// The fixed built-in codec table.
///
/// Keys follow the registry lookup policy: a bare instance name covers all
/// of that instance's topics unless a qualified `instance::topic` entry
/// overrides it.
pub fn default_registry() -> DataCodecRegistry {
    let mut reg = DataCodecRegistry::new();
    reg.register_type::<MetricBatch>("cpu_stat");
    reg.register_type::<MetricBatch>("mem_stat");
    reg.register_type::<MetricBatch>("net_stat");
    reg.register_type::<AnalysisReport>("hotspot_scan");
    reg.register_type::<AnalysisReport>("latency_scan");
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_slice, encode_to_vec};
    use crate::data::{DataList, Topic};

    #[test]
    fn metric_batch_round_trip() {
        let batch = MetricBatch {
            timestamp_ms: 1724668800000,
            samples: vec![
                MetricSample {
                    name: "cpu0.busy".into(),
                    value: 87,
                },
                MetricSample {
                    name: "cpu1.busy".into(),
                    value: 12,
                },
            ],
        };
        let decoded: MetricBatch = decode_from_slice(&encode_to_vec(&batch)).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn analysis_report_round_trip() {
        let report = AnalysisReport {
            summary: "one hot core".into(),
            findings: vec!["cpu0 pegged".into(), "migrate candidate: pid 4242".into()],
        };
        let decoded: AnalysisReport = decode_from_slice(&encode_to_vec(&report)).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn data_list_round_trip_through_registry() {
        let reg = default_registry();
        let mut data = DataList::new(Topic::new("cpu_stat", "usage", ""));
        data.push(MetricBatch {
            timestamp_ms: 1,
            samples: vec![MetricSample {
                name: "cpu0.busy".into(),
                value: 50,
            }],
        });

        let mut enc = crate::codec::Encoder::new();
        reg.encode_data_list(&data, &mut enc).unwrap();
        let bytes = enc.into_bytes();

        let mut dec = crate::codec::Decoder::new(&bytes);
        let decoded = reg.decode_data_list(&mut dec).unwrap();
        assert_eq!(decoded.topic, data.topic);
        assert_eq!(decoded.entries.len(), 1);
        let batch = decoded.entries[0]
            .as_any()
            .downcast_ref::<MetricBatch>()
            .unwrap();
        assert_eq!(batch.samples[0].value, 50);
    }
}
