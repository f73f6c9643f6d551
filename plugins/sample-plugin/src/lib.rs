//! Example nodeward plugin with one instance of each kind.
//!
//! `cpu_stat` samples /proc/stat and publishes a `MetricBatch` on its
//! `usage` topic. `hotspot_scan` subscribes to it and publishes an
//! `AnalysisReport` whenever non-idle time crosses a threshold.
//! `governor_tune` pretends to pin a CPU frequency governor.

use std::time::{SystemTime, UNIX_EPOCH};

use nodeward::data::{DataList, Topic};
use nodeward::instance::{HostHandle, Instance, InstanceInfo, InstanceKind, RunStatus};
use nodeward::payload::{AnalysisReport, MetricBatch, MetricSample};
use tracing::{debug, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
struct CpuStat {
    publishing: bool,
}

impl CpuStat {
    /// First line of /proc/stat: aggregate jiffies per mode.
    fn sample() -> Option<Vec<MetricSample>> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let mut fields = line.split_whitespace();
        if fields.next()? != "cpu" {
            return None;
        }
        let names = ["user", "nice", "system", "idle", "iowait", "irq", "softirq"];
        let mut samples = Vec::with_capacity(names.len());
        for name in names {
            let value: i64 = fields.next()?.parse().ok()?;
            samples.push(MetricSample {
                name: name.to_string(),
                value,
            });
        }
        Some(samples)
    }
}

impl Instance for CpuStat {
    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            name: "cpu_stat".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "aggregate CPU time from /proc/stat".to_string(),
            kind: InstanceKind::Collector,
            period: 100,
            priority: 0,
            supported_topics: vec!["usage".to_string()],
        }
    }

    fn enable(&mut self, _param: &str, _host: &HostHandle) -> Result<(), String> {
        if !std::path::Path::new("/proc/stat").exists() {
            return Err("/proc/stat not available".to_string());
        }
        Ok(())
    }

    fn disable(&mut self, _host: &HostHandle) {}

    fn run(&mut self, host: &HostHandle) -> RunStatus {
        if !self.publishing {
            return RunStatus::Ok;
        }
        let Some(samples) = Self::sample() else {
            return RunStatus::Error("failed to read /proc/stat".to_string());
        };
        let mut data = DataList::new(Topic::new("cpu_stat", "usage", ""));
        data.push(MetricBatch {
            timestamp_ms: now_ms(),
            samples,
        });
        host.publish(data);
        RunStatus::Ok
    }

    fn open_topic(&mut self, topic: &Topic) -> Result<(), String> {
        debug!(topic = %topic, "cpu_stat topic opened");
        self.publishing = true;
        Ok(())
    }

    fn close_topic(&mut self, topic: &Topic) {
        debug!(topic = %topic, "cpu_stat topic closed");
        self.publishing = false;
    }

    fn update_data(&mut self, _data: &DataList) {}
}

/// Flags batches whose non-idle share exceeds the threshold given as the
/// enable parameter (percent, default 80).
struct HotspotScan {
    threshold_pct: i64,
    last: Option<Vec<MetricSample>>,
    pending: Vec<String>,
    reporting: bool,
}

impl Default for HotspotScan {
    fn default() -> Self {
        Self {
            threshold_pct: 80,
            last: None,
            pending: Vec::new(),
            reporting: false,
        }
    }
}

impl HotspotScan {
    fn busy_pct(prev: &[MetricSample], cur: &[MetricSample]) -> Option<i64> {
        let delta = |name: &str| -> Option<i64> {
            let p = prev.iter().find(|s| s.name == name)?.value;
            let c = cur.iter().find(|s| s.name == name)?.value;
            Some(c - p)
        };
        let idle = delta("idle")? + delta("iowait")?;
        let total: i64 = cur
            .iter()
            .map(|s| s.name.as_str())
            .filter_map(delta)
            .sum();
        if total <= 0 {
            return None;
        }
        Some(100 * (total - idle) / total)
    }
}

impl Instance for HotspotScan {
    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            name: "hotspot_scan".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "flags sustained CPU saturation".to_string(),
            kind: InstanceKind::Scenario,
            period: 200,
            priority: 10,
            supported_topics: vec!["report".to_string()],
        }
    }

    fn enable(&mut self, param: &str, host: &HostHandle) -> Result<(), String> {
        if !param.is_empty() {
            self.threshold_pct = param
                .parse()
                .map_err(|_| format!("threshold must be a percentage, got '{param}'"))?;
            if !(1..=100).contains(&self.threshold_pct) {
                return Err(format!("threshold out of range: {}", self.threshold_pct));
            }
        }
        host.subscribe(Topic::new("cpu_stat", "usage", ""));
        Ok(())
    }

    fn disable(&mut self, host: &HostHandle) {
        host.unsubscribe(Topic::new("cpu_stat", "usage", ""));
        self.last = None;
        self.pending.clear();
    }

    fn run(&mut self, host: &HostHandle) -> RunStatus {
        if self.pending.is_empty() || !self.reporting {
            self.pending.clear();
            return RunStatus::Ok;
        }
        let findings = std::mem::take(&mut self.pending);
        let mut data = DataList::new(Topic::new("hotspot_scan", "report", ""));
        data.push(AnalysisReport {
            summary: format!("cpu busy above {}%", self.threshold_pct),
            findings,
        });
        host.publish(data);
        RunStatus::Ok
    }

    fn open_topic(&mut self, _topic: &Topic) -> Result<(), String> {
        self.reporting = true;
        Ok(())
    }

    fn close_topic(&mut self, _topic: &Topic) {
        self.reporting = false;
    }

    fn update_data(&mut self, data: &DataList) {
        for entry in &data.entries {
            let Some(batch) = entry.as_any().downcast_ref::<MetricBatch>() else {
                warn!(topic = %data.topic, "unexpected payload type");
                continue;
            };
            if let Some(prev) = &self.last {
                if let Some(pct) = Self::busy_pct(prev, &batch.samples) {
                    if pct >= self.threshold_pct {
                        self.pending
                            .push(format!("busy {}% at {}", pct, batch.timestamp_ms));
                    }
                }
            }
            self.last = Some(batch.samples.clone());
        }
    }
}

/// Stub tune: records the requested governor and reports it applied.
#[derive(Default)]
struct GovernorTune {
    governor: String,
}

impl Instance for GovernorTune {
    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            name: "governor_tune".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "pins the CPU frequency governor".to_string(),
            kind: InstanceKind::Tune,
            period: 500,
            priority: 0,
            supported_topics: Vec::new(),
        }
    }

    fn enable(&mut self, param: &str, _host: &HostHandle) -> Result<(), String> {
        let governor = if param.is_empty() { "performance" } else { param };
        match governor {
            "performance" | "powersave" | "schedutil" => {
                self.governor = governor.to_string();
                Ok(())
            }
            other => Err(format!("unknown governor '{other}'")),
        }
    }

    fn disable(&mut self, _host: &HostHandle) {
        self.governor.clear();
    }

    fn run(&mut self, _host: &HostHandle) -> RunStatus {
        debug!(governor = %self.governor, "governor check");
        RunStatus::Ok
    }

    fn open_topic(&mut self, _topic: &Topic) -> Result<(), String> {
        Err("governor_tune publishes no topics".to_string())
    }

    fn close_topic(&mut self, _topic: &Topic) {}

    fn update_data(&mut self, _data: &DataList) {}
}

nodeward::declare_plugin!(|| {
    vec![
        Box::new(CpuStat::default()) as Box<dyn Instance>,
        Box::new(HotspotScan::default()),
        Box::new(GovernorTune::default()),
    ]
});
