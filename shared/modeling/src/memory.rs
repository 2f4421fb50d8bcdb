use sysinfo::{Pid, ProcessesToUpdate, System};
use time::OffsetDateTime;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsageSample {
    pub timestamp: OffsetDateTime,
    pub resident_bytes: u64,
}

/// Source of resident-memory readings for the history kept by the scheduler.
pub trait MemoryProbe: Send {
    fn resident_bytes(&mut self) -> u64;
}

impl<F> MemoryProbe for F
where
    F: FnMut() -> u64 + Send,
{
    fn resident_bytes(&mut self) -> u64 {
        self()
    }
}

/// Reads this process's resident set size.
pub struct ProcessMemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!("[memory] can't determine own pid, memory history will read zero: {err}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system
            .process(pid)
            .map(|process| process.memory())
            .unwrap_or_default()
    }
}

/// Append-only series of memory samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryHistory {
    samples: Vec<MemoryUsageSample>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resident_bytes: u64) -> MemoryUsageSample {
        let sample = MemoryUsageSample {
            timestamp: OffsetDateTime::now_utc(),
            resident_bytes,
        };
        self.samples.push(sample);
        sample
    }

    pub fn samples(&self) -> &[MemoryUsageSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn peak_bytes(&self) -> u64 {
        self.samples
            .iter()
            .map(|sample| sample.resident_bytes)
            .max()
            .unwrap_or_default()
    }
}

impl From<Vec<MemoryUsageSample>> for MemoryHistory {
    fn from(samples: Vec<MemoryUsageSample>) -> Self {
        Self { samples }
    }
}

/// Renders samples as two comma separated series: unix timestamps in seconds
/// and resident MiB.
pub fn render_series(samples: &[MemoryUsageSample]) -> (String, String) {
    let timestamps = samples
        .iter()
        .map(|sample| format!("{:.3}", sample.timestamp.unix_timestamp_nanos() as f64 / 1e9))
        .collect::<Vec<_>>()
        .join(", ");
    let megabytes = samples
        .iter()
        .map(|sample| format!("{:.1}", sample.resident_bytes as f64 / (1024.0 * 1024.0)))
        .collect::<Vec<_>>()
        .join(", ");
    (timestamps, megabytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_probe_reads_nonzero() {
        let mut probe = ProcessMemoryProbe::new();
        assert!(probe.resident_bytes() > 0);
    }

    #[test]
    fn history_renders_in_order() {
        let mut history = MemoryHistory::new();
        history.record(1024 * 1024);
        history.record(3 * 1024 * 1024);
        assert_eq!(history.peak_bytes(), 3 * 1024 * 1024);
        let (timestamps, megabytes) = render_series(history.samples());
        assert_eq!(timestamps.split(", ").count(), 2);
        assert_eq!(megabytes, "1.0, 3.0");
        let samples = history.samples();
        assert!(samples[0].timestamp <= samples[1].timestamp);
    }
}
