// IOCORE TRAFFIC CLASSIFIER
// LOW/HIGH USAGE PER DEVICE. THE GROUPING BALANCER PLACES HIGH USAGE DEVICES
// FIRST AND PACKS LOW USAGE ONES INTO WHATEVER ROOM IS LEFT.

use std::collections::BTreeMap;

use crate::host::{DeviceId, QueueId};
use crate::snapshot::EpochSnapshot;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Classification {
    #[default]
    LowUsage,
    HighUsage,
}

pub trait TrafficClassifier {
    fn classification(&self, dev: DeviceId) -> Classification;

    // ONCE PER EPOCH, BEFORE THE ENGINE RUNS
    fn update(&mut self, snap: &EpochSnapshot);
}

// A QUEUE MOVING MORE THAN `active_threshold` BYTES IN ONE EPOCH MAKES ITS
// DEVICE HIGH USAGE. THE DEVICE DROPS BACK ONLY WHEN EVERY QUEUE IS QUIET.
pub struct ByteRateClassifier {
    active_threshold: u64,
    queues: BTreeMap<QueueId, Classification>,
    devices: BTreeMap<DeviceId, Classification>,
}

impl ByteRateClassifier {
    pub fn new(active_threshold: u64) -> Self {
        Self {
            active_threshold,
            queues: BTreeMap::new(),
            devices: BTreeMap::new(),
        }
    }

    pub fn high_usage_count(&self) -> usize {
        self.devices
            .values()
            .filter(|&&c| c == Classification::HighUsage)
            .count()
    }
}

impl TrafficClassifier for ByteRateClassifier {
    fn classification(&self, dev: DeviceId) -> Classification {
        self.devices.get(&dev).copied().unwrap_or_default()
    }

    fn update(&mut self, snap: &EpochSnapshot) {
        self.queues.retain(|q, _| snap.queues.contains_key(q));
        for (&q, d) in &snap.queues {
            let class = if d.handled_bytes > self.active_threshold {
                Classification::HighUsage
            } else {
                Classification::LowUsage
            };
            self.queues.insert(q, class);
        }

        let mut devices: BTreeMap<DeviceId, Classification> = BTreeMap::new();
        for (q, &class) in &self.queues {
            let entry = devices.entry(DeviceId(q.dev)).or_default();
            if class == Classification::HighUsage {
                *entry = Classification::HighUsage;
            }
        }
        self.devices = devices;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::QueueDelta;

    fn epoch(traffic: &[(u32, u32, u64)]) -> EpochSnapshot {
        let mut s = EpochSnapshot::default();
        for &(dev, idx, bytes) in traffic {
            s.queues.insert(
                QueueId { dev, idx },
                QueueDelta { handled_bytes: bytes, handled_packets: 1 },
            );
        }
        s
    }

    #[test]
    fn one_busy_queue_marks_device_high() {
        let mut c = ByteRateClassifier::new(1000);
        c.update(&epoch(&[(1, 0, 5000), (1, 1, 0), (2, 0, 10)]));
        assert_eq!(c.classification(DeviceId(1)), Classification::HighUsage);
        assert_eq!(c.classification(DeviceId(2)), Classification::LowUsage);
        assert_eq!(c.high_usage_count(), 1);
    }

    #[test]
    fn device_goes_low_only_when_all_queues_quiet() {
        let mut c = ByteRateClassifier::new(1000);
        c.update(&epoch(&[(1, 0, 5000), (1, 1, 5000)]));
        c.update(&epoch(&[(1, 0, 0), (1, 1, 5000)]));
        assert_eq!(c.classification(DeviceId(1)), Classification::HighUsage);
        c.update(&epoch(&[(1, 0, 0), (1, 1, 0)]));
        assert_eq!(c.classification(DeviceId(1)), Classification::LowUsage);
    }

    #[test]
    fn unknown_device_is_low() {
        let c = ByteRateClassifier::new(1);
        assert_eq!(c.classification(DeviceId(42)), Classification::LowUsage);
    }
}
