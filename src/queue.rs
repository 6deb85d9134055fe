use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::measurement::Measurement;

/// Unbounded FIFO shared between the sampler and the reporter.
#[derive(Debug, Clone, Default)]
pub struct MeasurementQueue {
    inner: Arc<Mutex<VecDeque<Measurement>>>,
}

impl MeasurementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, measurement: Measurement) {
        self.lock().push_back(measurement);
    }

    /// Appends a failed batch behind anything queued meanwhile.
    pub fn requeue(&self, batch: Vec<Measurement>) {
        self.lock().extend(batch);
    }

    pub fn drain_all(&self) -> Vec<Measurement> {
        let mut queue = self.lock();
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Measurement>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::measurement::Reading;

    fn measurement(i: u32) -> Measurement {
        Measurement::new(
            "test-device",
            Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
            Reading {
                temperature_celsius: i as f64,
                humidity_percent: 50.0,
            },
        )
    }

    #[test]
    fn drain_all_on_empty_queue_returns_nothing() {
        let queue = MeasurementQueue::new();
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn drain_all_preserves_insertion_order_and_empties_queue() {
        let queue = MeasurementQueue::new();
        for i in 0..5 {
            queue.push(measurement(i));
        }

        let drained = queue.drain_all();
        let temps: Vec<f64> = drained.iter().map(|m| m.temperature_celsius).collect();
        assert_eq!(temps, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn requeued_batch_is_returned_by_a_later_drain() {
        let queue = MeasurementQueue::new();
        queue.push(measurement(0));
        queue.push(measurement(1));
        let batch = queue.drain_all();

        queue.push(measurement(2));
        queue.requeue(batch);

        let temps: Vec<f64> = queue
            .drain_all()
            .iter()
            .map(|m| m.temperature_celsius)
            .collect();
        assert_eq!(temps, vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn concurrent_push_and_drain_lose_and_duplicate_nothing() {
        const N: u32 = 10_000;
        let queue = MeasurementQueue::new();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..N {
                    queue.push(measurement(i));
                }
            })
        };

        let mut seen = Vec::new();
        while !producer.is_finished() {
            seen.extend(queue.drain_all());
        }
        producer.join().unwrap();
        seen.extend(queue.drain_all());

        assert_eq!(seen.len(), N as usize);
        let unique: HashSet<i64> = seen.iter().map(|m| m.measured_at.timestamp()).collect();
        assert_eq!(unique.len(), N as usize);
    }
}
