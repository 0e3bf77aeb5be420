//! Work partitioning for multi-worker validation.
//!
//! Every worker derives its own slice from `partition_ranges`, so a
//! coordinator and its workers agree on the split without talking to each
//! other. Results come back over a channel and are keyed by worker index.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::time::Duration;

use tokio::sync::mpsc;

use super::EpochSchedule;

/// Splits `0..total` into `workers` contiguous ranges. The first
/// `total % workers` ranges get one extra item. Zero workers means one.
pub fn partition_ranges(total: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let base = total / workers;
    let rem = total % workers;

    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 0..workers {
        let len = base + usize::from(i < rem);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Collects one typed result per worker.
pub struct PartitionAggregator<T> {
    expected: usize,
    tx: mpsc::Sender<(usize, T)>,
    rx: mpsc::Receiver<(usize, T)>,
}

impl<T: Send + 'static> PartitionAggregator<T> {
    pub fn new(expected: usize) -> Self {
        let (tx, rx) = mpsc::channel(expected.max(1));
        Self { expected, tx, rx }
    }

    /// Sender handed to each worker; results are `(worker_index, result)`.
    pub fn sender(&self) -> mpsc::Sender<(usize, T)> {
        self.tx.clone()
    }

    /// Waits until every worker reported or `timeout` elapses, whichever
    /// comes first. Late or duplicate reports are dropped; the first report
    /// per worker wins.
    pub async fn collect(mut self, timeout: Duration) -> BTreeMap<usize, T> {
        // Only worker senders keep the channel open from here on.
        drop(self.tx);

        let mut results = BTreeMap::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while results.len() < self.expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some((index, result))) => {
                    results.entry(index).or_insert(result);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        received = results.len(),
                        expected = self.expected,
                        "partition results timed out"
                    );
                    break;
                }
            }
        }
        results
    }
}

/// Stops handing out work once the epoch's commit cutoff is reached.
///
/// A batch that already started may finish; anything still queued at the
/// cutoff is abandoned.
#[derive(Clone, Copy, Debug)]
pub struct CutoffGuard {
    epoch_id: u64,
    cutoff_block: u64,
}

impl CutoffGuard {
    pub fn new(schedule: &EpochSchedule, epoch_id: u64) -> Self {
        Self {
            epoch_id,
            cutoff_block: schedule.epoch_start(epoch_id) + schedule.submit_cutoff,
        }
    }

    pub fn cutoff_block(&self) -> u64 {
        self.cutoff_block
    }

    pub fn may_start(&self, block: u64) -> bool {
        block < self.cutoff_block
    }

    /// Pops up to `size` items for the next batch, or nothing once past the
    /// cutoff. Leftovers are drained and logged in that case.
    pub fn next_batch<T>(&self, queue: &mut VecDeque<T>, size: usize, block: u64) -> Vec<T> {
        if !self.may_start(block) {
            if !queue.is_empty() {
                tracing::warn!(
                    epoch_id = self.epoch_id,
                    block,
                    cutoff = self.cutoff_block,
                    abandoned = queue.len(),
                    "cutoff reached; abandoning queued work"
                );
                queue.clear();
            }
            return Vec::new();
        }
        let take = size.max(1).min(queue.len());
        queue.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_everything_once() {
        let ranges = partition_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);

        assert_eq!(partition_ranges(2, 4), vec![0..1, 1..2, 2..2, 2..2]);
        assert_eq!(partition_ranges(5, 0), vec![0..5]);
    }

    #[tokio::test]
    async fn aggregator_keys_results_by_worker() {
        let agg = PartitionAggregator::<Vec<usize>>::new(3);
        for (i, range) in partition_ranges(7, 3).into_iter().enumerate() {
            let tx = agg.sender();
            tokio::spawn(async move {
                let _ = tx.send((i, range.collect())).await;
            });
        }
        let results = agg.collect(Duration::from_secs(5)).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[&0], vec![0, 1, 2]);
        assert_eq!(results[&2], vec![5, 6]);
    }

    #[tokio::test]
    async fn aggregator_returns_partial_results_on_timeout() {
        let agg = PartitionAggregator::<u32>::new(2);
        let tx = agg.sender();
        tx.send((1, 7)).await.unwrap();
        let results = agg.collect(Duration::from_millis(20)).await;
        assert_eq!(results.into_iter().collect::<Vec<_>>(), vec![(1, 7)]);
        drop(tx);
    }

    #[test]
    fn cutoff_abandons_queued_work() {
        let schedule = EpochSchedule::default();
        let guard = CutoffGuard::new(&schedule, 100);
        assert_eq!(guard.cutoff_block(), 36_355);

        let mut queue: VecDeque<u32> = (0..5).collect();
        assert_eq!(guard.next_batch(&mut queue, 2, 36_300), vec![0, 1]);
        assert_eq!(guard.next_batch(&mut queue, 2, 36_355), Vec::<u32>::new());
        assert!(queue.is_empty());
    }
}
