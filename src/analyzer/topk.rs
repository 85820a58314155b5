//! Exact per-key aggregation with bounded top-K selection.
//!
//! Aggregation is exact integer counting over a map keyed by the observed
//! key; memory is O(distinct keys). Selection runs a min-heap of at most K
//! entries over the map, so the scan stays O(n log K) and the heap never
//! shares state with the map.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;

/// Placeholder substituted for AUTH arguments so passwords never reach the
/// aggregation or the report.
pub const MASKED_AUTH_ARG: &str = "******";

/// Per-key aggregate for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotKeyAggregate {
    /// Observed key, case-sensitive.
    pub key: String,

    /// Total requests touching the key.
    pub total_count: i64,

    /// Per-command sub-counts in first-seen order.
    pub cmd_count: Vec<(String, i64)>,
}

impl HotKeyAggregate {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            total_count: 0,
            cmd_count: Vec::new(),
        }
    }

    fn record(&mut self, cmd: &str) {
        self.total_count += 1;

        if let Some(entry) = self.cmd_count.iter_mut().find(|(c, _)| c == cmd) {
            entry.1 += 1;
        } else {
            self.cmd_count.push((cmd.to_string(), 1));
        }
    }

    /// `"cmd1:n1 cmd2:n2 "` in first-seen order. The trailing space after
    /// the last pair is part of the consumer contract.
    pub fn cmd_info(&self) -> String {
        let mut out = String::new();
        for (cmd, count) in &self.cmd_count {
            out.push_str(cmd);
            out.push(':');
            out.push_str(&count.to_string());
            out.push(' ');
        }
        out
    }
}

/// Aggregation state for one instance's observation window.
#[derive(Debug, Default)]
pub struct KeyCounter {
    keys: HashMap<String, HotKeyAggregate>,
    /// Total requests observed, across all keys.
    pub all_total_count: i64,
}

impl KeyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observed request. The command is lower-cased on ingest; AUTH
    /// arguments are masked before they touch the key space.
    pub fn observe(&mut self, command: &str, first_arg: &str) {
        let cmd = command.to_ascii_lowercase();
        let key = if cmd == "auth" {
            MASKED_AUTH_ARG
        } else {
            first_arg
        };

        self.all_total_count += 1;
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| HotKeyAggregate::new(key))
            .record(&cmd);
    }

    pub fn distinct_keys(&self) -> usize {
        self.keys.len()
    }

    /// Select the top `k` keys by `total_count` under a bounded min-heap.
    /// The result is emitted in ascending `total_count` order (heap pop
    /// order, kept for on-wire compatibility with existing consumers).
    /// Tie-break among equal counts is arbitrary.
    pub fn top_k(&self, k: usize) -> Vec<HotKeyAggregate> {
        if k == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::with_capacity(k + 1);

        for agg in self.keys.values() {
            if heap.len() < k {
                heap.push(Reverse(HeapEntry(agg.clone())));
            } else if let Some(Reverse(min)) = heap.peek() {
                if agg.total_count > min.0.total_count {
                    heap.pop();
                    heap.push(Reverse(HeapEntry(agg.clone())));
                }
            }
        }

        let mut out = Vec::with_capacity(heap.len());
        while let Some(Reverse(entry)) = heap.pop() {
            out.push(entry.0);
        }
        out
    }
}

/// Heap ordering: by `total_count`, with the key as a deterministic
/// tie-break so heap behavior does not depend on insertion order.
#[derive(Debug, PartialEq, Eq)]
struct HeapEntry(HotKeyAggregate);

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .total_count
            .cmp(&other.0.total_count)
            .then_with(|| self.0.key.cmp(&other.0.key))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
