//! Per-flow TCP payload reassembly.
//!
//! Flows are keyed by the full 4-tuple. Payload bytes are appended in TCP
//! byte order (the BPF filter plus the inbound-only check give us a single
//! direction per flow), and complete request frames are peeled off the front
//! of each buffer as they become available.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::resp::{parse_frame, Frame, FrameResult};

/// Connection 4-tuple identifying one client flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

struct Flow {
    buf: Vec<u8>,
    last_seen: Instant,
    /// Set when framing hit malformed bytes; the buffer is kept but no more
    /// records are emitted until the flow is evicted.
    poisoned: bool,
}

/// Reassembly table for all in-flight client flows.
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    idle: Duration,
}

impl FlowTable {
    pub fn new(idle: Duration) -> Self {
        Self {
            flows: HashMap::new(),
            idle,
        }
    }

    /// Append an inbound payload to its flow and extract every request frame
    /// that is now complete, in arrival order.
    pub fn push(&mut self, key: FlowKey, payload: &[u8], now: Instant) -> Vec<Frame> {
        let flow = self.flows.entry(key).or_insert_with(|| Flow {
            buf: Vec::new(),
            last_seen: now,
            poisoned: false,
        });

        flow.last_seen = now;
        flow.buf.extend_from_slice(payload);

        if flow.poisoned {
            return Vec::new();
        }

        let mut frames = Vec::new();
        let mut offset = 0;

        loop {
            match parse_frame(&flow.buf[offset..]) {
                FrameResult::Complete { frame, consumed } => {
                    if let Some(frame) = frame {
                        frames.push(frame);
                    }
                    offset += consumed;
                }
                FrameResult::Incomplete => break,
                FrameResult::Invalid => {
                    flow.poisoned = true;
                    break;
                }
            }
        }

        if offset > 0 {
            flow.buf.drain(..offset);
        }

        frames
    }

    /// Drop a flow on TCP FIN or RST.
    pub fn evict(&mut self, key: &FlowKey) {
        self.flows.remove(key);
    }

    /// Drop flows that have been idle longer than the configured threshold.
    /// Returns the number of flows evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.flows.len();
        let idle = self.idle;
        self.flows
            .retain(|_, flow| now.duration_since(flow.last_seen) <= idle);
        before - self.flows.len()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
