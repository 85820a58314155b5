//! Packet-capture probe.
//!
//! Opens a live capture on a named interface, filters for TCP traffic
//! to/from the target `ip:port`, reassembles Redis request frames per flow,
//! and appends one record per request to the output file. Runs for a bounded
//! duration and then exits cleanly; setup failures are fatal.

pub mod flow;
pub mod record;
pub mod resp;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use tracing::{debug, info, warn};

use crate::config::FLOW_IDLE_SECS;
use flow::{FlowKey, FlowTable};
use record::{CaptureRecord, RecordWriter};

/// Snap length: large enough to hold a full Redis request frame.
const SNAPLEN: i32 = 65535;

/// Poll granularity for the capture read loop, in milliseconds.
const READ_TIMEOUT_MS: i32 = 1000;

/// How often idle flows are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Capture probe invocation surface.
#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Network interface to capture on.
    #[arg(long)]
    pub device: String,

    /// Target Redis IPv4 address.
    #[arg(long)]
    pub ip: Ipv4Addr,

    /// Target Redis port.
    #[arg(long)]
    pub port: u16,

    /// Capture duration in seconds.
    #[arg(long)]
    pub timeout: u64,

    /// Probe diagnostics log file.
    #[arg(long = "log-file")]
    pub log_file: PathBuf,

    /// Capture record output file.
    #[arg(long = "output-file")]
    pub output_file: PathBuf,
}

/// Run the capture loop until the deadline. Returns an error only for setup
/// failures (device open, filter compile, output create); deadline expiry is
/// a normal termination.
pub fn run(args: &ProbeArgs) -> Result<()> {
    let mut writer = RecordWriter::open(&args.output_file)?;

    let cap = pcap::Capture::from_device(args.device.as_str())
        .with_context(|| format!("looking up capture device {}", args.device))?
        .promisc(true)
        .snaplen(SNAPLEN)
        .timeout(READ_TIMEOUT_MS);

    let mut cap = cap
        .open()
        .with_context(|| format!("opening capture device {}", args.device))?;

    let filter = format!("tcp and host {} and port {}", args.ip, args.port);
    cap.filter(&filter, true)
        .with_context(|| format!("compiling BPF filter: {filter}"))?;

    let link_type = cap.get_datalink();

    info!(
        device = %args.device,
        target = %format!("{}:{}", args.ip, args.port),
        timeout_secs = args.timeout,
        link_type = link_type.0,
        "capture started",
    );

    let mut flows = FlowTable::new(Duration::from_secs(FLOW_IDLE_SECS));
    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let mut next_sweep = Instant::now() + SWEEP_INTERVAL;
    let mut records: u64 = 0;

    while Instant::now() < deadline {
        match cap.next_packet() {
            Ok(packet) => {
                let ts = packet_time(&packet);
                records += handle_packet(
                    packet.data,
                    link_type,
                    args.ip,
                    args.port,
                    ts,
                    &mut flows,
                    &mut writer,
                )?;
            }
            // Read timeout: no packets in the poll interval, keep looping so
            // the deadline check fires.
            Err(pcap::Error::TimeoutExpired) => {}
            Err(e) => return Err(e).context("reading from capture device"),
        }

        let now = Instant::now();
        if now >= next_sweep {
            let evicted = flows.sweep(now);
            if evicted > 0 {
                debug!(evicted, remaining = flows.len(), "swept idle flows");
            }
            next_sweep = now + SWEEP_INTERVAL;
        }
    }

    info!(records, flows = flows.len(), "capture finished");

    Ok(())
}

/// Capture timestamp of a packet, falling back to wall-clock time for
/// malformed header values.
fn packet_time(packet: &pcap::Packet<'_>) -> DateTime<Utc> {
    let secs = packet.header.ts.tv_sec as i64;
    let micros = packet.header.ts.tv_usec as u32;

    DateTime::from_timestamp(secs, micros.saturating_mul(1000)).unwrap_or_else(Utc::now)
}

/// Decode one link-layer frame and fold any completed request frames into
/// records. Undecodable packets are silently dropped; only record write
/// failures propagate. Returns the number of records written.
fn handle_packet(
    data: &[u8],
    link_type: pcap::Linktype,
    target_ip: Ipv4Addr,
    target_port: u16,
    ts: DateTime<Utc>,
    flows: &mut FlowTable,
    writer: &mut RecordWriter,
) -> Result<u64> {
    let Some(sliced) = slice_packet(data, link_type) else {
        return Ok(0);
    };

    let Some(etherparse::NetSlice::Ipv4(ipv4)) = &sliced.net else {
        return Ok(0);
    };

    let Some(etherparse::TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return Ok(0);
    };

    let src_ip = ipv4.header().source_addr();
    let dst_ip = ipv4.header().destination_addr();

    // Only the client-to-server direction carries requests.
    if dst_ip != target_ip || tcp.destination_port() != target_port {
        return Ok(0);
    }

    let key = FlowKey {
        src_ip,
        src_port: tcp.source_port(),
        dst_ip,
        dst_port: tcp.destination_port(),
    };

    if tcp.fin() || tcp.rst() {
        flows.evict(&key);
        return Ok(0);
    }

    let payload = tcp.payload();
    if payload.is_empty() {
        return Ok(0);
    }

    let frames = flows.push(key, payload, Instant::now());
    let count = frames.len() as u64;

    for frame in frames {
        writer.write(&CaptureRecord {
            timestamp: ts,
            src_ip: key.src_ip,
            src_port: key.src_port,
            dst_ip: key.dst_ip,
            dst_port: key.dst_port,
            length: payload.len(),
            command: frame.command,
            first_arg: frame.first_arg,
        })?;
    }

    Ok(count)
}

/// Slice a captured frame according to the device link type.
fn slice_packet(
    data: &[u8],
    link_type: pcap::Linktype,
) -> Option<etherparse::SlicedPacket<'_>> {
    match link_type {
        pcap::Linktype::ETHERNET => etherparse::SlicedPacket::from_ethernet(data).ok(),

        // BSD loopback: 4-byte address family header before the IP packet.
        pcap::Linktype::NULL | pcap::Linktype::LOOP => {
            etherparse::SlicedPacket::from_ip(data.get(4..)?).ok()
        }

        // Linux cooked capture ("any" device): 16-byte pseudo header.
        pcap::Linktype::LINUX_SLL => etherparse::SlicedPacket::from_ip(data.get(16..)?).ok(),

        pcap::Linktype::RAW => etherparse::SlicedPacket::from_ip(data).ok(),

        other => {
            warn!(link_type = other.0, "unsupported link type, dropping packet");
            None
        }
    }
}
