//! Standalone harness: drives the bridge with a scripted TUN-side client and
//! prints every upper-layer event. Handy for eyeballing the accept, echo,
//! and close paths without a packet trace.

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tunforge::logger::{self, BreadcrumbFlags, LogLevel, LogSink};
use tunforge::parse::{checksum, parse_ipv4, ParsedPacket};
use tunforge::{
    AcceptDecision, IpStack, StackConfig, StackDelegate, TcpConnection, WriteStatus,
};

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 64, 0, 2);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

struct StderrSink;

impl LogSink for StderrSink {
    fn log(&self, level: LogLevel, message: &str, _breadcrumbs: BreadcrumbFlags) {
        eprintln!("{:>5} {message}", level.as_str());
    }
}

struct EchoDelegate;

impl StackDelegate for EchoDelegate {
    fn did_accept_tcp_connection(&self, conn: Arc<TcpConnection>, decision: AcceptDecision) {
        println!("delegate: accepting {}", conn.info());
        conn.set_on_activated(|conn| println!("conn: {} activated", conn.info()));
        conn.set_on_readable_bytes(|conn, slices, total, completion| {
            let mut data = Vec::with_capacity(total);
            for slice in slices {
                data.extend_from_slice(slice);
            }
            completion.complete();
            println!("conn: {total} bytes in: {:?}", String::from_utf8_lossy(&data));
            data.make_ascii_uppercase();
            let result = conn.write_bytes(&data);
            if result.status != WriteStatus::Ok {
                println!("conn: echo write failed: {:?}", result.status);
            }
        });
        conn.set_on_sent_bytes(|_, sent| println!("conn: peer acked {sent} bytes"));
        conn.set_on_read_eof(|conn| {
            println!("conn: peer sent FIN; closing");
            conn.graceful_close();
        });
        conn.set_on_terminated(|conn, reason| {
            println!("conn: {} terminated ({reason:?})", conn.info())
        });
        decision.accept(true);
    }
}

struct ScriptedClient {
    frames: Receiver<Vec<u8>>,
    seq: u32,
    ack: u32,
}

impl ScriptedClient {
    fn new(frames: Receiver<Vec<u8>>) -> Self {
        Self {
            frames,
            seq: 0x4000,
            ack: 0,
        }
    }

    fn segment(&self, flags: u8, payload: &[u8]) -> Vec<u8> {
        let total = 40 + payload.len();
        let mut packet = vec![0u8; total];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = 6;
        packet[12..16].copy_from_slice(&CLIENT_IP.octets());
        packet[16..20].copy_from_slice(&SERVER_IP.octets());
        packet[20..22].copy_from_slice(&40100u16.to_be_bytes());
        packet[22..24].copy_from_slice(&80u16.to_be_bytes());
        packet[24..28].copy_from_slice(&self.seq.to_be_bytes());
        let ack = if flags & 0x10 != 0 { self.ack } else { 0 };
        packet[28..32].copy_from_slice(&ack.to_be_bytes());
        packet[32] = 5 << 4;
        packet[33] = flags;
        packet[34..36].copy_from_slice(&0xFFFFu16.to_be_bytes());
        packet[40..].copy_from_slice(payload);
        let tcp_checksum = checksum::tcp_ipv4(CLIENT_IP, SERVER_IP, &packet[20..]);
        packet[36..38].copy_from_slice(&tcp_checksum.to_be_bytes());
        let ip_checksum = checksum::ipv4_header(&packet[..20]);
        packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
        packet
    }

    /// Wait for the next frame matching `pred`, folding every observed frame
    /// into the ack state and collecting payload along the way.
    fn expect(
        &mut self,
        what: &str,
        mut pred: impl FnMut(bool, bool, bool, &[u8]) -> bool,
    ) -> Result<Vec<u8>> {
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        let mut collected = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .with_context(|| format!("timed out waiting for {what}"))?;
            let frame = self
                .frames
                .recv_timeout(remaining)
                .with_context(|| format!("timed out waiting for {what}"))?;
            let Ok(ParsedPacket::Tcp(segment)) = parse_ipv4(&frame) else {
                continue;
            };
            let advance = segment.payload.len() as u32
                + u32::from(segment.flags.syn)
                + u32::from(segment.flags.fin);
            let fresh = if segment.flags.syn {
                self.ack = segment.seq_number.wrapping_add(advance);
                true
            } else if segment.seq_number == self.ack {
                self.ack = self.ack.wrapping_add(advance);
                true
            } else {
                false
            };
            if fresh {
                collected.extend_from_slice(segment.payload);
            }
            if pred(segment.flags.syn, segment.flags.fin, segment.flags.rst, &collected) {
                return Ok(collected);
            }
        }
    }
}

fn main() -> Result<()> {
    logger::install_sink(Some(Arc::new(StderrSink)), Some(LogLevel::Info));
    logger::set_breadcrumb_mask(BreadcrumbFlags::STACK | BreadcrumbFlags::CONN);

    let config = StackConfig {
        flush_interval: Duration::ZERO,
        ..StackConfig::default()
    };
    let stack = IpStack::new(config).context("building stack")?;
    stack.set_delegate(Some(Arc::new(EchoDelegate)));

    let (frame_tx, frame_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = unbounded();
    stack.set_outbound_handler(move |packets, _families| {
        for packet in packets {
            let _ = frame_tx.send(packet);
        }
    });
    stack.start().context("starting stack")?;

    let mut client = ScriptedClient::new(frame_rx);

    println!("-- handshake --");
    stack.input_packet(&client.segment(0x02, &[])); // SYN
    client.seq = client.seq.wrapping_add(1);
    client.expect("SYN-ACK", |syn, _, _, _| syn)?;
    stack.input_packet(&client.segment(0x10, &[])); // ACK

    println!("-- echo --");
    let message = b"hello tunforge";
    stack.input_packet(&client.segment(0x10, message));
    client.seq = client.seq.wrapping_add(message.len() as u32);
    let echoed = client.expect("echo payload", |_, _, _, collected| {
        collected.len() >= message.len()
    })?;
    stack.input_packet(&client.segment(0x10, &[])); // ACK the echo
    if echoed != message.to_ascii_uppercase() {
        bail!("echo mismatch: {:?}", String::from_utf8_lossy(&echoed));
    }
    println!("echoed: {:?}", String::from_utf8_lossy(&echoed));

    println!("-- close --");
    stack.input_packet(&client.segment(0x11, &[])); // FIN+ACK
    client.seq = client.seq.wrapping_add(1);
    client.expect("server FIN", |_, fin, _, _| fin)?;
    stack.input_packet(&client.segment(0x10, &[])); // ACK the FIN

    std::thread::sleep(Duration::from_millis(100));
    let stats = stack.stats();
    println!(
        "-- stats -- in={} out={} intercepted={} accepted={} active={}",
        stats.packets_received,
        stats.packets_sent,
        stats.connections_intercepted,
        stats.connections_accepted,
        stats.connections_active
    );

    stack.teardown();
    Ok(())
}
