use super::*;
use crate::conn::ConnectionState;
use crate::error::WriteStatus;
use crate::parse::{checksum, parse_ipv4, ParsedPacket, TcpFlags, TcpSegment};
use crate::scheduler::ContextId;
use crate::testutil;
use parking_lot::MutexGuard;
use std::thread;
use std::time::Instant;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_ACK: u8 = 0x10;

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

fn test_config() -> StackConfig {
    StackConfig {
        flush_interval: Duration::ZERO,
        graceful_close_timeout: Duration::from_millis(250),
        timer_interval: Duration::from_millis(25),
        ..StackConfig::default()
    }
}

#[derive(Default)]
struct EventLog {
    activated: usize,
    readable: Vec<Vec<u8>>,
    sent: Vec<usize>,
    writable: Vec<bool>,
    eof: usize,
    terminated: Vec<TerminationReason>,
}

#[derive(Default)]
struct SharedState {
    events: Mutex<EventLog>,
    frames: Mutex<Vec<Vec<u8>>>,
    conn: Mutex<Option<Arc<TcpConnection>>>,
    completions: Mutex<Vec<crate::conn::ReceiveCompletion>>,
}

struct TestDelegate {
    accept: bool,
    auto_complete: bool,
    shared: Arc<SharedState>,
}

impl StackDelegate for TestDelegate {
    fn did_accept_tcp_connection(&self, conn: Arc<TcpConnection>, decision: AcceptDecision) {
        let shared = Arc::clone(&self.shared);
        assert_eq!(
            crate::scheduler::current_context(),
            Some(ContextId::Connections)
        );
        {
            let shared = Arc::clone(&shared);
            conn.set_on_terminated(move |_, reason| shared.events.lock().terminated.push(reason));
        }
        if !self.accept {
            decision.accept(false);
            return;
        }
        {
            let shared = Arc::clone(&shared);
            conn.set_on_activated(move |_| shared.events.lock().activated += 1);
        }
        {
            let shared = Arc::clone(&shared);
            let auto_complete = self.auto_complete;
            conn.set_on_readable_bytes(move |_, slices, total, completion| {
                let mut data = Vec::with_capacity(total);
                for slice in slices {
                    data.extend_from_slice(slice);
                }
                assert_eq!(data.len(), total);
                shared.events.lock().readable.push(data);
                if auto_complete {
                    completion.complete();
                } else {
                    shared.completions.lock().push(completion);
                }
            });
        }
        {
            let shared = Arc::clone(&shared);
            conn.set_on_sent_bytes(move |_, sent| shared.events.lock().sent.push(sent));
        }
        {
            let shared = Arc::clone(&shared);
            conn.set_on_writable_changed(move |_, writable| {
                shared.events.lock().writable.push(writable)
            });
        }
        {
            let shared = Arc::clone(&shared);
            conn.set_on_read_eof(move |_| shared.events.lock().eof += 1);
        }
        *shared.conn.lock() = Some(Arc::clone(&conn));
        decision.accept(true);
    }
}

struct Harness {
    stack: Arc<IpStack>,
    shared: Arc<SharedState>,
    _runtime: MutexGuard<'static, ()>,
}

impl Harness {
    fn with_delegate(config: StackConfig, accept: bool, auto_complete: bool) -> Self {
        let harness = Self::bare(config);
        harness.stack.set_delegate(Some(Arc::new(TestDelegate {
            accept,
            auto_complete,
            shared: Arc::clone(&harness.shared),
        })));
        harness
    }

    fn bare(config: StackConfig) -> Self {
        let runtime = testutil::runtime_lock();
        let shared = Arc::new(SharedState::default());
        let stack = IpStack::new(config).expect("stack config");
        {
            let shared = Arc::clone(&shared);
            stack.set_outbound_handler(move |packets, families| {
                assert_eq!(packets.len(), families.len());
                for family in &families {
                    assert_eq!(*family, libc::AF_INET);
                }
                shared.frames.lock().extend(packets);
            });
        }
        stack.start().expect("start");
        Self {
            stack,
            shared,
            _runtime: runtime,
        }
    }

    fn conn(&self) -> Arc<TcpConnection> {
        wait_until("connection handoff", || self.shared.conn.lock().is_some());
        self.shared.conn.lock().clone().expect("connection")
    }

    fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.shared.frames.lock())
    }

    fn events<R>(&self, f: impl FnOnce(&EventLog) -> R) -> R {
        f(&self.shared.events.lock())
    }

    /// Round-trip the packets context so queued stack work has landed.
    fn fence(&self) {
        let _ = self.stack.stats();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stack.stop();
    }
}

fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !pred() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Emulates the TUN-side TCP client: builds checksummed IPv4/TCP segments
/// and tracks both sequence spaces.
struct TunClient {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
}

struct OwnedSegment {
    flags: TcpFlags,
    payload: Vec<u8>,
    /// In-order and previously unseen; retransmits read as stale.
    fresh: bool,
}

impl TunClient {
    fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq: 0x1000,
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

        packet[20..22].copy_from_slice(&self.src_port.to_be_bytes());
        packet[22..24].copy_from_slice(&self.dst_port.to_be_bytes());
        packet[24..28].copy_from_slice(&self.seq.to_be_bytes());
        let ack = if flags & FLAG_ACK != 0 { self.ack } else { 0 };
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

    fn syn(&mut self) -> Vec<u8> {
        let packet = self.segment(FLAG_SYN, &[]);
        self.seq = self.seq.wrapping_add(1);
        packet
    }

    fn ack(&mut self) -> Vec<u8> {
        self.segment(FLAG_ACK, &[])
    }

    fn data(&mut self, payload: &[u8]) -> Vec<u8> {
        let packet = self.segment(FLAG_ACK, payload);
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        packet
    }

    fn fin(&mut self) -> Vec<u8> {
        let packet = self.segment(FLAG_FIN | FLAG_ACK, &[]);
        self.seq = self.seq.wrapping_add(1);
        packet
    }

    fn rst(&mut self) -> Vec<u8> {
        self.segment(FLAG_RST | FLAG_ACK, &[])
    }

    fn absorb(&mut self, segment: &TcpSegment<'_>) -> bool {
        let advance = segment.payload.len() as u32
            + u32::from(segment.flags.syn)
            + u32::from(segment.flags.fin);
        if segment.flags.syn {
            self.ack = segment.seq_number.wrapping_add(advance);
            true
        } else if segment.seq_number == self.ack {
            self.ack = self.ack.wrapping_add(advance);
            true
        } else {
            false
        }
    }
}

fn pump_frames(harness: &Harness, client: &mut TunClient) -> Vec<OwnedSegment> {
    let mut segments = Vec::new();
    for frame in harness.take_frames() {
        if let Ok(ParsedPacket::Tcp(segment)) = parse_ipv4(&frame) {
            let fresh = client.absorb(&segment);
            segments.push(OwnedSegment {
                flags: segment.flags,
                payload: segment.payload.to_vec(),
                fresh,
            });
        }
    }
    segments
}

fn wait_for_tcp_frame(
    harness: &Harness,
    client: &mut TunClient,
    what: &str,
    pred: impl Fn(&OwnedSegment) -> bool,
) -> OwnedSegment {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        for segment in pump_frames(harness, client) {
            if pred(&segment) {
                return segment;
            }
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Accumulate in-order server payload until it equals `expected`.
fn wait_for_payload(harness: &Harness, client: &mut TunClient, expected: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut received = Vec::new();
    while received.len() < expected.len() {
        for segment in pump_frames(harness, client) {
            if segment.fresh {
                received.extend_from_slice(&segment.payload);
            }
        }
        if Instant::now() >= deadline {
            panic!(
                "timed out waiting for payload ({} of {} bytes)",
                received.len(),
                expected.len()
            );
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(received, expected);
}

fn handshake(harness: &Harness, client: &mut TunClient) {
    harness.stack.input_packet(&client.syn());
    wait_for_tcp_frame(harness, client, "SYN-ACK", |segment| {
        segment.flags.syn && segment.flags.ack
    });
    harness.stack.input_packet(&client.ack());
}

#[test]
fn accept_write_close_round_trip() {
    let harness = Harness::with_delegate(test_config(), true, true);
    let mut client = TunClient::new(5000, 80);
    handshake(&harness, &mut client);
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();
    assert_eq!(conn.state(), ConnectionState::Active);
    assert_eq!(conn.info().to_string(), "10.0.0.2:5000 -> 8.8.8.8:80");

    let result = conn.write_bytes(b"hello");
    assert_eq!(result.status, WriteStatus::Ok);
    assert_eq!(result.written, 5);
    wait_for_payload(&harness, &mut client, b"hello");
    harness.stack.input_packet(&client.ack());
    wait_until("sent bytes", || {
        harness.events(|events| events.sent.iter().sum::<usize>() >= 5)
    });

    conn.graceful_close();
    wait_for_tcp_frame(&harness, &mut client, "FIN", |segment| segment.flags.fin);
    harness.stack.input_packet(&client.ack());
    harness.stack.input_packet(&client.fin());
    wait_until("termination", || {
        harness.events(|events| events.terminated == vec![TerminationReason::Close])
    });
    assert!(!conn.alive());
    assert_eq!(conn.state(), ConnectionState::Terminated);
    assert_eq!(conn.termination_reason(), TerminationReason::Close);

    let stats = harness.stack.stats();
    assert_eq!(stats.connections_intercepted, 1);
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.connections_active, 0);
    assert!(stats.packets_received >= 4);
    assert!(stats.packets_sent >= 2);
}

#[test]
fn rejected_flow_resets_without_activation() {
    let harness = Harness::with_delegate(test_config(), false, true);
    let mut client = TunClient::new(5001, 443);
    handshake(&harness, &mut client);
    wait_for_tcp_frame(&harness, &mut client, "RST", |segment| segment.flags.rst);
    wait_until("reset termination", || {
        harness.events(|events| events.terminated == vec![TerminationReason::Reset])
    });
    harness.events(|events| {
        assert_eq!(events.activated, 0);
        assert!(events.readable.is_empty());
    });
    wait_until("reject accounting", || {
        harness.stack.stats().connections_rejected == 1
    });
}

#[test]
fn missing_delegate_rejects_established_flows() {
    let harness = Harness::bare(test_config());
    let mut client = TunClient::new(5002, 443);
    handshake(&harness, &mut client);
    wait_for_tcp_frame(&harness, &mut client, "RST", |segment| segment.flags.rst);
    wait_until("reject accounting", || {
        harness.stack.stats().connections_rejected == 1
    });
}

#[test]
fn write_backpressure_and_writable_edges() {
    let config = StackConfig {
        tcp_tx_buffer_size: 8192,
        ..test_config()
    };
    let harness = Harness::with_delegate(config, true, true);
    let mut client = TunClient::new(5003, 80);
    handshake(&harness, &mut client);
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();

    // A run larger than the whole send buffer can never enqueue.
    let oversized = vec![0xABu8; 65535];
    assert_eq!(conn.write_bytes(&oversized).status, WriteStatus::WouldBlock);
    wait_until("writable(false)", || {
        harness.events(|events| events.writable.contains(&false))
    });

    let payload = vec![0xCDu8; 6000];
    assert_eq!(conn.write_bytes(&payload).status, WriteStatus::Ok);
    assert_eq!(
        conn.write_bytes(&vec![0xEFu8; 6000]).status,
        WriteStatus::WouldBlock
    );

    // ACK everything; the drained buffer must flip writability back on.
    wait_for_payload(&harness, &mut client, &payload);
    harness.stack.input_packet(&client.ack());
    wait_until("writable(true)", || {
        harness.events(|events| events.writable.last() == Some(&true))
    });
    assert!(conn.writable());
    assert_eq!(conn.write_bytes(&vec![0x11u8; 2000]).status, WriteStatus::Ok);

    // Writability edges are monotonic: never two equal values in a row.
    harness.events(|events| {
        for pair in events.writable.windows(2) {
            assert_ne!(pair[0], pair[1], "duplicate writable edge: {:?}", events.writable);
        }
    });
}

#[test]
fn gated_receive_holds_delivery_and_credit() {
    let harness = Harness::with_delegate(test_config(), true, false);
    let mut client = TunClient::new(5004, 80);
    handshake(&harness, &mut client);
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();

    conn.set_inbound_delivery_enabled(false);
    conn.set_inbound_delivery_enabled(false); // idempotent
    harness.fence();

    // Three in-order segments, each under the interface MTU.
    harness.stack.input_packet(&client.data(&vec![1u8; 1400]));
    harness.stack.input_packet(&client.data(&vec![2u8; 1400]));
    harness.stack.input_packet(&client.data(&vec![3u8; 1200]));
    harness.fence();
    thread::sleep(Duration::from_millis(60));
    harness.events(|events| assert!(events.readable.is_empty(), "delivery while gated"));

    conn.set_inbound_delivery_enabled(true);
    let mut delivered = 0usize;
    while delivered < 4000 {
        // Batches arrive one at a time: credit the engine to unlock the next.
        wait_until("gated batch completion", || {
            !harness.shared.completions.lock().is_empty()
        });
        let completion = harness.shared.completions.lock().pop().expect("completion");
        completion.complete();
        delivered = harness.events(|events| events.readable.iter().map(Vec::len).sum());
    }
    assert_eq!(delivered, 4000);

    // Credit restored the window: later data still flows.
    harness.stack.input_packet(&client.data(&vec![4u8; 500]));
    wait_until("post-credit completion", || {
        !harness.shared.completions.lock().is_empty()
    });
    harness
        .shared
        .completions
        .lock()
        .pop()
        .expect("completion")
        .complete();
    wait_until("post-credit delivery", || {
        harness.events(|events| events.readable.iter().map(Vec::len).sum::<usize>() == 4500)
    });
}

#[test]
fn remote_reset_terminates_exactly_once() {
    let harness = Harness::with_delegate(test_config(), true, true);
    let mut client = TunClient::new(5005, 80);
    handshake(&harness, &mut client);
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();

    harness.stack.input_packet(&client.rst());
    wait_until("reset termination", || {
        harness.events(|events| events.terminated == vec![TerminationReason::Reset])
    });

    assert_eq!(conn.write_bytes(b"late").status, WriteStatus::Closed);
    conn.abort();
    conn.graceful_close();
    harness.fence();
    thread::sleep(Duration::from_millis(40));
    harness.events(|events| assert_eq!(events.terminated, vec![TerminationReason::Reset]));
}

#[test]
fn close_and_reset_race_terminates_once() {
    let harness = Harness::with_delegate(test_config(), true, true);
    let mut client = TunClient::new(5006, 80);
    handshake(&harness, &mut client);
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();

    conn.graceful_close();
    harness.stack.input_packet(&client.rst());
    wait_until("single termination", || {
        harness.events(|events| events.terminated.len() == 1)
    });
    thread::sleep(Duration::from_millis(60));
    harness.events(|events| assert_eq!(events.terminated.len(), 1));
}

#[test]
fn peer_fin_fires_eof_without_terminating() {
    let harness = Harness::with_delegate(test_config(), true, true);
    let mut client = TunClient::new(5007, 80);
    handshake(&harness, &mut client);
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();

    harness.stack.input_packet(&client.fin());
    wait_until("read EOF", || harness.events(|events| events.eof == 1));
    assert!(conn.alive());
    harness.events(|events| assert!(events.terminated.is_empty()));

    // Half-closed: the local side still writes.
    assert_eq!(conn.write_bytes(b"late").status, WriteStatus::Ok);
    wait_for_payload(&harness, &mut client, b"late");
    harness.stack.input_packet(&client.ack());

    conn.graceful_close();
    wait_for_tcp_frame(&harness, &mut client, "FIN", |segment| segment.flags.fin);
    harness.stack.input_packet(&client.ack());
    wait_until("close termination", || {
        harness.events(|events| events.terminated == vec![TerminationReason::Close])
    });
    harness.events(|events| assert_eq!(events.eof, 1));
}

#[test]
fn graceful_close_timeout_aborts_stuck_flows() {
    let config = StackConfig {
        graceful_close_timeout: Duration::from_millis(80),
        ..test_config()
    };
    let harness = Harness::with_delegate(config, true, true);
    let mut client = TunClient::new(5008, 80);
    handshake(&harness, &mut client);
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();

    // The peer goes silent; the FIN exchange can never finish.
    conn.graceful_close();
    wait_until("watchdog abort", || {
        harness.events(|events| events.terminated == vec![TerminationReason::Reset])
    });
}

#[test]
fn deadline_flush_paces_outbound_batches() {
    let config = StackConfig {
        flush_interval: Duration::from_millis(40),
        ..test_config()
    };
    let harness = Harness::with_delegate(config, true, true);
    let mut client = TunClient::new(5009, 80);
    harness.stack.input_packet(&client.syn());
    harness.fence();
    assert!(
        harness.take_frames().is_empty(),
        "batch flushed before its deadline"
    );
    let started = Instant::now();
    wait_for_tcp_frame(&harness, &mut client, "SYN-ACK", |segment| {
        segment.flags.syn && segment.flags.ack
    });
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn trigger_flush_bypasses_the_deadline() {
    let config = StackConfig {
        flush_interval: Duration::from_secs(10),
        ..test_config()
    };
    let harness = Harness::with_delegate(config, true, true);
    let mut client = TunClient::new(5010, 80);
    harness.stack.input_packet(&client.syn());
    harness.fence();
    assert!(harness.take_frames().is_empty());
    harness.stack.trigger_flush();
    wait_for_tcp_frame(&harness, &mut client, "SYN-ACK", |segment| {
        segment.flags.syn && segment.flags.ack
    });
}

#[test]
fn packet_threshold_flushes_despite_long_deadline() {
    let config = StackConfig {
        flush_interval: Duration::from_secs(10),
        batch_max_packets: 2,
        ..test_config()
    };
    let harness = Harness::with_delegate(config, true, true);
    let mut client = TunClient::new(5011, 80);
    // The lone SYN-ACK sits under the count threshold; unstick it by hand.
    harness.stack.input_packet(&client.syn());
    harness.stack.trigger_flush();
    wait_for_tcp_frame(&harness, &mut client, "SYN-ACK", |segment| {
        segment.flags.syn && segment.flags.ack
    });
    harness.stack.input_packet(&client.ack());
    wait_until("activation", || harness.events(|events| events.activated == 1));
    let conn = harness.conn();

    // 3000 bytes segment into at least two frames, crossing the count
    // threshold without any deadline help.
    let payload = vec![0x77u8; 3000];
    assert_eq!(conn.write_bytes(&payload).status, WriteStatus::Ok);
    wait_for_payload(&harness, &mut client, &payload);
}

#[test]
fn stop_drops_input_and_restart_recovers() {
    let harness = Harness::with_delegate(test_config(), true, true);
    let mut client = TunClient::new(5012, 80);

    assert!(harness.stack.start().is_ok()); // idempotent while running
    let second = IpStack::new(test_config()).expect("second stack");
    assert!(matches!(second.start(), Err(StackError::AlreadyRunning)));

    harness.stack.stop();
    harness.stack.stop(); // idempotent
    let dropped_before = harness.stack.stats().packets_dropped;
    harness.stack.input_packet(&client.syn());
    wait_until("drop accounting", || {
        harness.stack.stats().packets_dropped > dropped_before
    });

    harness.stack.start().expect("restart");
    assert!(harness.stack.is_running());
    let mut client2 = TunClient::new(5013, 80);
    handshake(&harness, &mut client2);
    wait_until("activation after restart", || {
        harness.events(|events| events.activated == 1)
    });
}

#[test]
fn malformed_packets_are_counted_not_crashed() {
    let harness = Harness::with_delegate(test_config(), true, true);
    harness.stack.input_packet(&[]);
    harness.stack.input_packet(&[0x60; 48]); // IPv6: out of scope
    harness.stack.input_packet(&[0x45; 10]); // truncated header

    // Well-formed UDP is parseable but not forwarded.
    let mut udp = vec![0u8; 28];
    udp[0] = 0x45;
    udp[2..4].copy_from_slice(&28u16.to_be_bytes());
    udp[8] = 64;
    udp[9] = 17;
    udp[12..16].copy_from_slice(&CLIENT_IP.octets());
    udp[16..20].copy_from_slice(&SERVER_IP.octets());
    let ip_checksum = checksum::ipv4_header(&udp[..20]);
    udp[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    harness.stack.input_packet(&udp);

    wait_until("malformed accounting", || {
        let stats = harness.stack.stats();
        stats.malformed_packets == 3 && stats.packets_dropped >= 1
    });
}

#[test]
fn shared_singleton_ignores_later_config() {
    let first = IpStack::shared();
    let again = IpStack::shared_with_config(StackConfig {
        socket_pool_size: 3,
        ..StackConfig::default()
    })
    .expect("shared");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(again.config().socket_pool_size, StackConfig::default().socket_pool_size);
}
