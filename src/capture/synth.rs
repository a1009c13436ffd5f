//! Synthetic Ethernet/IPv4/TCP frame generation for decrypted traffic.
//!
//! Each connection gets its own session which fabricates a plausible
//! TCP conversation (handshake, PSH+ACK data, FIN teardown) between
//! sentinel MAC addresses, so the decrypted bytes open cleanly in any
//! pcap tooling. Every write is best effort; a capture failure is
//! logged and never propagates into the relay path.

use crate::capture::writer::CaptureWriter;
use crate::error::CaptureError;
use crate::filter::Direction;
use etherparse::PacketBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

const CLIENT_MAC: [u8; 6] = [0x11; 6];
const SERVER_MAC: [u8; 6] = [0x22; 6];

const CLIENT_SEQ_BASE: u32 = 1_000;
const SERVER_SEQ_BASE: u32 = 1_000_000;

/// Payload bytes per synthesized segment.
const MAX_FRAGMENT: usize = 1400;

const TTL: u8 = 64;
const WINDOW: u16 = 65535;

#[derive(Clone, Copy)]
struct Endpoint {
    ip: [u8; 4],
    port: u16,
}

struct Flow {
    client: Endpoint,
    server: Endpoint,
    client_seq: u32,
    server_seq: u32,
}

pub struct CaptureSession {
    writer: Arc<CaptureWriter>,
    flow: Option<Flow>,
    finished: bool,
}

fn endpoint(addr: SocketAddr) -> Option<Endpoint> {
    match addr {
        SocketAddr::V4(v4) => Some(Endpoint {
            ip: v4.ip().octets(),
            port: v4.port(),
        }),
        SocketAddr::V6(_) => None,
    }
}

struct Segment {
    src: Endpoint,
    dst: Endpoint,
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    seq: u32,
    ack: Option<u32>,
    syn: bool,
    psh: bool,
    fin: bool,
}

fn build_frame(seg: &Segment, payload: &[u8]) -> Result<Vec<u8>, CaptureError> {
    let builder = PacketBuilder::ethernet2(seg.src_mac, seg.dst_mac)
        .ipv4(seg.src.ip, seg.dst.ip, TTL)
        .tcp(seg.src.port, seg.dst.port, seg.seq, WINDOW);
    let builder = if seg.syn { builder.syn() } else { builder };
    let builder = if seg.psh { builder.psh() } else { builder };
    let builder = if seg.fin { builder.fin() } else { builder };
    let builder = match seg.ack {
        Some(ack) => builder.ack(ack),
        None => builder,
    };

    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut frame, payload)
        .map_err(|e| CaptureError::Write(e.to_string()))?;
    Ok(frame)
}

impl CaptureSession {
    /// Opens the session and writes the fabricated three-way handshake.
    /// Non-IPv4 peers are skipped with a warning; the session then
    /// records nothing.
    pub fn new(
        writer: Arc<CaptureWriter>,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        conn_id: &str,
    ) -> Self {
        let flow = match (endpoint(client_addr), endpoint(server_addr)) {
            (Some(client), Some(server)) => Some(Flow {
                client,
                server,
                client_seq: CLIENT_SEQ_BASE,
                server_seq: SERVER_SEQ_BASE,
            }),
            _ => {
                warn!(
                    conn_id = %conn_id,
                    client = %client_addr,
                    server = %server_addr,
                    "capture skipped: endpoints not representable as IPv4"
                );
                None
            }
        };

        let mut session = Self {
            writer,
            flow,
            finished: false,
        };
        session.handshake(conn_id);
        session
    }

    fn emit(&self, seg: &Segment, payload: &[u8], conn_id: &str) {
        let result = build_frame(seg, payload).and_then(|frame| self.writer.write_frame(&frame));
        if let Err(e) = result {
            warn!(conn_id = %conn_id, error = %e, "capture write failed");
        }
    }

    fn client_to_server(flow: &Flow) -> ([u8; 6], [u8; 6], Endpoint, Endpoint) {
        (CLIENT_MAC, SERVER_MAC, flow.client, flow.server)
    }

    fn server_to_client(flow: &Flow) -> ([u8; 6], [u8; 6], Endpoint, Endpoint) {
        (SERVER_MAC, CLIENT_MAC, flow.server, flow.client)
    }

    fn handshake(&mut self, conn_id: &str) {
        let Some(flow) = &mut self.flow else { return };

        let (cmac, smac, client, server) = (CLIENT_MAC, SERVER_MAC, flow.client, flow.server);
        let syn = Segment {
            src: client,
            dst: server,
            src_mac: cmac,
            dst_mac: smac,
            seq: flow.client_seq,
            ack: None,
            syn: true,
            psh: false,
            fin: false,
        };
        let syn_ack = Segment {
            src: server,
            dst: client,
            src_mac: smac,
            dst_mac: cmac,
            seq: flow.server_seq,
            ack: Some(flow.client_seq.wrapping_add(1)),
            syn: true,
            psh: false,
            fin: false,
        };
        flow.client_seq = flow.client_seq.wrapping_add(1);
        flow.server_seq = flow.server_seq.wrapping_add(1);
        let ack = Segment {
            src: client,
            dst: server,
            src_mac: cmac,
            dst_mac: smac,
            seq: flow.client_seq,
            ack: Some(flow.server_seq),
            syn: false,
            psh: false,
            fin: false,
        };

        let segments = [syn, syn_ack, ack];
        for seg in &segments {
            self.emit(seg, &[], conn_id);
        }
    }

    /// Record one relayed chunk, fragmenting into PSH+ACK segments.
    pub fn record(&mut self, direction: Direction, data: &[u8], conn_id: &str) {
        if data.is_empty() {
            return;
        }
        let Some(flow) = &mut self.flow else { return };

        let mut segments = Vec::with_capacity(data.len().div_ceil(MAX_FRAGMENT));
        for fragment in data.chunks(MAX_FRAGMENT) {
            let ((src_mac, dst_mac, src, dst), seq, ack) = match direction {
                Direction::ClientToServer => (
                    Self::client_to_server(flow),
                    flow.client_seq,
                    flow.server_seq,
                ),
                Direction::ServerToClient => (
                    Self::server_to_client(flow),
                    flow.server_seq,
                    flow.client_seq,
                ),
            };
            match direction {
                Direction::ClientToServer => {
                    flow.client_seq = flow.client_seq.wrapping_add(fragment.len() as u32)
                }
                Direction::ServerToClient => {
                    flow.server_seq = flow.server_seq.wrapping_add(fragment.len() as u32)
                }
            }
            segments.push((
                Segment {
                    src,
                    dst,
                    src_mac,
                    dst_mac,
                    seq,
                    ack: Some(ack),
                    syn: false,
                    psh: true,
                    fin: false,
                },
                fragment,
            ));
        }

        for (seg, fragment) in &segments {
            self.emit(seg, fragment, conn_id);
        }
    }

    /// Write the FIN/ACK teardown. Idempotent; later calls are no-ops.
    pub fn finish(&mut self, conn_id: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        let Some(flow) = &mut self.flow else { return };

        let (cmac, smac, client, server) = (CLIENT_MAC, SERVER_MAC, flow.client, flow.server);
        let client_fin = Segment {
            src: client,
            dst: server,
            src_mac: cmac,
            dst_mac: smac,
            seq: flow.client_seq,
            ack: Some(flow.server_seq),
            syn: false,
            psh: false,
            fin: true,
        };
        flow.client_seq = flow.client_seq.wrapping_add(1);
        let server_fin = Segment {
            src: server,
            dst: client,
            src_mac: smac,
            dst_mac: cmac,
            seq: flow.server_seq,
            ack: Some(flow.client_seq),
            syn: false,
            psh: false,
            fin: true,
        };
        flow.server_seq = flow.server_seq.wrapping_add(1);
        let last_ack = Segment {
            src: client,
            dst: server,
            src_mac: cmac,
            dst_mac: smac,
            seq: flow.client_seq,
            ack: Some(flow.server_seq),
            syn: false,
            psh: false,
            fin: false,
        };

        let segments = [client_fin, server_fin, last_ack];
        for seg in &segments {
            self.emit(seg, &[], conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, CaptureFormat};
    use etherparse::{PacketHeaders, TransportHeader};
    use pcap_file::pcap::PcapReader;
    use std::fs::File;

    fn test_writer(dir: &std::path::Path) -> Arc<CaptureWriter> {
        let cfg = CaptureConfig {
            enabled: true,
            directory: dir.to_path_buf(),
            format: CaptureFormat::Pcap,
            rotate_secs: 60,
            service_name: "synthtest".into(),
        };
        Arc::new(CaptureWriter::new(&cfg).unwrap())
    }

    fn tcp_headers(path: &std::path::Path) -> Vec<(etherparse::TcpHeader, Vec<u8>)> {
        let mut reader = PcapReader::new(File::open(path).unwrap()).unwrap();
        let mut out = Vec::new();
        while let Some(pkt) = reader.next_packet() {
            let pkt = pkt.unwrap();
            let headers = PacketHeaders::from_ethernet_slice(&pkt.data).unwrap();
            let Some(TransportHeader::Tcp(tcp)) = headers.transport else {
                panic!("non-tcp frame in capture");
            };
            out.push((tcp, headers.payload.slice().to_vec()));
        }
        out
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "10.0.0.5:54321".parse().unwrap(),
            "10.0.0.9:8080".parse().unwrap(),
        )
    }

    #[test]
    fn handshake_then_data_then_fin_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = test_writer(dir.path());
        let (client, server) = addrs();

        let mut session = CaptureSession::new(writer.clone(), client, server, "10.0.0.5:54321");
        session.record(Direction::ClientToServer, b"GET / HTTP/1.1\r\n\r\n", "c");
        session.record(Direction::ServerToClient, b"HTTP/1.1 200 OK\r\n\r\n", "c");
        session.finish("c");

        let path = writer.rotate().unwrap();
        let packets = tcp_headers(&path);
        assert_eq!(packets.len(), 8);

        // Handshake.
        assert!(packets[0].0.syn && !packets[0].0.ack);
        assert_eq!(packets[0].0.sequence_number, 1_000);
        assert!(packets[1].0.syn && packets[1].0.ack);
        assert_eq!(packets[1].0.sequence_number, 1_000_000);
        assert_eq!(packets[1].0.acknowledgment_number, 1_001);
        assert!(!packets[2].0.syn && packets[2].0.ack);
        assert_eq!(packets[2].0.acknowledgment_number, 1_000_001);

        // Data carries the decrypted payload with PSH set.
        assert!(packets[3].0.psh);
        assert_eq!(packets[3].1, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(packets[3].0.sequence_number, 1_001);
        assert!(packets[4].0.psh);
        assert_eq!(packets[4].1, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(packets[4].0.sequence_number, 1_000_001);

        // Teardown.
        assert!(packets[5].0.fin);
        assert!(packets[6].0.fin);
        assert!(!packets[7].0.fin && packets[7].0.ack);
    }

    #[test]
    fn sequence_numbers_are_monotonic_per_direction() {
        let dir = tempfile::tempdir().unwrap();
        let writer = test_writer(dir.path());
        let (client, server) = addrs();

        let mut session = CaptureSession::new(writer.clone(), client, server, "c");
        let big = vec![b'x'; 4000];
        session.record(Direction::ClientToServer, &big, "c");
        session.record(Direction::ServerToClient, &big, "c");
        session.finish("c");

        let path = writer.rotate().unwrap();
        let packets = tcp_headers(&path);

        let mut last_client = 0u32;
        let mut last_server = 0u32;
        for (tcp, _) in &packets {
            if tcp.source_port == 54321 {
                assert!(tcp.sequence_number >= last_client);
                last_client = tcp.sequence_number;
            } else {
                assert!(tcp.sequence_number >= last_server);
                last_server = tcp.sequence_number;
            }
        }
    }

    #[test]
    fn large_chunk_is_fragmented() {
        let dir = tempfile::tempdir().unwrap();
        let writer = test_writer(dir.path());
        let (client, server) = addrs();

        let mut session = CaptureSession::new(writer.clone(), client, server, "c");
        session.record(Direction::ServerToClient, &vec![b'y'; 3000], "c");

        let path = writer.rotate().unwrap();
        let packets = tcp_headers(&path);
        let data: Vec<_> = packets.iter().filter(|(t, _)| t.psh).collect();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0].1.len(), 1400);
        assert_eq!(data[1].1.len(), 1400);
        assert_eq!(data[2].1.len(), 200);
        let total: Vec<u8> = data.iter().flat_map(|(_, p)| p.iter().copied()).collect();
        assert_eq!(total, vec![b'y'; 3000]);
    }

    #[test]
    fn ipv6_peer_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = test_writer(dir.path());
        let client: SocketAddr = "[::1]:4000".parse().unwrap();
        let server: SocketAddr = "10.0.0.9:8080".parse().unwrap();

        let mut session = CaptureSession::new(writer.clone(), client, server, "c");
        session.record(Direction::ClientToServer, b"hello", "c");
        session.finish("c");

        let path = writer.rotate().unwrap();
        let mut reader = PcapReader::new(File::open(&path).unwrap()).unwrap();
        assert!(reader.next_packet().is_none());
    }

    #[test]
    fn finish_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let writer = test_writer(dir.path());
        let (client, server) = addrs();

        let mut session = CaptureSession::new(writer.clone(), client, server, "c");
        session.finish("c");
        session.finish("c");

        let path = writer.rotate().unwrap();
        // Handshake (3) + teardown (3), written once.
        assert_eq!(tcp_headers(&path).len(), 6);
    }
}
