//! Wire encode/decode (spec S4.1, S6).
//!
//! The teacher never hand-rolls TCP/IP parsing or checksums — it leans
//! entirely on `etherparse` (`ioutil.rs`'s `generate_reset`/`generate_synack`,
//! and `tcb.rs`'s `TcpHeaderSlice`/`Ipv4HeaderSlice` reads). This module keeps
//! that choice and fills in the segment kinds `ioutil.rs` never got around to
//! (bare ACK, data, SYN) plus the MSS/window-scale option pair spec S4.1/S6
//! name.

use std::io::Cursor;
use std::net::Ipv4Addr;

use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice, TcpOptionElement};

use super::send::OutFlags;
use super::tcb::Quad;
use crate::err::Error;

pub const IP_TTL: u8 = 64;
pub const IP_PROTO_TCP: u8 = 6;

/// Parsed MSS/window-scale options, the only two this engine understands;
/// everything else is skipped via its length byte (spec S4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
}

/// Whether the link layer already validated (or offloaded) this segment's
/// checksum, per spec S4.1 "a received value of 0 means not offloaded or
/// valid per the link-capability flag". A plain TUN device offers no
/// offload, so the engine always re-derives it from the wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumState {
    NotOffloaded,
    OffloadedValid,
}

/// Verifies the one's-complement checksum over the pseudo-header + TCP
/// header + payload (spec S4.1). Checksum/length failures are meant to drop
/// the segment silently (spec S7) — the caller decides what "silently"
/// means; this function only answers true/false.
pub fn verify_checksum(ip4h: &Ipv4HeaderSlice, tcph: &TcpHeaderSlice, data: &[u8]) -> bool {
    let received = tcph.checksum();
    let owned_tcph = tcph.to_header();
    let owned_ip4h = ip4h.to_header();
    match owned_tcph.calc_checksum_ipv4(&owned_ip4h, data) {
        Ok(expected) => expected == received,
        Err(_) => false,
    }
}

pub fn parse_options(tcph: &TcpHeaderSlice) -> ParsedOptions {
    let mut parsed = ParsedOptions::default();
    for opt in tcph.options_iterator() {
        match opt {
            Ok(TcpOptionElement::MaximumSegmentSize(mss)) => parsed.mss = Some(mss),
            Ok(TcpOptionElement::WindowScale(scale)) => parsed.window_scale = Some(scale),
            _ => {}
        }
    }
    parsed
}

fn build_options(mss: Option<u16>, window_scale: Option<u8>) -> Vec<TcpOptionElement> {
    let mut opts = Vec::new();
    if let Some(mss) = mss {
        opts.push(TcpOptionElement::MaximumSegmentSize(mss));
    }
    if let Some(scale) = window_scale {
        opts.push(TcpOptionElement::WindowScale(scale));
    }
    opts
}

#[allow(clippy::too_many_arguments)]
fn build_packet(
    quad: &Quad,
    seq: u32,
    ack: u32,
    window: u16,
    flags: OutFlags,
    rst: bool,
    with_ack_flag: bool,
    mss: Option<u16>,
    window_scale: Option<u8>,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut tcph = TcpHeader::new(quad.src.port, quad.dst.port, seq, window);
    tcph.acknowledgment_number = ack;
    tcph.ack = with_ack_flag;
    tcph.rst = rst;
    tcph.syn = flags.syn;
    tcph.fin = flags.fin;
    tcph.psh = flags.psh;
    tcph.urg = flags.urg;

    let opts = build_options(mss, window_scale);
    if !opts.is_empty() {
        tcph.set_options(&opts)
            .map_err(|e| Error::InvalidParameter(e.to_string()))?;
    }

    let ip4h = Ipv4Header::new(
        tcph.header_len() + payload.len() as u16,
        IP_TTL,
        IP_PROTO_TCP,
        quad.src.ipv4.octets(),
        quad.dst.ipv4.octets(),
    );

    tcph.checksum = tcph
        .calc_checksum_ipv4(&ip4h, payload)
        .map_err(|e| Error::InvalidParameter(e.to_string()))?;

    let mut buf = Vec::with_capacity(ip4h.header_len() + tcph.header_len() as usize + payload.len());
    let mut cursor = Cursor::new(&mut buf);
    ip4h.write(&mut cursor).map_err(|_| Error::InsufficientResources)?;
    tcph.write(&mut cursor).map_err(|_| Error::InsufficientResources)?;
    std::io::Write::write_all(&mut cursor, payload).map_err(|_| Error::InsufficientResources)?;

    Ok(buf)
}

pub fn build_rst(quad: &Quad, seq: u32, ack: u32) -> Result<Vec<u8>, Error> {
    build_packet(
        quad,
        seq,
        ack,
        0,
        OutFlags::default(),
        true,
        true,
        None,
        None,
        &[],
    )
}

/// Builds the RST this engine sends for a segment arriving at a Closed
/// socket (spec S4.6): sequence from the incoming ACK if present, else zero
/// with ack = incoming seq + len.
pub fn build_rst_for_unknown(
    ip4h: &Ipv4HeaderSlice,
    tcph: &TcpHeaderSlice,
    data_len: usize,
) -> Result<Vec<u8>, Error> {
    let quad = Quad {
        src: super::tcb::Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        },
        dst: super::tcb::Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        },
    };

    if tcph.ack() {
        build_rst(&quad, tcph.acknowledgment_number(), 0)
    } else {
        let seg_len = data_len as u32 + if tcph.syn() { 1 } else { 0 } + if tcph.fin() { 1 } else { 0 };
        build_rst(&quad, 0, tcph.sequence_number().wrapping_add(seg_len))
    }
}

pub fn build_syn(quad: &Quad, iss: u32, window: u16, mss: u16, window_scale: u8) -> Result<Vec<u8>, Error> {
    build_packet(
        quad,
        iss,
        0,
        window,
        OutFlags {
            syn: true,
            ..OutFlags::default()
        },
        false,
        false,
        Some(mss),
        Some(window_scale),
        &[],
    )
}

pub fn build_synack(
    quad: &Quad,
    iss: u32,
    ack: u32,
    window: u16,
    mss: u16,
    window_scale: u8,
) -> Result<Vec<u8>, Error> {
    build_packet(
        quad,
        iss,
        ack,
        window,
        OutFlags {
            syn: true,
            ..OutFlags::default()
        },
        false,
        true,
        Some(mss),
        Some(window_scale),
        &[],
    )
}

pub fn build_ack(quad: &Quad, seq: u32, ack: u32, window: u16) -> Result<Vec<u8>, Error> {
    build_packet(quad, seq, ack, window, OutFlags::default(), false, true, None, None, &[])
}

#[allow(clippy::too_many_arguments)]
pub fn build_data(
    quad: &Quad,
    seq: u32,
    ack: u32,
    window: u16,
    flags: OutFlags,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    build_packet(quad, seq, ack, window, flags, false, true, None, None, payload)
}

pub fn ipv4_of(addr: Ipv4Addr) -> [u8; 4] {
    addr.octets()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::tcb::Dual;

    fn quad() -> Quad {
        Quad {
            src: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port: 9090,
            },
            dst: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 2),
                port: 34343,
            },
        }
    }

    fn roundtrip(buf: &[u8]) -> (Ipv4HeaderSlice, TcpHeaderSlice) {
        let ip4h = Ipv4HeaderSlice::from_slice(buf).unwrap();
        let ihl = (ip4h.ihl() * 4) as usize;
        let tcph = TcpHeaderSlice::from_slice(&buf[ihl..]).unwrap();
        (ip4h, tcph)
    }

    #[test]
    fn checksum_validates_well_formed_segment() {
        let pkt = build_data(
            &quad(),
            100,
            200,
            64240,
            OutFlags { psh: true, ..OutFlags::default() },
            b"hello",
        )
        .unwrap();
        let (ip4h, tcph) = roundtrip(&pkt);
        let ihl = (ip4h.ihl() * 4) as usize;
        let data_off = ihl + (tcph.data_offset() * 4) as usize;
        assert!(verify_checksum(&ip4h, &tcph, &pkt[data_off..]));
    }

    #[test]
    fn checksum_rejects_corrupted_payload() {
        let mut pkt = build_data(&quad(), 100, 200, 64240, OutFlags::default(), b"hello").unwrap();
        let last = pkt.len() - 1;
        pkt[last] ^= 0xff;
        let (ip4h, tcph) = roundtrip(&pkt);
        let ihl = (ip4h.ihl() * 4) as usize;
        let data_off = ihl + (tcph.data_offset() * 4) as usize;
        assert!(!verify_checksum(&ip4h, &tcph, &pkt[data_off..]));
    }

    #[test]
    fn parses_mss_and_window_scale_options() {
        let pkt = build_syn(&quad(), 500, 64240, 1460, 8).unwrap();
        let (_ip4h, tcph) = roundtrip(&pkt);
        let opts = parse_options(&tcph);
        assert_eq!(opts.mss, Some(1460));
        assert_eq!(opts.window_scale, Some(8));
    }

    #[test]
    fn rst_for_unknown_uses_incoming_ack_when_present() {
        let ack_pkt = build_ack(&quad(), 10, 500, 1000).unwrap();
        let (ip4h, tcph) = roundtrip(&ack_pkt);
        let rst = build_rst_for_unknown(&ip4h, &tcph, 0).unwrap();
        let (_, rst_tcph) = roundtrip(&rst);
        assert!(rst_tcph.rst());
        assert_eq!(rst_tcph.sequence_number(), 500);
    }
}
