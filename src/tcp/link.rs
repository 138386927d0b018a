//! IPv4/TUN link shim (spec S1 "OUT OF SCOPE ... consumed via narrow
//! interfaces"). Not the object of specification — just enough plumbing,
//! grounded in the teacher's `lib.rs::segment_loop` (raw `Tun::read`/`write`
//! plus `nix::poll`), for the state machine in `tcb.rs` to be exercised
//! end-to-end by the two `bin` targets and integration tests.

use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

use crate::err::Error;

pub struct Link {
    tun: Tun,
    pub local_addr: Ipv4Addr,
}

/// A cloneable handle for transmitting control packets (RSTs from `abort`,
/// `shutdown(Read)`) from a socket-API caller's own thread, bypassing the
/// worker's recv loop entirely. Raw-fd writes to a TUN device are delivered
/// one packet per `write(2)`, so concurrent senders never need to serialize
/// through the worker the way inbound reads do.
#[derive(Clone, Copy)]
pub struct LinkSender {
    fd: RawFd,
}

impl LinkSender {
    pub fn send(&self, packet: &[u8]) -> Result<(), Error> {
        nix::unistd::write(self.fd, packet)
            .map(|_| ())
            .map_err(|e| Error::TunError(e.to_string()))
    }
}

/// One fully-parsed inbound frame, borrowed from the caller's scratch buffer.
pub struct Inbound<'a> {
    pub ip4h: Ipv4HeaderSlice<'a>,
    pub tcph: TcpHeaderSlice<'a>,
    pub data: &'a [u8],
    /// Whether the link already vouches for the checksum (spec S4.1); a
    /// plain TUN device never does, so the engine always re-derives it.
    pub checksum: super::codec::ChecksumState,
}

impl Link {
    pub fn open(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;
        Ok(Link { tun, local_addr: addr })
    }

    pub fn send(&mut self, packet: &[u8]) -> Result<(), Error> {
        self.sender().send(packet)
    }

    pub fn sender(&self) -> LinkSender {
        LinkSender {
            fd: self.tun.as_raw_fd(),
        }
    }

    /// Blocks up to `timeout_ms` for an inbound packet. Drops (returns
    /// `Ok(None)`) anything that fails to parse as IPv4+TCP rather than
    /// erroring the whole link (spec S7 "Checksum/length failures drop
    /// silently").
    pub fn recv<'a>(&mut self, buf: &'a mut [u8], timeout_ms: i32) -> Result<Option<usize>, Error> {
        let mut pfd = [PollFd::new(self.tun.as_raw_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut pfd[..], timeout_ms).map_err(|e| Error::TunError(e.to_string()))?;
        if ready == 0 {
            return Ok(None);
        }
        let n = self
            .tun
            .read(buf)
            .map_err(|e| Error::TunError(e.to_string()))?;
        Ok(Some(n))
    }

    pub fn parse<'a>(buf: &'a [u8]) -> Option<Inbound<'a>> {
        let ip4h = Ipv4HeaderSlice::from_slice(buf).ok()?;
        let ihl = (ip4h.ihl() * 4) as usize;
        let tcph = TcpHeaderSlice::from_slice(&buf[ihl..]).ok()?;
        let data_off = ihl + (tcph.data_offset() * 4) as usize;
        if data_off > buf.len() {
            return None;
        }
        let data = &buf[data_off..];
        Some(Inbound {
            ip4h,
            tcph,
            data,
            checksum: super::codec::ChecksumState::NotOffloaded,
        })
    }
}
