//! Public stream socket (spec S4.7 Send/Receive/Close, S6 options).
//!
//! Generalizes the teacher's `stream.rs`: same `Read`/`Write`/`Drop` shape
//! built on condvars, but against the new `Connection` (one `Mutex<Tcb>`
//! plus its own wait channels) instead of the teacher's shared `Manager` map
//! of raw `TCB`s guarded by one global lock for the stream's entire
//! lifetime.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use super::link::LinkSender;
use super::manager::Connection;
use super::options::{BasicOptions, TcpOptions};
use super::tcb::{Quad, State, Tcb};
use crate::err::{timeout_error, Error};

fn read_ready(tcb: &Tcb) -> bool {
    tcb.readable_len() > 0
        || tcb.peek_last_error().is_some()
        || matches!(
            tcb.state(),
            State::CloseWait | State::Closing | State::LastAck | State::TimeWait | State::Closed
        )
}

/// Blocks a `Send` while `SendBufFree` is zero (spec S4.7 Send, S5
/// suspension points).
fn write_ready(tcb: &Tcb) -> bool {
    !tcb.is_send_full() || tcb.peek_last_error().is_some() || tcb.is_closed()
}

pub struct TcpStream {
    quad: Quad,
    conn: Arc<Connection>,
    link: LinkSender,
}

impl TcpStream {
    pub(crate) fn new(quad: Quad, conn: Arc<Connection>, link: LinkSender) -> Self {
        TcpStream { quad, conn, link }
    }

    pub fn peer_addr(&self) -> (Ipv4Addr, u16) {
        (self.quad.dst.ipv4, self.quad.dst.port)
    }

    pub fn local_addr(&self) -> (Ipv4Addr, u16) {
        (self.quad.src.ipv4, self.quad.src.port)
    }

    /// Blocking read honoring `receive_timeout` (spec S4.7 Receive, S6).
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        let Some(mut tcb) = self.conn.wait_readable(read_ready, timeout) else {
            return Err(timeout_error(timeout == Some(Duration::ZERO)));
        };
        if tcb.readable_len() > 0 {
            let (n, ack) = tcb.read_into(buf);
            drop(tcb);
            if let Some(pkt) = ack {
                let _ = self.link.send(&pkt);
            }
            return Ok(n);
        }
        if let Some(err) = tcb.take_last_error() {
            return Err(err);
        }
        Ok(0)
    }

    pub fn basic_options(&self) -> BasicOptions {
        self.conn.lock().basic_options()
    }

    pub fn set_basic_options(&self, opts: BasicOptions) {
        self.conn.lock().set_basic_options(opts);
    }

    pub fn tcp_options(&self) -> TcpOptions {
        self.conn.lock().tcp_options()
    }

    pub fn set_tcp_options(&self, opts: TcpOptions) {
        self.conn.lock().set_tcp_options(opts);
    }

    /// `UserControl` AtUrgentMark (spec S6, 0x7300).
    pub fn at_urgent_mark(&self) -> bool {
        self.conn.lock().at_urgent_mark()
    }

    /// `UserControl` GetInputQueueSize (spec S6, 0x741B).
    pub fn input_queue_size(&self) -> u32 {
        self.conn.lock().input_queue_size()
    }

    /// Shutdown(READ) (spec S4.7): RSTs immediately if unread data remains.
    pub fn shutdown_read(&self) {
        if let Some(pkt) = self.conn.lock().shutdown_read() {
            let _ = self.link.send(&pkt);
        }
        self.conn.wake_all();
    }

    /// Close (spec S4.7): begins the FIN handshake, then honors `SO_LINGER`
    /// before returning.
    pub fn close(self) -> Result<(), Error> {
        let linger = {
            let mut tcb = self.conn.lock();
            tcb.close();
            tcb.basic_options().linger
        };

        match linger {
            Some(linger) if linger.is_zero() => {
                if let Some(pkt) = self.conn.lock().abort() {
                    let _ = self.link.send(&pkt);
                }
            }
            Some(linger) => {
                if self
                    .conn
                    .wait_writable(|t| t.is_linger_drained() || t.is_closed(), Some(linger))
                    .is_none()
                {
                    if let Some(pkt) = self.conn.lock().abort() {
                        let _ = self.link.send(&pkt);
                    }
                }
            }
            None => {}
        }
        self.conn.wake_all();
        Ok(())
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.conn.lock().basic_options().receive_timeout;
        self.read_timeout(buf, timeout).map_err(Error::into)
    }
}

impl Write for TcpStream {
    /// Blocks while `SendBufFree` is zero (spec S4.7 Send), then queues as
    /// much of `buf` as fits and transmits immediately if the queue was
    /// empty or `NoDelay` is set.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let send_timeout = self.conn.lock().basic_options().send_timeout;
        let Some(mut tcb) = self.conn.wait_writable(write_ready, send_timeout) else {
            return Err(timeout_error(send_timeout == Some(Duration::ZERO)).into());
        };
        if let Some(err) = tcb.take_last_error() {
            return Err(err.into());
        }
        if tcb.is_closed() {
            return Err(Error::BrokenPipe.into());
        }
        let (n, packets) = tcb.queue_write(buf);
        drop(tcb);
        for pkt in &packets {
            let _ = self.link.send(pkt);
        }
        self.conn.wake(false, false, false);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let mut tcb = self.conn.lock();
        if !tcb.is_closed() {
            tcb.close();
        }
        drop(tcb);
        self.conn.wake_all();
    }
}
