//! Public listener socket (spec S3 "Incoming connection entry", S4.7
//! Accept).
//!
//! Generalizes the teacher's `listen.rs`: same accept-pops-backlog,
//! drop-unbinds-port shape, but against `ListenerState`'s own backlog lock
//! (spec S5: "a listener's `IncomingConnectionList` is protected by the
//! listener's own lock") instead of scanning `Manager.established` under the
//! single global lock every other `Manager` method also takes.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::link::LinkSender;
use super::manager::{ListenerState, Manager};
use super::options::{BasicOptions, TcpOptions};
use super::stream::TcpStream;
use crate::err::{timeout_error, Error};

pub struct TcpListener {
    port: u16,
    registry: Arc<Mutex<Manager>>,
    state: Arc<ListenerState>,
    link: LinkSender,
}

impl TcpListener {
    pub(crate) fn new(port: u16, registry: Arc<Mutex<Manager>>, state: Arc<ListenerState>, link: LinkSender) -> Self {
        TcpListener {
            port,
            registry,
            state,
            link,
        }
    }

    pub fn basic_options(&self) -> BasicOptions {
        let mut opts = *self.state.basic_opts.lock().unwrap();
        opts.accept_connections = true;
        opts
    }

    pub fn set_basic_options(&self, opts: BasicOptions) {
        *self.state.basic_opts.lock().unwrap() = opts;
    }

    pub fn tcp_options(&self) -> TcpOptions {
        *self.state.tcp_opts.lock().unwrap()
    }

    pub fn set_tcp_options(&self, opts: TcpOptions) {
        *self.state.tcp_opts.lock().unwrap() = opts;
    }

    /// Accept (spec S4.7): pops the oldest half-open child (already driven
    /// into SynReceived at the moment its SYN arrived), then blocks on that
    /// specific connection until it reaches Established/CloseWait.
    pub fn accept(&self) -> Result<TcpStream, Error> {
        self.accept_timeout(None)
    }

    /// Accept with an optional wait bound (spec S4.7 "blocks ... or returns
    /// would-block"; S5 suspension points). `timeout: None` blocks
    /// indefinitely, as `accept` does; `Some(Duration::ZERO)` is the
    /// non-blocking form.
    pub fn accept_timeout(&self, timeout: Option<Duration>) -> Result<TcpStream, Error> {
        let non_blocking = timeout == Some(Duration::ZERO);
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(timeout_error(non_blocking));
                    }
                    Some(left)
                }
            };

            let Some(quad) = self.state.pop_timeout(remaining) else {
                return Err(timeout_error(non_blocking));
            };
            let conn = self.registry.lock().unwrap().peek_connection(&quad);
            let Some(conn) = conn else { continue };

            match conn.wait_settled() {
                Ok(()) => return Ok(TcpStream::new(quad, conn, self.link)),
                Err(_) => continue,
            }
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.registry.lock().unwrap().remove_listener(self.port);
    }
}
