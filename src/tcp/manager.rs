//! Connection registry, timer worker, and inbound segment demux (spec S5,
//! S2 "Control flow", S9 "Global-state reshape").
//!
//! Generalizes the teacher's `lib.rs::{Manager, NetStack, segment_loop}`: the
//! single `Mutex<Manager>` the teacher locks for an entire segment's lifetime
//! becomes the "global registry lock" of spec S5, held only to look up or
//! install a `Quad`; each `Connection` then gets its own `Mutex<Tcb>` (the
//! "queued lock per socket"), acquired after the registry lock is released,
//! matching the documented registry-then-connection acquisition order.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::TcpConfig;
use crate::err::Error;

use super::codec;
use super::link::{Link, LinkSender};
use super::options::{BasicOptions, TcpOptions};
use super::tcb::{Action, Dual, Kind, Quad, State, Tcb};

/// Per-connection wakeup channels (spec S5 suspension points), one `Condvar`
/// per event kind, generalizing the teacher's `rvar`/`wvar`/`svar` split with
/// an added `estab` condvar for Connect/Accept (the teacher never implements
/// Connect, and Accept only waits on the listener, never on the child).
#[derive(Default)]
struct Waiters {
    readable: Condvar,
    writable: Condvar,
    closed: Condvar,
    estab: Condvar,
}

/// One registry entry: a `Tcb` behind its own lock, reachable only by cloning
/// the `Arc` while the registry lock is held (spec S5 two-lock hierarchy).
pub(crate) struct Connection {
    tcb: Mutex<Tcb>,
    waiters: Waiters,
}

impl Connection {
    fn new(tcb: Tcb) -> Arc<Self> {
        Arc::new(Connection {
            tcb: Mutex::new(tcb),
            waiters: Waiters::default(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap()
    }

    pub(crate) fn wake(&self, reader: bool, writer: bool, closer: bool) {
        if reader {
            self.waiters.readable.notify_all();
        }
        if writer {
            self.waiters.writable.notify_all();
        }
        if closer {
            self.waiters.closed.notify_all();
        }
    }

    pub(crate) fn wake_all(&self) {
        self.waiters.readable.notify_all();
        self.waiters.writable.notify_all();
        self.waiters.closed.notify_all();
        self.waiters.estab.notify_all();
    }

    /// Blocks on the named condvar until `ready` holds or `timeout` elapses.
    /// `timeout: None` waits indefinitely. Returns `None` on timeout.
    fn wait_on(
        &self,
        cvar: &Condvar,
        ready: impl Fn(&Tcb) -> bool,
        timeout: Option<Duration>,
    ) -> Option<MutexGuard<'_, Tcb>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut tcb = self.lock();
        loop {
            if ready(&tcb) {
                return Some(tcb);
            }
            match deadline {
                None => tcb = cvar.wait(tcb).unwrap(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (guard, result) = cvar.wait_timeout(tcb, remaining).unwrap();
                    tcb = guard;
                    if result.timed_out() && !ready(&tcb) {
                        return None;
                    }
                }
            }
        }
    }

    pub(crate) fn wait_readable(
        &self,
        ready: impl Fn(&Tcb) -> bool,
        timeout: Option<Duration>,
    ) -> Option<MutexGuard<'_, Tcb>> {
        self.wait_on(&self.waiters.readable, ready, timeout)
    }

    pub(crate) fn wait_writable(
        &self,
        ready: impl Fn(&Tcb) -> bool,
        timeout: Option<Duration>,
    ) -> Option<MutexGuard<'_, Tcb>> {
        self.wait_on(&self.waiters.writable, ready, timeout)
    }

    /// Blocks until the connection reaches Established/CloseWait (Ok) or is
    /// destroyed (Err, carrying whatever last-error was latched) — the
    /// common tail of spec S4.7 Connect and the per-child half of Accept.
    pub(crate) fn wait_settled(&self) -> Result<(), Error> {
        let mut tcb = self.lock();
        loop {
            match tcb.state() {
                State::Estab | State::CloseWait => return Ok(()),
                State::Closed => {
                    return Err(tcb.peek_last_error().unwrap_or(Error::ConnectionReset));
                }
                _ => {}
            }
            tcb = self.waiters.estab.wait(tcb).unwrap();
        }
    }
}

/// A listening socket's incoming-connection backlog (spec S3 "Incoming
/// connection entry", S4.7 Accept), protected by its own lock independent of
/// the registry (spec S5: "a listener's `IncomingConnectionList` is
/// protected by the listener's own lock").
pub(crate) struct ListenerState {
    pub config: TcpConfig,
    pub basic_opts: Mutex<BasicOptions>,
    pub tcp_opts: Mutex<TcpOptions>,
    backlog: Mutex<VecDeque<Quad>>,
    cvar: Condvar,
    capacity: usize,
}

impl ListenerState {
    fn push(&self, quad: Quad) -> bool {
        let mut backlog = self.backlog.lock().unwrap();
        if backlog.len() >= self.capacity {
            return false;
        }
        backlog.push_back(quad);
        self.cvar.notify_one();
        true
    }

    fn remove(&self, quad: &Quad) {
        self.backlog.lock().unwrap().retain(|q| q != quad);
    }

    /// Pops the backlog head (spec S4.7: "on concurrent accept, head-pop is
    /// atomic under the listener lock").
    pub(crate) fn pop(&self) -> Quad {
        self.pop_timeout(None).expect("unbounded wait never times out")
    }

    /// Bounded form of `pop`: returns `None` once `timeout` elapses with the
    /// backlog still empty.
    pub(crate) fn pop_timeout(&self, timeout: Option<Duration>) -> Option<Quad> {
        let mut backlog = self.backlog.lock().unwrap();
        loop {
            if let Some(quad) = backlog.pop_front() {
                return Some(quad);
            }
            match timeout {
                None => backlog = self.cvar.wait(backlog).unwrap(),
                Some(d) => {
                    let (guard, result) = self.cvar.wait_timeout(backlog, d).unwrap();
                    backlog = guard;
                    if result.timed_out() && backlog.is_empty() {
                        return None;
                    }
                }
            }
        }
    }
}

#[derive(Default)]
pub struct Manager {
    listeners: HashMap<u16, Arc<ListenerState>>,
    connections: HashMap<Quad, Arc<Connection>>,
    next_ephemeral: u16,
}

impl Manager {
    fn alloc_ephemeral_port(&mut self) -> Result<u16, Error> {
        const BASE: u16 = 49152;
        for _ in 0..16384u32 {
            let candidate = BASE.wrapping_add(self.next_ephemeral);
            self.next_ephemeral = self.next_ephemeral.wrapping_add(1);
            let quad_taken = self.connections.keys().any(|q| q.src.port == candidate);
            if candidate != 0 && !self.listeners.contains_key(&candidate) && !quad_taken {
                return Ok(candidate);
            }
        }
        Err(Error::InsufficientResources)
    }

    pub(crate) fn remove_listener(&mut self, port: u16) -> Option<Arc<ListenerState>> {
        self.listeners.remove(&port)
    }

    pub(crate) fn peek_connection(&self, quad: &Quad) -> Option<Arc<Connection>> {
        self.connections.get(quad).cloned()
    }
}

pub struct NetStack {
    registry: Arc<Mutex<Manager>>,
    config: TcpConfig,
    local_addr: Ipv4Addr,
    link_sender: LinkSender,
    worker: Option<thread::JoinHandle<()>>,
}

impl NetStack {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        Self::with_config(name, addr, mask, TcpConfig::default())
    }

    pub fn with_config(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, config: TcpConfig) -> Result<Self, Error> {
        let link = Link::open(name, addr, mask)?;
        let link_sender = link.sender();
        let registry = Arc::new(Mutex::new(Manager::default()));

        let worker = {
            let registry = registry.clone();
            thread::spawn(move || worker_loop(registry, link, config))
        };

        log::info!("tcp engine bound to {name} ({addr}/{mask})");

        Ok(NetStack {
            registry,
            config,
            local_addr: addr,
            link_sender,
            worker: Some(worker),
        })
    }

    /// Bind + Listen (spec S4.7): Initialized -> Listening.
    pub fn bind(&self, port: u16) -> Result<super::listen::TcpListener, Error> {
        let mut manager = self.registry.lock().unwrap();
        if manager.listeners.contains_key(&port) {
            return Err(Error::PortInUse(port));
        }

        let state = Arc::new(ListenerState {
            config: self.config,
            basic_opts: Mutex::new(BasicOptions::default()),
            tcp_opts: Mutex::new(TcpOptions::default()),
            backlog: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
            capacity: self.config.backlog,
        });
        manager.listeners.insert(port, state.clone());
        drop(manager);

        Ok(super::listen::TcpListener::new(
            port,
            self.registry.clone(),
            state,
            self.link_sender,
        ))
    }

    /// Connect (spec S4.7): Initialized -> SynSent, blocks until
    /// Established/CloseWait or the connection is abandoned.
    pub fn connect(&self, remote: Ipv4Addr, remote_port: u16) -> Result<super::stream::TcpStream, Error> {
        let (quad, conn) = {
            let mut manager = self.registry.lock().unwrap();
            let local_port = manager.alloc_ephemeral_port()?;
            let quad = Quad {
                src: Dual {
                    ipv4: self.local_addr,
                    port: local_port,
                },
                dst: Dual {
                    ipv4: remote,
                    port: remote_port,
                },
            };
            let iss = rand::thread_rng().gen::<u32>();
            let tcb = Tcb::connect(quad, iss, self.config, BasicOptions::default(), TcpOptions::default());
            let conn = Connection::new(tcb);
            manager.connections.insert(quad, conn.clone());
            (quad, conn)
        };

        match conn.wait_settled() {
            Ok(()) => Ok(super::stream::TcpStream::new(quad, conn, self.link_sender)),
            Err(e) => {
                self.registry.lock().unwrap().connections.remove(&quad);
                Err(e)
            }
        }
    }

    pub fn join(mut self) {
        if let Some(w) = self.worker.take() {
            w.join().unwrap();
        }
    }
}

fn worker_loop(registry: Arc<Mutex<Manager>>, mut link: Link, config: TcpConfig) -> ! {
    let mut buf = [0u8; 65535];
    let mut last_tick = Instant::now();

    loop {
        if last_tick.elapsed() >= config.tick_interval {
            last_tick = Instant::now();
            run_tick(&registry, &mut link);
        }

        let remaining_ms = config
            .tick_interval
            .saturating_sub(last_tick.elapsed())
            .as_millis()
            .clamp(1, 1000) as i32;

        match link.recv(&mut buf, remaining_ms) {
            Ok(Some(n)) => handle_inbound(&registry, &mut link, &buf[..n]),
            Ok(None) => {}
            Err(e) => log::warn!("link read error: {e}"),
        }
    }
}

/// One periodic worker pass: retransmissions, SYN/FIN retries, TIME-WAIT
/// expiry, keep-alive probes (spec S2, S9 "Retransmission timer").
fn run_tick(registry: &Arc<Mutex<Manager>>, link: &mut Link) {
    let snapshot: Vec<(Quad, Arc<Connection>)> = {
        let manager = registry.lock().unwrap();
        manager.connections.iter().map(|(q, c)| (*q, c.clone())).collect()
    };

    for (quad, conn) in snapshot {
        let (delete, packets) = {
            let mut tcb = conn.lock();
            tcb.on_tick()
        };

        for pkt in packets {
            let _ = link.send(&pkt);
        }

        if delete {
            destroy_if_still_closed(registry, quad, &conn);
        } else {
            conn.wake(true, true, false);
        }
    }
}

/// Destroys a connection only after re-acquiring registry then connection
/// lock and rechecking Closed (spec S5: "the Closed-state recheck after
/// reacquisition is mandatory").
fn destroy_if_still_closed(registry: &Arc<Mutex<Manager>>, quad: Quad, conn: &Arc<Connection>) {
    let mut manager = registry.lock().unwrap();
    if let Some(current) = manager.connections.get(&quad) {
        if Arc::ptr_eq(current, conn) && conn.lock().is_closed() {
            manager.connections.remove(&quad);
        }
    }
    drop(manager);
    conn.wake_all();
}

fn handle_inbound(registry: &Arc<Mutex<Manager>>, link: &mut Link, buf: &[u8]) {
    let Some(inbound) = Link::parse(buf) else { return };
    let (ip4h, tcph, data) = (inbound.ip4h, inbound.tcph, inbound.data);

    if inbound.checksum == super::codec::ChecksumState::NotOffloaded && !codec::verify_checksum(&ip4h, &tcph, data) {
        log::debug!("dropping segment with bad checksum from {}", ip4h.source_addr());
        return;
    }

    let quad = Quad {
        src: Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        },
        dst: Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        },
    };

    let existing = {
        let manager = registry.lock().unwrap();
        manager.connections.get(&quad).cloned()
    };

    if let Some(conn) = existing {
        let (action, packets) = {
            let mut tcb = conn.lock();
            tcb.on_segment(&ip4h, &tcph, data)
        };
        for pkt in &packets {
            let _ = link.send(pkt);
        }
        apply_action(registry, quad, &conn, action);
        return;
    }

    let listener = {
        let manager = registry.lock().unwrap();
        manager.listeners.get(&tcph.destination_port()).cloned()
    };

    let Some(listener) = listener else {
        if !tcph.rst() {
            if let Ok(pkt) = codec::build_rst_for_unknown(&ip4h, &tcph, data.len()) {
                let _ = link.send(&pkt);
            }
        }
        return;
    };

    // Fresh per-SYN Listen-state Tcb (spec S4.6 Listening): this value is
    // never itself stored, only used to drive `on_segment` once and, on SYN,
    // hand back a SynReceived child already carrying the real quad.
    let iss = rand::thread_rng().gen::<u32>();
    let basic = *listener.basic_opts.lock().unwrap();
    let tcp_opts = *listener.tcp_opts.lock().unwrap();
    let mut fresh = Tcb::listen(quad, iss, listener.config, basic, tcp_opts);
    let (action, packets) = fresh.on_segment(&ip4h, &tcph, data);
    for pkt in &packets {
        let _ = link.send(pkt);
    }

    if let Action::AddToPending(child) = action {
        debug_assert_eq!(child.kind, Kind::Passive);
        let conn = Connection::new(*child);
        registry.lock().unwrap().connections.insert(quad, conn.clone());
        if !listener.push(quad) {
            // Backlog full (spec S6 AcceptConnections capacity): refuse the
            // half-open child rather than let it dangle unacceptable.
            registry.lock().unwrap().connections.remove(&quad);
            if let Ok(pkt) = codec::build_rst(&quad, 0, 0) {
                let _ = link.send(&pkt);
            }
        }
    }
}

fn apply_action(registry: &Arc<Mutex<Manager>>, quad: Quad, conn: &Arc<Connection>, action: Action) {
    match action {
        Action::Noop => {}
        Action::AddToPending(_) => {
            // Only ever produced by a fresh Listen-state Tcb, handled inline
            // in `handle_inbound`; a registered connection never re-enters
            // Listen.
        }
        Action::RemoveFromPending => {
            conn.lock().set_last_error(Error::ConnectionReset);
            registry.lock().unwrap().connections.remove(&quad);
            remove_from_all_backlogs(registry, &quad);
            conn.wake_all();
        }
        Action::Reset => {
            conn.lock().set_last_error(Error::ConnectionReset);
            registry.lock().unwrap().connections.remove(&quad);
            remove_from_all_backlogs(registry, &quad);
            conn.wake_all();
        }
        Action::ConnectionRefused => {
            conn.lock().set_last_error(Error::ConnectionReset);
            registry.lock().unwrap().connections.remove(&quad);
            conn.wake_all();
        }
        Action::DeleteTcb => {
            registry.lock().unwrap().connections.remove(&quad);
            conn.wake_all();
        }
        Action::IsEstablished => {
            conn.waiters.estab.notify_all();
        }
        Action::Wakeup { reader, writer, closer } => {
            conn.waiters.estab.notify_all();
            conn.wake(reader, writer, closer);
        }
    }
}

fn remove_from_all_backlogs(registry: &Arc<Mutex<Manager>>, quad: &Quad) {
    let listeners: Vec<Arc<ListenerState>> = registry.lock().unwrap().listeners.values().cloned().collect();
    for listener in listeners {
        listener.remove(quad);
    }
}
