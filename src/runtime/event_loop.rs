//! The dispatcher: one readiness-driven loop servicing every connection.
//!
//! Each iteration runs a fixed sequence: apply registration changes and
//! compute the nearest timer deadline, block on the poller, then service
//! timers, writes, and reads in that order for every connection, remove
//! whatever finished, accept new work, and finally consider splitting off a
//! worker if the live count has hit the configured ceiling. Connections
//! marked for closing earlier in a pass are skipped by the later phases, so
//! a handler never runs against state another handler just tore down.
//!
//! The poller is edge-driven; readiness is remembered per connection (see
//! [`Readiness`](super::conn::Readiness)) and consumed as I/O drains, which
//! restores the level-style "service it again next pass" behavior the
//! per-pass phases rely on.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::{Events, Interest as PollInterest, Poll, Token};
use slab::Slab;
use tracing::{debug, error, info};

use crate::diag::{ControlFlags, Stats};
use crate::proto::ProtocolInstance;
use crate::runtime::backoff::{Backoff, Band};
use crate::runtime::conn::{Conn, Outcome};
use crate::runtime::listener::ListenSpec;

const EVENTS_CAPACITY: usize = 1024;

/// Upper bound on one poll wait, so the loop periodically wakes to reap
/// workers and service operator requests even when fully idle.
const MAX_WAIT: Duration = Duration::from_secs(20);

pub(crate) struct EventLoop {
    pub(super) poll: Poll,
    pub(super) events: Events,
    pub(super) conns: Slab<Conn>,
    pub(super) listeners: Vec<ListenSpec>,
    pub(super) instance: Option<Box<dyn ProtocolInstance>>,
    /// Live connections per process before splitting; 0 disables splitting.
    pub(super) ceiling: usize,
    /// True in a worker that received migrated connections. Workers never
    /// accept or split, and they exit once their last connection closes.
    pub(super) migrated: bool,
    pub(super) worker_id: u64,
    pub(super) next_worker_id: u64,
    pub(super) workers: Vec<thread::JoinHandle<()>>,
    pub(super) backoff: Backoff,
    pub(super) flags: Arc<ControlFlags>,
    pub(super) stats: Arc<Stats>,
}

impl EventLoop {
    pub(crate) fn original(
        mut listeners: Vec<ListenSpec>,
        instance: Box<dyn ProtocolInstance>,
        ceiling: usize,
        flags: Arc<ControlFlags>,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        // Listeners live in the high token band, connections in the low one.
        for (i, spec) in listeners.iter_mut().enumerate() {
            poll.registry().register(
                &mut spec.listener,
                Token(usize::MAX - i),
                PollInterest::READABLE,
            )?;
        }
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            conns: Slab::new(),
            listeners,
            instance: Some(instance),
            ceiling,
            migrated: false,
            worker_id: 0,
            next_worker_id: 1,
            workers: Vec::new(),
            backoff: Backoff::new(),
            flags,
            stats,
        })
    }

    pub(crate) fn for_worker(
        worker_id: u64,
        migrated: Vec<Conn>,
        flags: Arc<ControlFlags>,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        let mut conns = Slab::with_capacity(migrated.len());
        for conn in migrated {
            conns.insert(conn);
        }
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            conns,
            listeners: Vec::new(),
            instance: None,
            ceiling: 0,
            migrated: true,
            worker_id,
            next_worker_id: 0,
            workers: Vec::new(),
            backoff: Backoff::new(),
            flags,
            stats,
        })
    }

    pub(crate) fn run(&mut self) -> io::Result<()> {
        loop {
            if self.flags.stop_requested() {
                return Ok(());
            }

            self.service_control();
            if !self.migrated {
                self.reap_workers();
            }

            let now = Instant::now();
            let timeout = self.prepare(now);

            if self.flags.verbosity() >= 2 {
                info!(
                    timeout_ms = timeout.as_millis() as u64,
                    connections = self.conns.len(),
                    "waiting for readiness"
                );
            }

            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    thread::sleep(self.backoff.trigger(Instant::now(), Band::Mild));
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "readiness wait failed");
                    thread::sleep(self.backoff.trigger(Instant::now(), Band::Severe));
                    continue;
                }
            }

            self.collect_readiness();

            let now = Instant::now();
            let mut transients = 0u32;

            self.service_conns(now, &mut transients);
            self.remove_closed();
            if self.migrated && self.conns.is_empty() {
                info!(worker = self.worker_id, "all migrated connections done");
                return Ok(());
            }

            if !self.migrated {
                self.service_accepts(&mut transients);
            }

            if transients > 0 {
                let delay = self.backoff.trigger(Instant::now(), Band::Mild);
                debug!(
                    transients,
                    delay_us = delay.as_micros() as u64,
                    "backing off"
                );
                thread::sleep(delay);
            }

            self.maybe_split();
        }
    }

    /// Consume operator signals delivered since the last pass.
    fn service_control(&mut self) {
        if let Some(level) = self.flags.consume_verbosity_cycle() {
            info!(verbosity = level, "verbosity level changed");
        }
        if !self.migrated && self.flags.take_dump_request() {
            self.dump_state();
        }
    }

    /// Read-only snapshot of loop state, logged on request.
    fn dump_state(&self) {
        info!("state dump requested");
        for spec in &self.listeners {
            info!(listener = %spec.spec, "listening");
        }
        info!(
            connections = self.conns.len(),
            workers = self.workers.len(),
            total_accepted = self.stats.accepted(),
            splits = self.stats.splits(),
            "totals"
        );
        let now = Instant::now();
        for (_, conn) in self.conns.iter() {
            let timer_ms = conn
                .interest
                .timer
                .map(|t| t.saturating_duration_since(now).as_millis() as u64);
            info!(
                conn = %conn.label(),
                read = conn.interest.read,
                write = conn.interest.write,
                timer_ms,
                "connection"
            );
        }
    }

    /// Sync poll registrations with each connection's interests and compute
    /// how long the next wait may block.
    fn prepare(&mut self, now: Instant) -> Duration {
        let mut least = MAX_WAIT;
        let mut immediate = false;

        for (key, conn) in self.conns.iter_mut() {
            let want = conn.wants();
            if want != conn.registered {
                let result = match (conn.registered, want) {
                    (None, Some(w)) => {
                        self.poll
                            .registry()
                            .register(&mut conn.sock.stream, Token(key), w)
                    }
                    (Some(_), Some(w)) => {
                        self.poll
                            .registry()
                            .reregister(&mut conn.sock.stream, Token(key), w)
                    }
                    (Some(_), None) => self.poll.registry().deregister(&mut conn.sock.stream),
                    (None, None) => Ok(()),
                };
                match result {
                    Ok(()) => conn.registered = want,
                    Err(e) => {
                        error!(conn = %conn.label(), error = %e, "poll registration failed");
                        conn.closing = true;
                        immediate = true;
                        continue;
                    }
                }
            }

            if let Some(deadline) = conn.interest.timer {
                least = least.min(deadline.saturating_duration_since(now));
            }
            if (conn.interest.read && conn.sock.ready.read)
                || (conn.interest.write && conn.sock.ready.write)
            {
                immediate = true;
            }
        }

        if self.listeners.iter().any(|l| l.ready) {
            immediate = true;
        }

        if immediate {
            Duration::ZERO
        } else {
            least
        }
    }

    /// Record delivered readiness on the sticky per-connection flags.
    fn collect_readiness(&mut self) {
        for event in self.events.iter() {
            let token = event.token().0;
            let lidx = usize::MAX - token;
            if lidx < self.listeners.len() {
                if event.is_readable() {
                    self.listeners[lidx].ready = true;
                }
                continue;
            }
            if let Some(conn) = self.conns.get_mut(token) {
                if event.is_readable() {
                    conn.sock.ready.read = true;
                }
                if event.is_writable() {
                    conn.sock.ready.write = true;
                }
            }
        }
    }

    /// Service timers, then writes, then reads, for every connection.
    fn service_conns(&mut self, now: Instant, transients: &mut u32) {
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        let chatty = self.flags.verbosity() >= 1;

        for key in keys {
            let mut outcome = None;
            if let Some(conn) = self.conns.get_mut(key) {
                if !conn.closing {
                    if let Some(deadline) = conn.interest.timer {
                        if deadline <= now {
                            if chatty {
                                info!(conn = %conn.label(), "timer fired");
                            }
                            outcome = Some(conn.service_timer(now));
                        }
                    }
                }
            }
            if let Some(o) = outcome {
                self.apply_outcome(key, o, transients);
            }

            let mut outcome = None;
            if let Some(conn) = self.conns.get_mut(key) {
                if !conn.closing && conn.interest.write && conn.sock.ready.write {
                    if chatty {
                        info!(conn = %conn.label(), "writable");
                    }
                    outcome = Some(conn.service_write());
                }
            }
            if let Some(o) = outcome {
                self.apply_outcome(key, o, transients);
            }

            let mut outcome = None;
            if let Some(conn) = self.conns.get_mut(key) {
                if !conn.closing && conn.interest.read && conn.sock.ready.read {
                    if chatty {
                        info!(conn = %conn.label(), "readable");
                    }
                    outcome = Some(conn.service_read());
                }
            }
            if let Some(o) = outcome {
                self.apply_outcome(key, o, transients);
            }

            // A connection that no longer wants anything is complete and
            // must not survive this pass.
            if let Some(conn) = self.conns.get_mut(key) {
                if !conn.closing && conn.interest.is_empty() {
                    debug!(conn = %conn.label(), "no interests remain");
                    conn.closing = true;
                }
            }
        }
    }

    fn apply_outcome(&mut self, key: usize, outcome: Outcome, transients: &mut u32) {
        match outcome {
            Outcome::Ok => {}
            Outcome::Transient => *transients += 1,
            Outcome::Close => {
                if let Some(conn) = self.conns.get_mut(key) {
                    conn.closing = true;
                }
            }
            Outcome::Fatal(e) => {
                if let Some(conn) = self.conns.get_mut(key) {
                    error!(conn = %conn.label(), error = %e, "connection error");
                    conn.closing = true;
                }
            }
        }
    }

    /// Close and unlink everything marked during this pass. Close hooks run
    /// exactly once; dropping the connection closes the socket.
    fn remove_closed(&mut self) {
        let keys: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.closing)
            .map(|(k, _)| k)
            .collect();

        for key in keys {
            let mut conn = self.conns.remove(key);
            if conn.registered.take().is_some() {
                let _ = self.poll.registry().deregister(&mut conn.sock.stream);
            }
            self.stats.note_close();
            conn.shutdown();
            debug!(conn = %conn.label(), "closing connection");
        }
    }

    /// Accept at most one pending connection per listener per pass; repeated
    /// passes drain any backlog.
    fn service_accepts(&mut self, transients: &mut u32) {
        for i in 0..self.listeners.len() {
            if !self.listeners[i].ready {
                continue;
            }
            match self.listeners[i].listener.accept() {
                Ok((stream, peer)) => {
                    let Some(instance) = self.instance.as_ref() else {
                        continue;
                    };
                    match instance.new_connection(stream, peer, Instant::now()) {
                        Ok(mut conn) => {
                            conn.label = format!("({peer}->{})", self.listeners[i].spec);
                            let label = conn.label.clone();
                            self.conns.insert(conn);
                            self.stats.note_accept();
                            debug!(conn = %label, listener = %self.listeners[i].spec, "connection received");
                        }
                        Err(e) => {
                            error!(
                                listener = %self.listeners[i].spec,
                                error = %e,
                                "failed to set up connection"
                            );
                            *transients += 1;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.listeners[i].ready = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    // The peer gave up while queued; exceptional but routine.
                    *transients += 1;
                }
                Err(e) => {
                    error!(listener = %self.listeners[i].spec, error = %e, "accept failed");
                    *transients += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{echo, ArgCursor};
    use crate::runtime::conn::{Driver, Interest, Sock};
    use crate::runtime::listener;
    use std::io::{Read as _, Write as _};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestServer {
        addr: SocketAddr,
        flags: Arc<ControlFlags>,
        stats: Arc<Stats>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl TestServer {
        fn start(instance: Box<dyn ProtocolInstance>, ceiling: usize) -> Self {
            let spec = listener::bind("(test)", "127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = spec.local_addr().unwrap();
            let flags = Arc::new(ControlFlags::new(0));
            let stats = Arc::new(Stats::default());
            let mut el = EventLoop::original(
                vec![spec],
                instance,
                ceiling,
                Arc::clone(&flags),
                Arc::clone(&stats),
            )
            .unwrap();
            let handle = thread::spawn(move || {
                let _ = el.run();
            });
            Self {
                addr,
                flags,
                stats,
                handle: Some(handle),
            }
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(mut self) {
            self.flags.request_stop();
            // Wake the dispatcher so it notices the stop request.
            let _ = TcpStream::connect(self.addr);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn echo_instance() -> Box<dyn ProtocolInstance> {
        let args: Vec<String> = Vec::new();
        echo::construct(&mut ArgCursor::new(&args)).unwrap()
    }

    fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).unwrap();
        let mut back = vec![0u8; payload.len()];
        stream.read_exact(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn echo_round_trips_bytes_in_order() {
        let server = TestServer::start(echo_instance(), 0);
        let mut client = server.connect();

        echo_roundtrip(&mut client, b"hello, service");
        echo_roundtrip(&mut client, &[0u8, 1, 2, 255, 254, 253]);

        drop(client);
        server.stop();
    }

    #[test]
    fn ceiling_zero_never_splits() {
        let server = TestServer::start(echo_instance(), 0);
        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut c = server.connect();
            echo_roundtrip(&mut c, b"still here");
            clients.push(c);
        }

        assert_eq!(server.stats.splits(), 0);
        assert_eq!(server.stats.accepted(), 3);

        drop(clients);
        server.stop();
    }

    #[test]
    fn ceiling_one_splits_on_first_connection() {
        let server = TestServer::start(echo_instance(), 1);

        let mut first = server.connect();
        echo_roundtrip(&mut first, b"one");
        wait_until(|| server.stats.splits() >= 1);

        // The original accepted the first connection and handed it off; it
        // is free to accept more, and the migrated connection still works.
        let mut second = server.connect();
        echo_roundtrip(&mut second, b"two");
        echo_roundtrip(&mut first, b"one again");

        drop(first);
        drop(second);
        server.stop();
    }

    #[test]
    fn ceiling_two_with_three_connections_splits_once() {
        let server = TestServer::start(echo_instance(), 2);

        let mut c1 = server.connect();
        echo_roundtrip(&mut c1, b"first");
        let mut c2 = server.connect();
        echo_roundtrip(&mut c2, b"second");
        wait_until(|| server.stats.splits() == 1);

        let mut c3 = server.connect();
        echo_roundtrip(&mut c3, b"third");

        // Everything stays serviceable, and no further split happened.
        echo_roundtrip(&mut c1, b"first again");
        assert_eq!(server.stats.splits(), 1);
        assert_eq!(server.stats.accepted(), 3);

        drop((c1, c2, c3));
        server.stop();
    }

    /// Protocol whose connections give up every interest after one read.
    struct Vanish {
        closes: Arc<AtomicUsize>,
    }

    struct VanishDriver {
        closes: Arc<AtomicUsize>,
    }

    impl ProtocolInstance for Vanish {
        fn new_connection(
            &self,
            stream: mio::net::TcpStream,
            _peer: SocketAddr,
            _now: Instant,
        ) -> io::Result<Conn> {
            Ok(Conn::new(
                stream,
                Box::new(VanishDriver {
                    closes: Arc::clone(&self.closes),
                }),
                Interest::reading(),
            ))
        }
    }

    impl Driver for VanishDriver {
        fn on_readable(&mut self, sock: &mut Sock, interest: &mut Interest) -> Outcome {
            let mut scratch = [0u8; 64];
            sock.read_step(&mut scratch).then(|_| {
                interest.read = false;
                Outcome::Ok
            })
        }

        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn empty_interest_set_closes_in_the_same_pass() {
        let closes = Arc::new(AtomicUsize::new(0));
        let server = TestServer::start(
            Box::new(Vanish {
                closes: Arc::clone(&closes),
            }),
            0,
        );

        let mut client = server.connect();
        client.write_all(b"x").unwrap();

        // The dispatcher drops the connection, so the client sees EOF.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0);

        wait_until(|| closes.load(Ordering::Relaxed) == 1);
        assert_eq!(server.stats.live(), 0);

        server.stop();
    }
}
