// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-process bus handle.
//!
//! A handle joins the shared roster, keeps process-local caches of the pipes
//! it writes to and reads from, and refreshes them when the shared version
//! counters move. Only roster and pipe-table changes take the bus mutex;
//! payloads travel through the ring channels without locking.

use std::ops::ControlFlow;

use crate::bus::layout::{SharedHeader, BUS_HEADER_SIZE, MAX_PIPES, MAX_TERMINALS};
use crate::bus::pipe::Pipe;
use crate::bus::snapshot::{BusSnapshot, PipeStats};
use crate::bus::{purge, BusOptions};
use crate::config::BusConfig;
use crate::error::{BusError, BusResult, CacheError, HardValidationError, SharedMemoryError};
use crate::peer_cache::PeerCache;
use crate::shm::{ProcessMutex, ProcessMutexGuard, SharedSegment};
use crate::types::{BusKey, TerminalAddress};

/// What this process last observed of the shared header.
struct PeerView {
    terminals: Vec<TerminalAddress>,
    send_channels: PeerCache<Pipe>,
    recv_channels: PeerCache<Pipe>,
    terminal_version: u32,
    pipe_version: u32,
}

impl PeerView {
    fn new() -> Self {
        Self {
            terminals: Vec::new(),
            send_channels: PeerCache::with_capacity(MAX_TERMINALS),
            recv_channels: PeerCache::with_capacity(MAX_TERMINALS),
            terminal_version: 0,
            pipe_version: 0,
        }
    }

    /// Reload the roster and attach every pipe touching `me` that is not yet
    /// cached. Returns whether anything changed. Nothing is ever evicted.
    fn refresh(
        &mut self,
        header: &SharedHeader,
        me: TerminalAddress,
        guard: &ProcessMutexGuard<'_>,
    ) -> BusResult<bool> {
        let mut changed = false;

        let terminal_version = header.terminal_version();
        if terminal_version != self.terminal_version {
            self.terminals = header.terminals(guard);
            self.terminal_version = terminal_version;
            changed = true;
        }

        let pipe_version = header.pipe_version();
        if pipe_version != self.pipe_version {
            for entry in header.pipes(guard) {
                let (from, to) = (entry.sender(), entry.receiver());
                if from == me && !self.send_channels.contains(to.slot_key()) {
                    let pipe = Pipe::attach(entry)?;
                    tracing::debug!(to = %to, key = %pipe.key(), "Attached send pipe");
                    self.send_channels
                        .add(to.slot_key(), pipe)
                        .map_err(cache_error)?;
                }
                if to == me && !self.recv_channels.contains(from.slot_key()) {
                    let pipe = Pipe::attach(entry)?;
                    tracing::debug!(from = %from, key = %pipe.key(), "Attached receive pipe");
                    self.recv_channels
                        .add(from.slot_key(), pipe)
                        .map_err(cache_error)?;
                }
            }
            self.pipe_version = pipe_version;
            changed = true;
        }

        Ok(changed)
    }
}

fn cache_error(e: CacheError) -> BusError {
    BusError::Fail {
        reason: format!("Peer cache: {}", e),
    }
}

/// A process's membership in a bus.
///
/// A handle is `Send` but not `Sync`: one thread at a time polls, sends and
/// receives through it.
pub struct Bus {
    key: BusKey,
    me: TerminalAddress,
    options: BusOptions,
    view: PeerView,
    /// Rotating start slot for [`Bus::recv_all`].
    recv_cursor: usize,
    header: SharedHeader,
    mutex: ProcessMutex,
}

impl Bus {
    /// Join bus `key` as terminal `me` with default options.
    pub fn create(key: BusKey, me: TerminalAddress) -> BusResult<Self> {
        Self::with_options(key, me, BusOptions::default())
    }

    /// Join the bus described by a validated configuration. The
    /// configuration must name a terminal.
    pub fn with_config(config: &BusConfig) -> BusResult<Self> {
        let me = config
            .terminal
            .ok_or_else(|| HardValidationError::MissingRequiredField {
                field: "terminal",
                context: "configuration root".to_string(),
            })?;
        Self::with_options(config.key, me, BusOptions::from(config))
    }

    /// Join bus `key` as terminal `me`.
    ///
    /// The first process creates and formats the shared header; later ones
    /// validate it and append themselves to the roster. Either way the
    /// handle starts with a view of every existing terminal and pipe.
    pub fn with_options(key: BusKey, me: TerminalAddress, options: BusOptions) -> BusResult<Self> {
        let header_key = key.header_key();
        let mutex = ProcessMutex::create_or_open(header_key)?;

        let (header, view) = {
            let guard = mutex.lock()?;

            let segment = SharedSegment::create_or_attach(header_key, BUS_HEADER_SIZE, false)?;
            let created = segment.is_creator();
            let header = SharedHeader::new(segment)?;

            if created {
                header.format(&guard, header_key, me);
                tracing::info!(bus = %key, terminal = %me, "Created bus");
            } else {
                header.validate(&guard, header_key)?;
                if header.add_terminal(&guard, me)? {
                    tracing::info!(bus = %key, terminal = %me, "Joined bus");
                } else {
                    tracing::debug!(bus = %key, terminal = %me, "Terminal already on roster");
                }
            }

            let mut view = PeerView::new();
            view.refresh(&header, me, &guard)?;
            (header, view)
        };

        Ok(Self {
            key,
            me,
            options,
            view,
            recv_cursor: 0,
            header,
            mutex,
        })
    }

    pub fn key(&self) -> BusKey {
        self.key
    }

    /// This handle's terminal address.
    pub fn address(&self) -> TerminalAddress {
        self.me
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// Roster as of the last refresh.
    pub fn terminals(&self) -> &[TerminalAddress] {
        &self.view.terminals
    }

    /// Last observed `(terminal_version, pipe_version)`.
    pub fn versions(&self) -> (u32, u32) {
        (self.view.terminal_version, self.view.pipe_version)
    }

    /// Refresh the local view if the shared version counters moved.
    ///
    /// The counters are compared without locking; the mutex is only taken
    /// when a refresh is needed. Returns whether anything changed.
    pub fn poll(&mut self) -> BusResult<bool> {
        if self.header.terminal_version() == self.view.terminal_version
            && self.header.pipe_version() == self.view.pipe_version
        {
            return Ok(false);
        }

        let guard = self.mutex.lock()?;
        let changed = self.view.refresh(&self.header, self.me, &guard)?;
        drop(guard);

        if changed {
            tracing::debug!(
                bus = %self.key,
                terminal = %self.me,
                terminal_version = self.view.terminal_version,
                pipe_version = self.view.pipe_version,
                "Refreshed bus view"
            );
        }
        Ok(changed)
    }

    /// Send one message to `peer`, creating the pipe on first use.
    pub fn send(&mut self, peer: TerminalAddress, payload: &[u8]) -> BusResult<()> {
        if peer == self.me {
            return Err(BusError::Fail {
                reason: format!("Terminal {} cannot send to itself", peer),
            });
        }

        if !self.view.send_channels.contains(peer.slot_key()) {
            self.create_pipe(peer)?;
        }

        let pipe = self
            .view
            .send_channels
            .get(peer.slot_key())
            .ok_or(BusError::PeerNotFound { peer })?;

        pipe.ring().write(payload).map_err(|e| match e {
            SharedMemoryError::WouldOverflow { size, available } => {
                tracing::trace!(to = %peer, size, available, "Pipe full");
                BusError::SendFailed {
                    peer,
                    size,
                    available,
                }
            }
            other => BusError::SharedMemory(other),
        })
    }

    /// Create and publish the pipe `me -> peer`.
    fn create_pipe(&mut self, peer: TerminalAddress) -> BusResult<()> {
        let guard = self.mutex.lock()?;

        if !self.header.terminals(&guard).contains(&peer) {
            return Err(BusError::PeerNotFound { peer });
        }

        let shared_version = self.header.pipe_version();
        if shared_version != self.view.pipe_version {
            return Err(BusError::PipeCreateFailed {
                peer,
                reason: format!(
                    "Pipe table changed (version {} observed, {} shared); poll first",
                    self.view.pipe_version, shared_version
                ),
            });
        }

        let index = self.header.pipe_count(&guard);
        if index >= MAX_PIPES {
            return Err(BusError::PipeTableFull { max: MAX_PIPES });
        }

        let key = self.key.pipe_key(index);
        let pipe = Pipe::create(key, self.me, peer, self.options.pipe_capacity).map_err(|e| {
            BusError::PipeCreateFailed {
                peer,
                reason: e.to_string(),
            }
        })?;

        self.view.pipe_version = self.header.add_pipe(&guard, *pipe.header());
        drop(guard);

        tracing::info!(
            bus = %self.key,
            from = %self.me,
            to = %peer,
            key = %key,
            capacity = pipe.ring().capacity(),
            "Created pipe"
        );

        self.view
            .send_channels
            .add(peer.slot_key(), pipe)
            .map_err(cache_error)
    }

    /// Send `payload` to every other terminal on the local roster.
    ///
    /// Stops at the first failure; messages already sent stay sent.
    pub fn send_all(&mut self, payload: &[u8]) -> BusResult<()> {
        self.broadcast(payload, |_| true)
    }

    /// Send `payload` to every other terminal whose role class is `kind`.
    pub fn send_by_type(&mut self, payload: &[u8], kind: u16) -> BusResult<()> {
        self.broadcast(payload, |peer| peer.kind() == kind)
    }

    fn broadcast(
        &mut self,
        payload: &[u8],
        filter: impl Fn(TerminalAddress) -> bool,
    ) -> BusResult<()> {
        let peers: Vec<TerminalAddress> = self
            .view
            .terminals
            .iter()
            .copied()
            .filter(|peer| *peer != self.me && filter(*peer))
            .collect();

        for peer in peers {
            self.send(peer, payload)?;
        }
        Ok(())
    }

    fn recv_pipe(&self, peer: TerminalAddress) -> BusResult<&Pipe> {
        self.view
            .recv_channels
            .get(peer.slot_key())
            .ok_or(BusError::PeerNotFound { peer })
    }

    /// Take the next message from `peer`. `None` when its pipe is empty.
    pub fn recv(&self, peer: TerminalAddress) -> BusResult<Option<Vec<u8>>> {
        match self.recv_pipe(peer)?.ring().read_vec() {
            Ok(payload) => Ok(Some(payload)),
            Err(SharedMemoryError::Empty) => Ok(None),
            Err(source) => Err(BusError::RecvFailed { peer, source }),
        }
    }

    /// Take the next message from `peer` into `buf`, returning its length.
    ///
    /// A buffer shorter than the message fails with `RecvFailed` and leaves
    /// the message in place.
    pub fn recv_into(&self, peer: TerminalAddress, buf: &mut [u8]) -> BusResult<Option<usize>> {
        match self.recv_pipe(peer)?.ring().read(buf) {
            Ok(len) => Ok(Some(len)),
            Err(SharedMemoryError::Empty) => Ok(None),
            Err(source) => Err(BusError::RecvFailed { peer, source }),
        }
    }

    /// Copy the next message from `peer` into `buf` without consuming it.
    pub fn peek(&self, peer: TerminalAddress, buf: &mut [u8]) -> BusResult<Option<usize>> {
        match self.recv_pipe(peer)?.ring().peek(buf) {
            Ok(len) => Ok(Some(len)),
            Err(SharedMemoryError::Empty) => Ok(None),
            Err(source) => Err(BusError::PeekFailed { peer, source }),
        }
    }

    /// Take one message from any peer.
    ///
    /// Scans the receive pipes once, starting after the pipe that delivered
    /// last time, so a busy sender cannot starve the others.
    pub fn recv_all(&mut self) -> BusResult<Option<(TerminalAddress, Vec<u8>)>> {
        let outcome = self
            .view
            .recv_channels
            .for_each_from(self.recv_cursor, |index, _, pipe| {
                match pipe.ring().read_vec() {
                    Ok(payload) => ControlFlow::Break((index, Ok((pipe.sender(), payload)))),
                    Err(SharedMemoryError::Empty) => ControlFlow::Continue(()),
                    Err(source) => ControlFlow::Break((
                        index,
                        Err(BusError::RecvFailed {
                            peer: pipe.sender(),
                            source,
                        }),
                    )),
                }
            });

        match outcome {
            Some((index, result)) => {
                self.recv_cursor = index + 1;
                result.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Framed bytes queued towards `peer` and not yet read. Zero if no pipe
    /// exists.
    pub fn send_pending_bytes(&self, peer: TerminalAddress) -> u32 {
        self.view
            .send_channels
            .get(peer.slot_key())
            .map_or(0, |pipe| pipe.ring().read_available() as u32)
    }

    /// Framed bytes waiting from `peer`. Zero if no pipe exists.
    pub fn recv_pending_bytes(&self, peer: TerminalAddress) -> u32 {
        self.view
            .recv_channels
            .get(peer.slot_key())
            .map_or(0, |pipe| pipe.ring().read_available() as u32)
    }

    /// Roster and counters of every pipe this handle has attached.
    pub fn snapshot(&self) -> BusSnapshot {
        let pipes = self
            .view
            .send_channels
            .iter()
            .chain(self.view.recv_channels.iter())
            .map(|(_, pipe)| PipeStats::of(pipe))
            .collect();

        BusSnapshot {
            key: self.key,
            observer: Some(self.me),
            terminal_version: self.view.terminal_version,
            pipe_version: self.view.pipe_version,
            terminals: self.view.terminals.clone(),
            pipes,
        }
    }

    /// Human-readable rendering of [`Bus::snapshot`].
    pub fn dump(&self) -> String {
        self.snapshot().to_string()
    }

    /// Detach from the bus. The shared state stays for the other terminals.
    pub fn release(self) {
        tracing::debug!(bus = %self.key, terminal = %self.me, "Released bus handle");
    }

    /// Detach and remove the bus from the system.
    ///
    /// Must be called by one process once every participant is done; handles
    /// still attached elsewhere keep their mappings until they release.
    pub fn destroy(self) -> BusResult<()> {
        let key = self.key;
        drop(self);
        purge(key)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("key", &self.key)
            .field("address", &self.me)
            .field("terminal_version", &self.view.terminal_version)
            .field("pipe_version", &self.view.pipe_version)
            .field("segment", &self.header.segment().key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::layout::PipeHeader;

    fn test_key(tag: u16) -> BusKey {
        BusKey::new(0x6000 | ((std::process::id() as u16 & 0x3F) << 6) | tag)
    }

    fn addr(instance: u16) -> TerminalAddress {
        TerminalAddress::new(0, instance).unwrap()
    }

    #[test]
    fn test_creator_sees_itself() {
        let key = test_key(1);
        let _ = purge(key);

        let bus = Bus::create(key, addr(1)).unwrap();
        assert_eq!(bus.terminals(), &[addr(1)]);
        assert_eq!(bus.versions(), (1, 1));
        bus.destroy().unwrap();
    }

    #[test]
    fn test_send_to_self_fails() {
        let key = test_key(2);
        let _ = purge(key);

        let mut bus = Bus::create(key, addr(1)).unwrap();
        assert!(matches!(bus.send(addr(1), b"x"), Err(BusError::Fail { .. })));
        bus.destroy().unwrap();
    }

    #[test]
    fn test_recv_from_unknown_peer() {
        let key = test_key(3);
        let _ = purge(key);

        let mut bus = Bus::create(key, addr(1)).unwrap();
        assert!(matches!(
            bus.recv(addr(9)),
            Err(BusError::PeerNotFound { .. })
        ));
        assert!(bus.recv_all().unwrap().is_none());
        assert_eq!(bus.recv_pending_bytes(addr(9)), 0);
        bus.destroy().unwrap();
    }

    #[test]
    fn test_stale_pipe_version_rejected() {
        let key = test_key(4);
        let _ = purge(key);

        let mut a = Bus::create(key, addr(1)).unwrap();
        let mut b = Bus::create(key, addr(2)).unwrap();
        let c = Bus::create(key, addr(3)).unwrap();
        a.poll().unwrap();

        // b publishes a pipe that a has not seen yet.
        b.send(addr(3), b"hi").unwrap();
        let err = a.send(addr(2), b"hello").unwrap_err();
        assert!(matches!(err, BusError::PipeCreateFailed { .. }));

        a.poll().unwrap();
        a.send(addr(2), b"hello").unwrap();

        drop(c);
        drop(b);
        a.destroy().unwrap();
    }

    #[test]
    fn test_pipe_table_full() {
        let key = test_key(5);
        let _ = purge(key);

        let mut a = Bus::create(key, addr(1)).unwrap();
        let b = Bus::create(key, addr(2)).unwrap();

        // Occupy every slot with pipes between terminals that never attach.
        {
            let guard = a.mutex.lock().unwrap();
            for index in 0..MAX_PIPES {
                a.header.add_pipe(
                    &guard,
                    PipeHeader {
                        key: key.pipe_key(index).value(),
                        from: addr(50).raw(),
                        to: addr(51).raw(),
                        size: 64,
                    },
                );
            }
        }
        assert!(a.poll().unwrap());
        let (_, pipe_version) = a.versions();

        let err = a.send(addr(2), b"hello").unwrap_err();
        assert!(matches!(err, BusError::PipeTableFull { max: MAX_PIPES }));

        let guard = a.mutex.lock().unwrap();
        assert_eq!(a.header.pipe_count(&guard), MAX_PIPES);
        drop(guard);
        assert_eq!(a.header.pipe_version(), pipe_version);
        assert_eq!(a.versions().1, pipe_version);
        assert_eq!(a.send_pending_bytes(addr(2)), 0);

        drop(b);
        a.destroy().unwrap();
    }
}
