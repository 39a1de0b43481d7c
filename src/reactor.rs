//! Guard I/O reactor
//!
//! A select-style event loop over Tor streams and ordinary readable
//! resources. Registrations live in an arena of slots addressed by
//! [`Token`]s (slot index + generation), so a stale token can never reach a
//! newer registration that reused the slot.
//!
//! Sources do not block the loop. Each one reports readiness through a
//! [`Waker`]: Tor streams are woken by the channel reader when a cell lands
//! in their buffer, and [`ReadSource`] runs a pump thread that performs the
//! blocking reads. The loop then drains the source and hands the bytes to
//! the callback. A closed source produces one final event with
//! [`Readiness::CLOSED`] and no data, after which the registration is gone.

use crate::error::{Result, TorError};
use std::collections::VecDeque;
use std::io::Read;
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Read size of the pump thread behind a [`ReadSource`]
const PUMP_CHUNK: usize = 4096;

/// Stable handle to one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// What a registration wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b01);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }
}

/// What happened to a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const READABLE: Readiness = Readiness(0b01);
    pub const CLOSED: Readiness = Readiness(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_closed(self) -> bool {
        self.0 & Self::CLOSED.0 != 0
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// Delivered to a callback. On close `data` is empty.
#[derive(Debug, Clone)]
pub struct Event {
    pub token: Token,
    pub readiness: Readiness,
    pub data: Vec<u8>,
}

impl Event {
    pub fn is_closed(&self) -> bool {
        self.readiness.is_closed()
    }
}

pub type Callback = Box<dyn FnMut(&Event) + Send>;

/// Result of a non-blocking drain
#[derive(Debug, PartialEq, Eq)]
pub enum Readable {
    Data(Vec<u8>),
    Closed,
    Pending,
}

/// Something the reactor can watch
pub trait Source: Send {
    /// Start reporting readiness through `waker`
    fn attach(&mut self, waker: Waker) -> Result<()>;

    /// Take whatever is available without blocking
    fn drain(&mut self) -> Readable;

    /// Stop reporting; called once when the registration goes away
    fn detach(&mut self);
}

enum Message {
    Ready(Token),
    Shutdown,
}

/// Handed to a source so it can signal readiness from any thread
#[derive(Clone)]
pub struct Waker {
    token: Token,
    tx: Sender<Message>,
}

impl Waker {
    pub fn wake(&self) {
        // The reactor may already be gone; nothing left to notify then.
        let _ = self.tx.send(Message::Ready(self.token));
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

impl std::fmt::Debug for Waker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waker").field("token", &self.token).finish()
    }
}

struct Entry {
    source: Box<dyn Source>,
    interest: Interest,
    /// Taken while the callback runs
    callback: Option<Callback>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Arena {
    fn insert(&mut self, entry: Entry) -> Token {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.entry = Some(entry);
        Token {
            index: index as u32,
            generation: slot.generation,
        }
    }

    fn get_mut(&mut self, token: Token) -> Option<&mut Entry> {
        self.slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn remove(&mut self, token: Token) -> Option<Entry> {
        let slot = self
            .slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.index as usize);
        Some(entry)
    }

    fn drain_all(&mut self) -> Vec<Entry> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
                out.push(entry);
            }
        }
        out
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}

struct Shared {
    arena: Mutex<Arena>,
    tx: Sender<Message>,
    stopped: AtomicBool,
}

impl Shared {
    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle for adding and removing registrations, usable from
/// any thread including from inside callbacks
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    pub fn register<S, F>(&self, source: S, interest: Interest, callback: F) -> Result<Token>
    where
        S: Source + 'static,
        F: FnMut(&Event) + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(TorError::InvalidState("reactor is shut down".into()));
        }

        let token = self.shared.arena().insert(Entry {
            source: Box::new(source),
            interest,
            callback: Some(Box::new(callback)),
        });

        let waker = Waker {
            token,
            tx: self.shared.tx.clone(),
        };
        let attached = match self.shared.arena().get_mut(token) {
            Some(entry) => entry.source.attach(waker.clone()),
            None => Ok(()),
        };
        if let Err(e) = attached {
            self.unregister(token);
            return Err(e);
        }

        // Data may already be buffered
        waker.wake();
        log::debug!("Registered source {}", token);
        Ok(token)
    }

    /// Remove a registration. Unknown or already removed tokens are ignored.
    pub fn unregister(&self, token: Token) {
        let entry = self.shared.arena().remove(token);
        if let Some(mut entry) = entry {
            entry.source.detach();
            log::debug!("Unregistered source {}", token);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.arena().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask the loop to stop; `run_forever` returns after the current event
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _ = self.shared.tx.send(Message::Shutdown);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

/// The event loop itself
pub struct Reactor {
    shared: Arc<Shared>,
    rx: Receiver<Message>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            shared: Arc::new(Shared {
                arena: Mutex::new(Arena::default()),
                tx,
                stopped: AtomicBool::new(false),
            }),
            rx,
        }
    }

    pub fn registry(&self) -> Registry {
        Registry {
            shared: self.shared.clone(),
        }
    }

    /// Wait up to `timeout` (forever for `None`) for readiness and run the
    /// callbacks it triggers. Returns the number of events delivered.
    pub fn poll(&mut self, timeout: Option<Duration>) -> usize {
        let first = match timeout {
            None => self.rx.recv().ok(),
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        let Some(first) = first else {
            return 0;
        };

        let mut delivered = self.handle(first);
        while !self.shared.stopped.load(Ordering::Acquire) {
            match self.rx.try_recv() {
                Ok(msg) => delivered += self.handle(msg),
                Err(_) => break,
            }
        }
        delivered
    }

    /// Run until [`Registry::shutdown`] is called, then detach every source
    pub fn run_forever(&mut self) {
        while !self.shared.stopped.load(Ordering::Acquire) {
            self.poll(None);
        }
        self.close_all();
    }

    fn close_all(&mut self) {
        let entries = self.shared.arena().drain_all();
        for mut entry in entries {
            entry.source.detach();
        }
    }

    fn handle(&mut self, msg: Message) -> usize {
        match msg {
            Message::Ready(token) => self.dispatch(token),
            Message::Shutdown => 0,
        }
    }

    fn dispatch(&mut self, token: Token) -> usize {
        let (readable, mut callback) = {
            let mut arena = self.shared.arena();
            let Some(entry) = arena.get_mut(token) else {
                return 0;
            };
            let Some(callback) = entry.callback.take() else {
                return 0;
            };
            let readable = match entry.source.drain() {
                Readable::Data(_) if !entry.interest.is_readable() => Readable::Pending,
                other => other,
            };
            (readable, callback)
        };

        match readable {
            Readable::Pending => {
                self.restore(token, callback);
                0
            }
            Readable::Data(data) => {
                callback(&Event {
                    token,
                    readiness: Readiness::READABLE,
                    data,
                });
                self.restore(token, callback);
                1
            }
            Readable::Closed => {
                callback(&Event {
                    token,
                    readiness: Readiness::READABLE | Readiness::CLOSED,
                    data: Vec::new(),
                });
                self.registry().unregister(token);
                1
            }
        }
    }

    /// Put the callback back unless the registration went away meanwhile
    fn restore(&self, token: Token, callback: Callback) {
        if let Some(entry) = self.shared.arena().get_mut(token) {
            entry.callback = Some(callback);
        }
    }
}

/// A reactor running on its own thread; stopped and joined on drop
pub struct ReactorThread {
    registry: Registry,
    handle: Option<JoinHandle<()>>,
}

impl ReactorThread {
    pub fn spawn(name: &str) -> Result<Self> {
        let mut reactor = Reactor::new();
        let registry = reactor.registry();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || reactor.run_forever())
            .map_err(|e| TorError::Internal(format!("spawn reactor thread: {}", e)))?;
        Ok(Self {
            registry,
            handle: Some(handle),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.registry.shutdown();
        if let Some(handle) = self.handle.take() {
            // Dropped from one of our own callbacks: the loop exits on its own.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

struct PumpState {
    queue: VecDeque<u8>,
    closed: bool,
}

/// Any blocking reader (socket, pipe, child stdout) as a reactor source.
///
/// Reads happen on a pump thread started at registration; the loop only
/// ever sees buffered bytes. A blocked read only returns when the resource
/// is shut down, so sources built with [`ReadSource::new`] keep their pump
/// thread until the reader hits EOF; prefer [`ReadSource::tcp`],
/// [`ReadSource::unix`] or [`ReadSource::with_shutdown`].
pub struct ReadSource {
    reader: Option<Box<dyn Read + Send>>,
    state: Arc<Mutex<PumpState>>,
    stop: Arc<AtomicBool>,
    shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl ReadSource {
    pub fn new<R: Read + Send + 'static>(reader: R) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            state: Arc::new(Mutex::new(PumpState {
                queue: VecDeque::new(),
                closed: false,
            })),
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: None,
        }
    }

    /// `reader` plus a hook that unblocks it; the hook runs once on detach
    pub fn with_shutdown<R, F>(reader: R, hook: F) -> Self
    where
        R: Read + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let mut source = Self::new(reader);
        source.shutdown = Some(Box::new(hook));
        source
    }

    /// A TCP socket; detaching shuts it down so the pump thread exits
    pub fn tcp(socket: TcpStream) -> Result<Self> {
        let control = socket.try_clone()?;
        Ok(Self::with_shutdown(socket, move || {
            let _ = control.shutdown(Shutdown::Both);
        }))
    }

    /// A Unix domain socket; detaching shuts it down so the pump thread exits
    #[cfg(unix)]
    pub fn unix(socket: UnixStream) -> Result<Self> {
        let control = socket.try_clone()?;
        Ok(Self::with_shutdown(socket, move || {
            let _ = control.shutdown(Shutdown::Both);
        }))
    }

    fn state(&self) -> MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Source for ReadSource {
    fn attach(&mut self, waker: Waker) -> Result<()> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| TorError::InvalidState("source already attached".into()))?;
        let state = self.state.clone();
        let stop = self.stop.clone();

        thread::Builder::new()
            .name(format!("reactor-pump-{}", waker.token()))
            .spawn(move || {
                let mut buf = [0u8; PUMP_CHUNK];
                loop {
                    let result = reader.read(&mut buf);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                    match result {
                        Ok(0) => {
                            st.closed = true;
                        }
                        Ok(n) => st.queue.extend(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::debug!("source {} read failed: {}", waker.token(), e);
                            st.closed = true;
                        }
                    }
                    let closed = st.closed;
                    drop(st);
                    waker.wake();
                    if closed {
                        break;
                    }
                }
            })
            .map_err(|e| TorError::Internal(format!("spawn pump thread: {}", e)))?;
        Ok(())
    }

    fn drain(&mut self) -> Readable {
        let mut st = self.state();
        if !st.queue.is_empty() {
            return Readable::Data(st.queue.drain(..).collect());
        }
        if st.closed {
            Readable::Closed
        } else {
            Readable::Pending
        }
    }

    fn detach(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(hook) = self.shutdown.take() {
            hook();
        }
    }
}
