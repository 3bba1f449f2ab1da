//! Readiness-multiplexed event loop.
//!
//! Handlers are registered against a file descriptor and addressed by an
//! opaque `Token`. The poller owns the handlers but not the descriptors'
//! underlying resources beyond what a handler itself holds. Every handler
//! gets mutable access to a shared context `C` and to the poller, so it can
//! register and deregister other handlers while it runs.

use crate::error::PollError;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;
use tracing::trace;

/// Ready descriptors handled per wake; the rest wait for the next one.
const MAX_EVENTS: usize = 16;

/// Handle to a registration. Stale tokens never match a reused slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    index: usize,
    generation: u32,
}

impl Token {
    /// Packed into the epoll event so a queued event for a replaced
    /// registration can be told apart from the new one.
    fn key(self) -> u64 {
        (u64::from(self.generation) << 32) | self.index as u64
    }

    fn from_key(key: u64) -> Self {
        Self { index: (key & u64::from(u32::MAX)) as usize, generation: (key >> 32) as u32 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };

    fn flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Hang-up or error on the descriptor
    pub closed: bool,
}

impl Readiness {
    fn from_flags(flags: EpollFlags) -> Self {
        Self {
            readable: flags.contains(EpollFlags::EPOLLIN),
            writable: flags.contains(EpollFlags::EPOLLOUT),
            closed: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
        }
    }
}

/// Something that reacts to its descriptor becoming ready.
pub trait Pollable<C> {
    fn ready(&mut self, ctx: &mut C, token: Token, readiness: Readiness, poller: &mut Poller<C>);
}

/// Polling-style work run once after every wake. An error stops the loop.
pub trait Tick: Sized {
    type Error: From<PollError>;

    fn tick(&mut self, poller: &mut Poller<Self>) -> Result<(), Self::Error>;
}

struct Slot<C> {
    fd: RawFd,
    generation: u32,
    /// Taken out while the handler runs
    handler: Option<Box<dyn Pollable<C>>>,
}

pub struct Poller<C> {
    epoll: Epoll,
    slots: Vec<Option<Slot<C>>>,
    generation: u32,
}

impl<C> Poller<C> {
    pub fn new() -> Result<Self, PollError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(PollError::Create)?;
        Ok(Self { epoll, slots: Vec::new(), generation: 0 })
    }

    /// Start watching `fd`. The caller keeps `fd` open until it deregisters.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn Pollable<C>>,
    ) -> Result<Token, PollError> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        let generation = self.generation.wrapping_add(1);
        let token = Token { index, generation };

        // SAFETY: the caller guarantees fd stays open while registered
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(interest.flags(), token.key()))
            .map_err(|source| PollError::Register { fd, source })?;

        self.generation = generation;
        self.slots[index] = Some(Slot { fd, generation, handler: Some(handler) });
        trace!(fd, index, "registered");
        Ok(token)
    }

    /// Stop watching and hand back the handler, unless it is the one running.
    pub fn deregister(&mut self, token: Token) -> Option<Box<dyn Pollable<C>>> {
        let entry = self.slots.get_mut(token.index)?;
        if entry.as_ref()?.generation != token.generation {
            return None;
        }
        let slot = entry.take()?;
        // A closed descriptor's number may already belong to a newer
        // registration; leave that one in epoll.
        let reused = self.slots.iter().flatten().any(|other| other.fd == slot.fd);
        if !reused {
            // SAFETY: the handler still owns the descriptor at this point
            let borrowed = unsafe { BorrowedFd::borrow_raw(slot.fd) };
            if let Err(e) = self.epoll.delete(borrowed) {
                // Already closed descriptors drop out of epoll on their own
                trace!(fd = slot.fd, "epoll delete: {e}");
            }
        }
        trace!(fd = slot.fd, index = token.index, "deregistered");
        slot.handler
    }

    pub fn is_registered(&self, token: Token) -> bool {
        matches!(self.slots.get(token.index), Some(Some(slot)) if slot.generation == token.generation)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Wait once and dispatch every ready handler.
    pub fn poll_once(&mut self, ctx: &mut C, timeout: Duration) -> Result<usize, PollError> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        let n = match self.epoll.wait(&mut events, millis) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(PollError::Wait(e)),
        };

        for event in &events[..n] {
            let token = Token::from_key(event.data());
            let index = token.index;
            // Skip events queued for a registration replaced earlier in this batch
            let Some(Some(slot)) = self.slots.get_mut(index) else {
                continue;
            };
            if slot.generation != token.generation {
                trace!(index, "stale event");
                continue;
            }
            let Some(mut handler) = slot.handler.take() else {
                continue;
            };

            handler.ready(ctx, token, Readiness::from_flags(event.events()), self);

            // Put it back unless it deregistered itself
            if self.is_registered(token) {
                if let Some(Some(slot)) = self.slots.get_mut(index) {
                    slot.handler = Some(handler);
                }
            }
        }
        Ok(n)
    }
}

impl<C: Tick> Poller<C> {
    /// Run forever: wait, dispatch, tick.
    pub fn run(&mut self, ctx: &mut C, tick_every: Duration) -> Result<(), C::Error> {
        loop {
            self.poll_once(ctx, tick_every)?;
            ctx.tick(self)?;
        }
    }
}
