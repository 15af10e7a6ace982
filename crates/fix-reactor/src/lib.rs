//! Single-threaded cooperative reactor (§4.6): file-descriptor readiness
//! and timers dispatched from one `wait_for_event_with_timeout` call.
//!
//! Handlers are referenced by opaque `RegistrationId`s rather than objects
//! a caller subclasses — a registration is either an `Fd` or a `Timer`,
//! matched on rather than dispatched through a trait hierarchy. Firing
//! events are snapshotted by id before any callback runs, so a callback
//! that registers or unregisters another handler (including itself)
//! can't invalidate the in-progress dispatch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot wait for events with no handlers registered")]
    NoHandlers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

enum Registration {
    Fd {
        token: mio::Token,
        callback: Rc<RefCell<dyn FnMut(Interest)>>,
    },
    Timer {
        period: Duration,
        remaining: Duration,
        callback: Rc<RefCell<dyn FnMut()>>,
    },
}

pub struct EventManager {
    poll: mio::Poll,
    events: mio::Events,
    handlers: HashMap<RegistrationId, Registration>,
    tokens: HashMap<mio::Token, RegistrationId>,
    next_id: u64,
    next_token: usize,
}

impl EventManager {
    pub fn new() -> Result<Self, ReactorError> {
        Ok(EventManager {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(128),
            handlers: HashMap::new(),
            tokens: HashMap::new(),
            next_id: 0,
            next_token: 0,
        })
    }

    /// The underlying mio registry, for registering a caller-owned
    /// `mio::event::Source` before calling `register_fd`.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    fn alloc_id(&mut self) -> RegistrationId {
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn register_fd(
        &mut self,
        source: &mut dyn mio::event::Source,
        interest: Interest,
        callback: impl FnMut(Interest) + 'static,
    ) -> Result<RegistrationId, ReactorError> {
        let token = mio::Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(source, token, to_mio_interest(interest))?;

        let id = self.alloc_id();
        self.tokens.insert(token, id);
        self.handlers.insert(
            id,
            Registration::Fd {
                token,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        Ok(id)
    }

    /// Change the interest set of an already-registered fd, e.g. adding
    /// `Write` while a partial send drains and dropping it again once
    /// the buffer is flushed.
    pub fn reregister_fd(
        &mut self,
        id: RegistrationId,
        source: &mut dyn mio::event::Source,
        interest: Interest,
    ) -> Result<(), ReactorError> {
        if let Some(Registration::Fd { token, .. }) = self.handlers.get(&id) {
            self.poll.registry().reregister(source, *token, to_mio_interest(interest))?;
        }
        Ok(())
    }

    pub fn unregister_fd(
        &mut self,
        id: RegistrationId,
        source: &mut dyn mio::event::Source,
    ) -> Result<(), ReactorError> {
        if let Some(Registration::Fd { token, .. }) = self.handlers.remove(&id) {
            self.tokens.remove(&token);
            self.poll.registry().deregister(source)?;
        }
        Ok(())
    }

    pub fn register_timer(
        &mut self,
        period: Duration,
        callback: impl FnMut() + 'static,
    ) -> RegistrationId {
        let id = self.alloc_id();
        self.handlers.insert(
            id,
            Registration::Timer {
                period,
                remaining: period,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        id
    }

    pub fn unregister_timer(&mut self, id: RegistrationId) {
        self.handlers.remove(&id);
    }

    /// Re-arm a timer's remaining interval to its full period, without
    /// waiting for it to expire.
    pub fn reset_timer(&mut self, id: RegistrationId) {
        if let Some(Registration::Timer { period, remaining, .. }) = self.handlers.get_mut(&id) {
            *remaining = *period;
        }
    }

    pub fn is_registered(&self, id: RegistrationId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Block for at most `timeout` (or the nearest timer's remaining
    /// interval, if sooner), then dispatch whatever fired.
    pub fn wait_for_event_with_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ReactorError> {
        if self.handlers.is_empty() {
            return Err(ReactorError::NoHandlers);
        }

        let mut wait = timeout;
        for reg in self.handlers.values() {
            if let Registration::Timer { remaining, .. } = reg {
                wait = Some(wait.map_or(*remaining, |w| w.min(*remaining)));
            }
        }

        let start = Instant::now();
        self.events.clear();
        self.poll.poll(&mut self.events, wait)?;
        let elapsed = start.elapsed();

        let fd_hits: Vec<(RegistrationId, Interest)> = self
            .events
            .iter()
            .filter_map(|event| {
                let id = *self.tokens.get(&event.token())?;
                Some((id, interest_from_event(event)))
            })
            .collect();
        let fd_hit_count = fd_hits.len();

        for (id, interest) in fd_hits {
            let callback = match self.handlers.get(&id) {
                Some(Registration::Fd { callback, .. }) => callback.clone(),
                _ => continue,
            };
            callback.borrow_mut()(interest);
        }

        let mut fired_timers = Vec::new();
        for (id, reg) in &mut self.handlers {
            if let Registration::Timer { period, remaining, .. } = reg {
                if *remaining <= elapsed {
                    *remaining = *period;
                    fired_timers.push(*id);
                } else {
                    *remaining -= elapsed;
                }
            }
        }
        tracing::trace!(fd_hits = fd_hit_count, timers_fired = fired_timers.len(), "event dispatch");
        for id in fired_timers {
            let callback = match self.handlers.get(&id) {
                Some(Registration::Timer { callback, .. }) => callback.clone(),
                _ => continue,
            };
            callback.borrow_mut()();
        }

        Ok(())
    }
}

fn to_mio_interest(interest: Interest) -> mio::Interest {
    match interest {
        Interest::Read => mio::Interest::READABLE,
        Interest::Write => mio::Interest::WRITABLE,
        Interest::ReadWrite => mio::Interest::READABLE | mio::Interest::WRITABLE,
    }
}

fn interest_from_event(event: &mio::event::Event) -> Interest {
    match (event.is_readable(), event.is_writable()) {
        (true, true) => Interest::ReadWrite,
        (true, false) => Interest::Read,
        (false, true) => Interest::Write,
        (false, false) => Interest::Read,
    }
}
