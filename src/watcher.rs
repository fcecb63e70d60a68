//! Watcher Adapter: reflects the connector's wait-set onto an event-loop
//! reactor. The connector never touches the reactor directly; it only
//! reports what it is waiting for, and [`Watcher::update`] is responsible
//! for making the registration match that report exactly, on every call.

use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// What the connector is currently waiting on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

/// What [`crate::connector::Connector`] reports after a `*_start`/`*_cont`
/// call that did not complete synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSet {
    pub interest: Interest,
    /// Deadline relative to now, from `read_timeout`/`write_timeout`/`connect_timeout`.
    pub timeout: Option<Duration>,
}

impl WaitSet {
    pub fn readable(timeout: Option<Duration>) -> Self {
        Self { interest: Interest::READABLE, timeout }
    }

    pub fn writable(timeout: Option<Duration>) -> Self {
        Self { interest: Interest::WRITABLE, timeout }
    }
}

/// Abstracts the event-loop registration primitive so the watcher adapter
/// can drive either a production reactor or a deterministic test double
/// through the same contract.
pub trait Reactor<S> {
    fn register(&mut self, source: &mut S, interest: Interest) -> Result<()>;
    fn reregister(&mut self, source: &mut S, interest: Interest) -> Result<()>;
    fn deregister(&mut self, source: &mut S) -> Result<()>;
}

/// Tracks the currently-registered interest for one socket and keeps it in
/// lockstep with the wait-set the connector reports. Registration is cleared
/// unconditionally whenever the connector has nothing to wait for (including
/// every return to the idle state), never left stale from a prior operation.
#[derive(Debug)]
pub struct Watcher<R> {
    reactor: R,
    registered: Option<Interest>,
}

impl<R> Watcher<R> {
    pub fn new(reactor: R) -> Self {
        Self { reactor, registered: None }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.is_some()
    }

    /// Reflect `wait` in the reactor registration for `source`. Pass `None`
    /// when the connector has nothing pending (idle, or a synchronous result
    /// just landed) to guarantee no stale registration survives.
    pub fn update<S>(&mut self, source: &mut S, wait: Option<&WaitSet>) -> Result<()>
    where
        R: Reactor<S>,
    {
        match (wait, self.registered) {
            (None, None) => Ok(()),
            (None, Some(_)) => {
                self.reactor.deregister(source)?;
                self.registered = None;
                Ok(())
            }
            (Some(w), None) => {
                self.reactor.register(source, w.interest)?;
                self.registered = Some(w.interest);
                Ok(())
            }
            (Some(w), Some(prev)) if prev == w.interest => Ok(()),
            (Some(w), Some(_)) => {
                self.reactor.reregister(source, w.interest)?;
                self.registered = Some(w.interest);
                Ok(())
            }
        }
    }
}

/// Production reactor backed by a single [`mio::Poll`] registry and one
/// fixed [`mio::Token`] per connection (the core manages exactly one socket
/// per connector instance).
#[derive(Debug)]
pub struct MioReactor {
    registry: mio::Registry,
    token: mio::Token,
}

impl MioReactor {
    pub fn new(registry: mio::Registry, token: mio::Token) -> Self {
        Self { registry, token }
    }
}

fn to_mio_interest(interest: Interest) -> mio::Interest {
    match (interest.contains(Interest::READABLE), interest.contains(Interest::WRITABLE)) {
        (true, true) => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
        (true, false) => mio::Interest::READABLE,
        (false, true) => mio::Interest::WRITABLE,
        (false, false) => mio::Interest::READABLE,
    }
}

impl<S: mio::event::Source> Reactor<S> for MioReactor {
    fn register(&mut self, source: &mut S, interest: Interest) -> Result<()> {
        self.registry.register(source, self.token, to_mio_interest(interest))?;
        Ok(())
    }

    fn reregister(&mut self, source: &mut S, interest: Interest) -> Result<()> {
        self.registry.reregister(source, self.token, to_mio_interest(interest))?;
        Ok(())
    }

    fn deregister(&mut self, source: &mut S) -> Result<()> {
        self.registry.deregister(source)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Calls {
        registered: Vec<Interest>,
        reregistered: Vec<Interest>,
        deregistered: u32,
    }

    struct RecordingReactor(Rc<RefCell<Calls>>);

    impl Reactor<()> for RecordingReactor {
        fn register(&mut self, _source: &mut (), interest: Interest) -> Result<()> {
            self.0.borrow_mut().registered.push(interest);
            Ok(())
        }

        fn reregister(&mut self, _source: &mut (), interest: Interest) -> Result<()> {
            self.0.borrow_mut().reregistered.push(interest);
            Ok(())
        }

        fn deregister(&mut self, _source: &mut ()) -> Result<()> {
            self.0.borrow_mut().deregistered += 1;
            Ok(())
        }
    }

    #[test]
    fn clears_registration_on_idle() {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut watcher = Watcher::new(RecordingReactor(Rc::clone(&calls)));
        let mut source = ();

        watcher.update(&mut source, Some(&WaitSet::readable(None))).unwrap();
        assert_eq!(calls.borrow().registered.len(), 1);

        watcher.update(&mut source, None).unwrap();
        assert_eq!(calls.borrow().deregistered, 1);
        assert!(!watcher.is_registered());
    }

    #[test]
    fn same_interest_is_a_noop() {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut watcher = Watcher::new(RecordingReactor(Rc::clone(&calls)));
        let mut source = ();

        watcher.update(&mut source, Some(&WaitSet::readable(None))).unwrap();
        watcher.update(&mut source, Some(&WaitSet::readable(None))).unwrap();
        assert_eq!(calls.borrow().registered.len(), 1);
        assert!(calls.borrow().reregistered.is_empty());
    }

    #[test]
    fn changed_interest_reregisters() {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut watcher = Watcher::new(RecordingReactor(Rc::clone(&calls)));
        let mut source = ();

        watcher.update(&mut source, Some(&WaitSet::readable(None))).unwrap();
        watcher.update(&mut source, Some(&WaitSet::writable(None))).unwrap();
        assert_eq!(calls.borrow().reregistered, vec![Interest::WRITABLE]);
    }
}
