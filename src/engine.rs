//! Ties the lower crates together: socket lifecycle (§4's `EndPoint`),
//! the `ConnectionHandler` fan-out, and the single reactor loop that
//! drives both (§5 concurrency model).
//!
//! Reactor callbacks never get `&mut Engine` — they just push a
//! lightweight `ReadyEvent` onto a shared queue, and `run_once` drains
//! that queue afterward with ordinary unencumbered `&mut self` access.
//! This sidesteps the self-referential-closure problem a
//! `Rc<RefCell<Engine>>` design would otherwise require, at the cost of
//! one extra indirection per readiness event.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use fix_journal::{Direction, Journaler};
use fix_message::Message;
use fix_protocol::ProtocolDictionary;
use fix_reactor::{EventManager, Interest};
use fix_session::Session;

use crate::config::{EngineConfig, Role};
use crate::connection::{messages, ConnectionHandler, HandlerRole, ProcessOutcome, Transport};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

enum ReadyEvent {
    Readable(ConnectionId),
    Writable(ConnectionId),
    HeartbeatEmit(ConnectionId),
    PeerSilence(ConnectionId),
    AcceptReady,
    ConnectRetry,
}

type ObserverFn = Box<dyn FnMut(&Message)>;

struct Observer {
    direction: Option<Direction>,
    msg_type: Option<String>,
    callback: ObserverFn,
}

/// Generic over the transport so the reactor/dispatch plumbing can be
/// exercised without real sockets (see `tests/integration`). Real usage
/// instantiates `Engine<mio::net::TcpStream>` (see the impl block
/// below for the network-specific half: accept/connect/run_once).
pub struct Engine<T: Transport> {
    config: EngineConfig,
    dictionary: Arc<ProtocolDictionary>,
    journaler: Journaler,
    reactor: EventManager,
    connections: HashMap<ConnectionId, ConnectionHandler<T>>,
    next_connection_id: u64,
    ready: Rc<RefCell<Vec<ReadyEvent>>>,
    observers: Vec<Observer>,
    /// Only ever populated via `Engine<mio::net::TcpStream>::start`, but
    /// kept on the generic struct since its type doesn't depend on `T`.
    listener: Option<mio::net::TcpListener>,
    /// Pending Initiator reconnect timer, if a connect attempt has failed
    /// and a retry is armed. Reactor timers recur on their own, so this
    /// must be unregistered once a connect attempt stops needing it —
    /// otherwise it keeps firing `attempt_connect` (and opening duplicate
    /// connections) long after one has succeeded.
    reconnect_timer: Option<fix_reactor::RegistrationId>,
}

impl<T: Transport> Engine<T> {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let journaler = Journaler::open(config.journal_path.as_deref())?;
        Ok(Engine {
            config,
            dictionary: Arc::new(ProtocolDictionary::new()),
            journaler,
            reactor: EventManager::new()?,
            connections: HashMap::new(),
            next_connection_id: 0,
            ready: Rc::new(RefCell::new(Vec::new())),
            observers: Vec::new(),
            listener: None,
            reconnect_timer: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn journaler(&self) -> &Journaler {
        &self.journaler
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionHandler<T>> {
        self.connections.get(&id)
    }

    /// Register an application observer. `direction`/`msg_type` act as
    /// wildcards when `None` (§4.4 "Observers").
    pub fn add_message_handler(
        &mut self,
        direction: Option<Direction>,
        msg_type: Option<&str>,
        callback: impl FnMut(&Message) + 'static,
    ) {
        self.observers.push(Observer {
            direction,
            msg_type: msg_type.map(str::to_owned),
            callback: Box::new(callback),
        });
    }

    /// Pure capacity-check extension point; always permits a session,
    /// matching `FIXEngine.validateSession`'s always-`true` default in
    /// the original (supplemented behavior, see SPEC_FULL.md).
    pub fn validate_session(&self, _sender_comp_id: &str, _target_comp_id: &str) -> bool {
        true
    }

    fn notify(&mut self, direction: Direction, msg: &Message) {
        for observer in &mut self.observers {
            let direction_matches = observer.direction.map_or(true, |d| d == direction);
            let type_matches = observer
                .msg_type
                .as_deref()
                .map_or(true, |mt| mt == msg.msg_type());
            if direction_matches && type_matches {
                (observer.callback)(msg);
            }
        }
    }

    fn alloc_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        id
    }

    /// Send one message through an established connection: encode,
    /// write, persist, notify observers, and re-arm the heartbeat-emit
    /// timer (any send counts as heartbeat activity).
    pub fn send(&mut self, id: ConnectionId, msg: &Message) -> Result<(), EngineError> {
        let handler = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| EngineError::UnknownSession(format!("{id:?}")))?;
        handler.send_msg(msg, &self.journaler)?;
        if handler.has_pending_write() {
            if let (Some(reg), Some(source)) = (handler.fd_registration(), handler.transport_mut().as_mio_source()) {
                self.reactor.reregister_fd(reg, source, Interest::ReadWrite)?;
            }
        }
        if let Some(timer) = handler.heartbeat_emit_timer() {
            self.reactor.reset_timer(timer);
        }
        self.notify(Direction::Outbound, msg);
        Ok(())
    }

    /// A fd we previously put in `ReadWrite` mode (because a send left
    /// bytes queued) became writable: flush as much as the socket takes
    /// and drop back to `Read`-only once the backlog clears.
    fn handle_writable(&mut self, id: ConnectionId) -> Result<(), EngineError> {
        let Some(handler) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let drained = handler.flush_pending_write()?;
        if drained {
            if let (Some(reg), Some(source)) = (handler.fd_registration(), handler.transport_mut().as_mio_source()) {
                self.reactor.reregister_fd(reg, source, Interest::Read)?;
            }
        }
        Ok(())
    }

    /// Send a heartbeat/test-request triggered by a timer callback. A
    /// `ConnectionId` queued earlier in the same `run_once` batch can
    /// already be gone by the time its timer fires (e.g. a Logout
    /// processed from the same poll tore the connection down) — that's
    /// a stale, harmless event, not a reason to abort the whole batch.
    fn send_timer_message(&mut self, id: ConnectionId, msg: &Message) -> Result<(), EngineError> {
        match self.send(id, msg) {
            Ok(()) => Ok(()),
            Err(EngineError::UnknownSession(_)) => {
                tracing::debug!(?id, "skipping timer event for a connection already torn down");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply one `ProcessOutcome`: notify inbound observers, then send
    /// every queued response in order (§4.4 step 4). A response send that
    /// fails because the connection already dropped out from under it
    /// (e.g. `process_message` disconnected it earlier in the same
    /// outcome) stops delivery of this outcome's remaining responses but
    /// doesn't abort the batch `run_once` is draining.
    fn apply_outcome(&mut self, id: ConnectionId, outcome: ProcessOutcome) -> Result<(), EngineError> {
        if let Some(msg) = &outcome.notify_inbound {
            self.notify(Direction::Inbound, msg);
        }
        for response in &outcome.responses {
            match self.send(id, response) {
                Ok(()) => {}
                Err(EngineError::NotConnected | EngineError::UnknownSession(_)) => {
                    tracing::debug!(?id, "connection gone mid-outcome, dropping its remaining responses");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.arm_timers_if_just_logged_in(id);
        self.remove_if_closed(id);
        Ok(())
    }

    /// Drop a connection's `Engine`-side bookkeeping once its handler has
    /// left `LoggedIn`/`Connected` for good (§4.4 Logout, and any
    /// disconnect path). Unregisters its timers (and fd, if any) from the
    /// reactor first — an armed timer or fd left behind would keep firing
    /// for a connection id that no longer resolves.
    fn remove_if_closed(&mut self, id: ConnectionId) {
        let closed = self.connections.get(&id).is_some_and(|h| {
            matches!(
                h.state(),
                crate::connection::ConnectionState::Disconnected
                    | crate::connection::ConnectionState::LoggedOut
            )
        });
        if closed {
            self.teardown_connection(id);
        }
    }

    /// Remove a connection's handler, unregistering every reactor
    /// registration (timers, fd) it holds.
    fn teardown_connection(&mut self, id: ConnectionId) {
        let Some(mut handler) = self.connections.remove(&id) else {
            return;
        };
        if let Some(timer) = handler.heartbeat_emit_timer() {
            self.reactor.unregister_timer(timer);
        }
        if let Some(timer) = handler.peer_silence_timer() {
            self.reactor.unregister_timer(timer);
        }
        if let Some(fd) = handler.fd_registration() {
            if let Some(source) = handler.transport_mut().as_mio_source() {
                let _ = self.reactor.unregister_fd(fd, source);
            }
        }
    }

    fn arm_timers_if_just_logged_in(&mut self, id: ConnectionId) {
        let Some(handler) = self.connections.get(&id) else {
            return;
        };
        if handler.heartbeat_emit_timer().is_some() {
            return;
        }
        if handler.state() != crate::connection::ConnectionState::LoggedIn {
            return;
        }
        let period = Duration::from_secs(handler.heartbeat_interval_secs());
        let silence_period = period.mul_f64(1.10);

        let ready_emit = self.ready.clone();
        let emit_id = id;
        let emit_timer = self.reactor.register_timer(period, move || {
            ready_emit.borrow_mut().push(ReadyEvent::HeartbeatEmit(emit_id));
        });

        let ready_silence = self.ready.clone();
        let silence_timer = self.reactor.register_timer(silence_period, move || {
            ready_silence.borrow_mut().push(ReadyEvent::PeerSilence(emit_id));
        });

        if let Some(handler) = self.connections.get_mut(&id) {
            handler.set_heartbeat_timers(emit_timer, silence_timer);
        }
    }

    /// Tear down every live connection and stop retrying a pending
    /// Initiator connect (§5: retries "continue indefinitely until
    /// `stop()`"; §3 Ownership: "EndPoint ... closes them on stop").
    /// The listener, if any, is dropped so no further inbound connection
    /// is accepted.
    pub fn stop(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            self.reactor.unregister_timer(timer);
        }
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(handler) = self.connections.get_mut(&id) {
                handler.transport_mut().close();
            }
            self.teardown_connection(id);
        }
        self.listener = None;
    }
}

// ---------------------------------------------------------------------------
// Network-specific half: real sockets via mio.
// ---------------------------------------------------------------------------

impl Engine<mio::net::TcpStream> {
    /// Start listening (Acceptor) or make the first connect attempt
    /// (Initiator), per the configured `Role`.
    pub fn start(&mut self) -> Result<(), EngineError> {
        match self.config.role.clone() {
            Role::Acceptor { bind_host, bind_port } => {
                let addr = format!("{bind_host}:{bind_port}")
                    .parse()
                    .map_err(|_| EngineError::Session("invalid bind address".into()))?;
                let mut listener = mio::net::TcpListener::bind(addr)?;
                let ready = self.ready.clone();
                self.reactor.register_fd(&mut listener, Interest::Read, move |_| {
                    ready.borrow_mut().push(ReadyEvent::AcceptReady);
                })?;
                self.listener = Some(listener);
            }
            Role::Initiator { .. } => self.attempt_connect()?,
        }
        Ok(())
    }

    fn attempt_connect(&mut self) -> Result<(), EngineError> {
        let Role::Initiator { host, port, reconnect_interval_secs } = self.config.role.clone() else {
            return Ok(());
        };
        if let Some(timer) = self.reconnect_timer.take() {
            self.reactor.unregister_timer(timer);
        }
        let addr = format!("{host}:{port}")
            .parse()
            .map_err(|_| EngineError::Session("invalid connect address".into()))?;

        let connected = match mio::net::TcpStream::connect(addr) {
            Ok(stream) => {
                let session = Session::new(self.config.sender_comp_id.clone(), self.config.target_comp_id.clone());
                match self.register_connection(HandlerRole::Initiator, stream, session) {
                    Ok(_) => true,
                    Err(err) => {
                        tracing::warn!(%err, "registering initiator connection failed, retrying");
                        false
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%err, "initiator connect failed, retrying");
                false
            }
        };
        if !connected {
            let ready = self.ready.clone();
            let timer = self
                .reactor
                .register_timer(Duration::from_secs(reconnect_interval_secs), move || {
                    ready.borrow_mut().push(ReadyEvent::ConnectRetry);
                });
            self.reconnect_timer = Some(timer);
        }
        Ok(())
    }

    fn register_connection(
        &mut self,
        role: HandlerRole,
        mut stream: mio::net::TcpStream,
        session: Session,
    ) -> Result<ConnectionId, EngineError> {
        let id = self.alloc_connection_id();
        let ready = self.ready.clone();
        let fd_registration = self.reactor.register_fd(&mut stream, Interest::Read, move |interest| {
            let mut q = ready.borrow_mut();
            if matches!(interest, Interest::Read | Interest::ReadWrite) {
                q.push(ReadyEvent::Readable(id));
            }
            if matches!(interest, Interest::Write | Interest::ReadWrite) {
                q.push(ReadyEvent::Writable(id));
            }
        })?;
        let mut handler = ConnectionHandler::new(
            role,
            session,
            self.dictionary.clone(),
            self.config.heartbeat_interval_secs,
            stream,
        );
        handler.set_fd_registration(fd_registration);
        self.connections.insert(id, handler);
        if role == HandlerRole::Initiator {
            let heart_bt_int = self.config.heartbeat_interval_secs;
            let mut logon = messages::logon(heart_bt_int);
            if let Some(sub_id) = &self.config.sender_sub_id {
                logon.set_field(fix_protocol::tags::SENDER_SUB_ID, sub_id.clone());
            }
            if let Some(sub_id) = &self.config.target_sub_id {
                logon.set_field(fix_protocol::tags::TARGET_SUB_ID, sub_id.clone());
            }
            self.send(id, &logon)?;
        }
        Ok(id)
    }

    /// One turn of the reactor: block for at most `timeout`, then drain
    /// and process whatever fired.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<(), EngineError> {
        self.reactor.wait_for_event_with_timeout(timeout)?;

        let events: Vec<_> = self.ready.borrow_mut().drain(..).collect();
        for event in events {
            match event {
                ReadyEvent::AcceptReady => self.accept_pending()?,
                ReadyEvent::ConnectRetry => self.attempt_connect()?,
                ReadyEvent::Readable(id) => self.handle_readable(id)?,
                ReadyEvent::Writable(id) => self.handle_writable(id)?,
                ReadyEvent::HeartbeatEmit(id) => self.send_timer_message(id, &messages::heartbeat(None))?,
                ReadyEvent::PeerSilence(id) => self.send_timer_message(id, &messages::test_request("TEST"))?,
            }
        }
        Ok(())
    }

    fn accept_pending(&mut self) -> Result<(), EngineError> {
        let mut accepted = Vec::new();
        loop {
            let outcome = match self.listener.as_mut() {
                Some(listener) => listener.accept(),
                None => break,
            };
            match outcome {
                Ok((stream, peer)) => accepted.push((stream, peer)),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }
        for (stream, peer) in accepted {
            tracing::info!(%peer, "accepted inbound connection");
            // real CompIDs aren't known until Logon; handle_logon
            // replaces this placeholder session once they are.
            let session = Session::new("", "");
            self.register_connection(HandlerRole::Acceptor, stream, session)?;
        }
        Ok(())
    }

    /// mio registers fds edge-triggered, so one `Readable` event can mean
    /// more bytes are sitting in the kernel buffer than a single `read`
    /// drains. Keep reading until the socket reports `WouldBlock` (or
    /// EOF) or the event loop would otherwise never see the rest.
    fn handle_readable(&mut self, id: ConnectionId) -> Result<(), EngineError> {
        let mut buf = [0u8; 8192];
        loop {
            let Some(handler) = self.connections.get_mut(&id) else {
                return Ok(());
            };
            let n = match handler.transport_mut().read(&mut buf) {
                Ok(0) => {
                    handler.disconnect();
                    self.teardown_connection(id);
                    return Ok(());
                }
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            if let Some(timer) = handler.peer_silence_timer() {
                self.reactor.reset_timer(timer);
            }

            let outcomes = handler.on_readable(&buf[..n], &self.journaler)?;
            for outcome in outcomes {
                self.apply_outcome(id, outcome)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RecordingTransport;

    fn test_config() -> EngineConfig {
        EngineConfig {
            journal_path: None,
            role: Role::Acceptor { bind_host: "127.0.0.1".into(), bind_port: 0 },
            sender_comp_id: "SRV".into(),
            target_comp_id: "CLI".into(),
            sender_sub_id: None,
            target_sub_id: None,
            heartbeat_interval_secs: 30,
        }
    }

    /// Removing a connection must unregister its timers, or an
    /// already-fired-but-stale timer id would make a later `send()`
    /// fail with `UnknownSession` and abort `run_once` via `?`.
    #[test]
    fn removing_a_connection_unregisters_its_timers() {
        let mut engine: Engine<RecordingTransport> = Engine::new(test_config()).unwrap();
        let id = engine.alloc_connection_id();
        let mut handler = ConnectionHandler::new(
            HandlerRole::Acceptor,
            Session::new("SRV", "CLI"),
            engine.dictionary.clone(),
            30,
            RecordingTransport::default(),
        );
        let ready_a = engine.ready.clone();
        let emit = engine.reactor.register_timer(Duration::from_secs(30), move || {
            ready_a.borrow_mut().push(ReadyEvent::HeartbeatEmit(id));
        });
        let ready_b = engine.ready.clone();
        let silence = engine.reactor.register_timer(Duration::from_secs(33), move || {
            ready_b.borrow_mut().push(ReadyEvent::PeerSilence(id));
        });
        handler.set_heartbeat_timers(emit, silence);
        handler.disconnect();
        engine.connections.insert(id, handler);

        engine.remove_if_closed(id);

        assert!(!engine.connections.contains_key(&id));
        assert!(!engine.reactor.is_registered(emit));
        assert!(!engine.reactor.is_registered(silence));
    }

    /// `stop()` closes every live connection's transport and drops them
    /// from the engine, rather than leaving them registered with a
    /// reactor that's no longer going to drive them.
    #[test]
    fn stop_closes_and_drops_every_connection() {
        let mut engine: Engine<RecordingTransport> = Engine::new(test_config()).unwrap();
        let id = engine.alloc_connection_id();
        let handler = ConnectionHandler::new(
            HandlerRole::Acceptor,
            Session::new("SRV", "CLI"),
            engine.dictionary.clone(),
            30,
            RecordingTransport::default(),
        );
        engine.connections.insert(id, handler);

        engine.stop();

        assert!(engine.connections.is_empty());
    }
}
