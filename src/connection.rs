//! Per-connection session state machine (§4.4): message dispatch,
//! sequence validation, resend composition, and the Logon/Logout/
//! Heartbeat/TestRequest/ResendRequest/SequenceReset session messages.
//!
//! A `ConnectionHandler` doesn't own the reactor or the journaler —
//! those are process-wide, held by `Engine` (§4 "Ownership") — so every
//! method that needs them takes a reference. Timer registration ids are
//! the one piece of reactor state a handler does own, since they're
//! meaningless outside the connection they time.

use fix_codec::Codec;
use fix_journal::{Direction, JournalError, Journaler};
use fix_message::Message;
use fix_protocol::{msgtype, tags, ProtocolDictionary};
use fix_reactor::RegistrationId;
use fix_session::Session;
use std::sync::Arc;

use crate::error::{EngineError, SessionWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Disconnected,
    Connected,
    LoggedIn,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRole {
    Initiator,
    Acceptor,
}

/// Abstracts the socket so the state machine can be tested against an
/// in-memory fake instead of a real `mio` connection.
pub trait Transport {
    /// Write as much of `bytes` as the transport accepts right now and
    /// return the count. A non-blocking socket returns fewer bytes than
    /// given (possibly zero) rather than blocking; the caller is
    /// responsible for queuing and retrying the remainder.
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<usize>;

    /// Close the underlying connection. Called on Logout (§4.4).
    fn close(&mut self);

    /// The `mio::event::Source` backing this transport, if any, so the
    /// reactor can deregister it when the connection is torn down. `None`
    /// for transports that were never registered with a reactor (tests).
    fn as_mio_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        None
    }
}

impl Transport for mio::net::TcpStream {
    /// mio sockets are non-blocking: a `WouldBlock` here means the kernel
    /// send buffer is full, not a real I/O error. Report zero bytes
    /// written so the caller queues the rest for the next writable event
    /// instead of spinning the single reactor thread waiting for it.
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        match self.write(bytes) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }

    fn as_mio_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        Some(self)
    }
}

/// Test double: records every frame handed to it instead of touching a
/// socket.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<Vec<u8>>,
}

impl Transport for RecordingTransport {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.sent.push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn close(&mut self) {}
}

/// Result of processing one inbound frame: responses the caller must
/// encode and send (via `send_msg`), and the inbound message to notify
/// observers with, if sequence validation (or a Logon exception)
/// allows it.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub responses: Vec<Message>,
    pub notify_inbound: Option<Message>,
}

pub struct ConnectionHandler<T: Transport> {
    role: HandlerRole,
    state: ConnectionState,
    session: Session,
    session_key: String,
    dictionary: Arc<ProtocolDictionary>,
    codec: Codec,
    transport: T,
    read_buf: Vec<u8>,
    heartbeat_interval_secs: u64,
    heartbeat_emit_timer: Option<RegistrationId>,
    peer_silence_timer: Option<RegistrationId>,
    fd_registration: Option<RegistrationId>,
    pending_write: Vec<u8>,
}

impl<T: Transport> ConnectionHandler<T> {
    pub fn new(
        role: HandlerRole,
        session: Session,
        dictionary: Arc<ProtocolDictionary>,
        heartbeat_interval_secs: u64,
        transport: T,
    ) -> Self {
        let session_key = session.key();
        ConnectionHandler {
            role,
            state: ConnectionState::Connected,
            session,
            session_key,
            codec: Codec::new(dictionary.clone()),
            dictionary,
            transport,
            read_buf: Vec::new(),
            heartbeat_interval_secs,
            heartbeat_emit_timer: None,
            peer_silence_timer: None,
            fd_registration: None,
            pending_write: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.heartbeat_interval_secs
    }

    pub fn heartbeat_emit_timer(&self) -> Option<RegistrationId> {
        self.heartbeat_emit_timer
    }

    pub fn peer_silence_timer(&self) -> Option<RegistrationId> {
        self.peer_silence_timer
    }

    pub fn set_heartbeat_timers(&mut self, emit: RegistrationId, silence: RegistrationId) {
        self.heartbeat_emit_timer = Some(emit);
        self.peer_silence_timer = Some(silence);
    }

    pub fn fd_registration(&self) -> Option<RegistrationId> {
        self.fd_registration
    }

    pub fn has_pending_write(&self) -> bool {
        !self.pending_write.is_empty()
    }

    /// Push as much of the queued backlog through the transport as it
    /// accepts right now. Returns `true` once the backlog is fully
    /// drained, `false` if bytes remain queued for the next writable
    /// event.
    pub fn flush_pending_write(&mut self) -> std::io::Result<bool> {
        while !self.pending_write.is_empty() {
            let n = self.transport.send(&self.pending_write)?;
            if n == 0 {
                return Ok(false);
            }
            self.pending_write.drain(..n);
        }
        Ok(true)
    }

    pub fn set_fd_registration(&mut self, id: RegistrationId) {
        self.fd_registration = Some(id);
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Append freshly read bytes to the connection's buffer and drain
    /// every complete frame it now holds, dispatching each through
    /// `process_message`. Matches `handle_read`'s loop-until-no-more-
    /// complete-frames behavior.
    pub fn on_readable(
        &mut self,
        bytes: &[u8],
        journaler: &Journaler,
    ) -> Result<Vec<ProcessOutcome>, EngineError> {
        self.read_buf.extend_from_slice(bytes);
        let mut outcomes = Vec::new();

        loop {
            let decoded = self.codec.decode(&self.read_buf)?;
            let Some((msg, consumed)) = decoded else {
                break;
            };
            let frame = self.read_buf[..consumed].to_vec();
            self.read_buf.drain(..consumed);
            outcomes.push(self.process_message(&frame, msg, journaler)?);
            if matches!(self.state, ConnectionState::Disconnected | ConnectionState::LoggedOut) {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Core per-message algorithm (§4.4 step 1-5).
    pub fn process_message(
        &mut self,
        raw_frame: &[u8],
        decoded: Message,
        journaler: &Journaler,
    ) -> Result<ProcessOutcome, EngineError> {
        if decoded.get_field(tags::BEGIN_STRING) != Some(fix_protocol::BEGIN_STRING) {
            tracing::warn!(session = %self.session_key, "unexpected BeginString, disconnecting");
            self.state = ConnectionState::Disconnected;
            return Ok(ProcessOutcome::default());
        }

        let msg_type = decoded.msg_type().to_string();

        if decoded.get_field(tags::MSG_SEQ_NUM).and_then(|v| v.parse::<u64>().ok()).is_none() {
            tracing::warn!(session = %self.session_key, "missing or unparseable MsgSeqNum, disconnecting");
            self.state = ConnectionState::Disconnected;
            return Ok(ProcessOutcome::default());
        }

        if msg_type != msgtype::LOGON && self.state == ConnectionState::LoggedIn {
            let got_sender = decoded.get_field(tags::SENDER_COMP_ID);
            let got_target = decoded.get_field(tags::TARGET_COMP_ID);
            if !self.session.validate_comp_ids(got_sender, got_target) {
                let mismatch = EngineError::CompIdMismatch {
                    expected_sender: self.session.target_comp_id().to_string(),
                    expected_target: self.session.sender_comp_id().to_string(),
                    got_sender: got_sender.unwrap_or("").to_string(),
                    got_target: got_target.unwrap_or("").to_string(),
                };
                let warning = SessionWarning(mismatch.to_string());
                tracing::warn!(session = %self.session_key, %warning, "disconnecting");
                self.state = ConnectionState::Disconnected;
                return Ok(ProcessOutcome::default());
            }
        }

        let (effective_recv_seq_no, next_expected_after, mut responses) =
            if self.dictionary.is_session_message(&msg_type) {
                self.handle_session_message(&decoded, journaler)?
            } else {
                let seq_no = decoded
                    .get_field(tags::MSG_SEQ_NUM)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                (seq_no, seq_no, Vec::new())
            };

        let (ok, last_known) = self.session.validate_recv_seq_no(effective_recv_seq_no);
        let mut notify_inbound = None;
        if !ok {
            responses.push(messages::resend_request(last_known, 0));
            if msg_type == msgtype::LOGON {
                notify_inbound = Some(decoded);
            }
        } else {
            let mut tentative = self.session.clone();
            tentative.set_recv_seq_no(next_expected_after);
            match journaler.persist(
                &self.session_key,
                Direction::Inbound,
                effective_recv_seq_no,
                raw_frame,
                &tentative,
            ) {
                Ok(()) => {
                    self.session = tentative;
                    notify_inbound = Some(decoded);
                }
                Err(JournalError::DuplicateSeqNo { .. }) => {
                    if decoded.get_field(tags::POSS_DUP_FLAG) == Some("Y") {
                        tracing::debug!(session = %self.session_key, "duplicate inbound seqno with PossDupFlag=Y, ignoring");
                    } else {
                        tracing::error!(session = %self.session_key, "duplicate inbound seqno, disconnecting");
                        self.state = ConnectionState::Disconnected;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ProcessOutcome { responses, notify_inbound })
    }

    /// Returns `(wire_seq_no, next_expected_after, responses)`:
    /// `wire_seq_no` is the message's own `MsgSeqNum`, used for persist
    /// keying and duplicate detection; `next_expected_after` is the value
    /// `process_message` should feed `Session::set_recv_seq_no` once the
    /// persist succeeds. They only diverge for `SequenceReset`, whose
    /// `NewSeqNo` jumps the expected counter independent of its own
    /// `MsgSeqNum` — returning the wire number there would clobber the
    /// jump this function already applied.
    fn handle_session_message(
        &mut self,
        msg: &Message,
        journaler: &Journaler,
    ) -> Result<(u64, u64, Vec<Message>), EngineError> {
        let seq_no: u64 = msg
            .get_field(tags::MSG_SEQ_NUM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut next_expected_after = seq_no;
        let responses = match msg.msg_type() {
            msgtype::LOGON => self.handle_logon(msg, journaler)?,
            msgtype::LOGOUT => {
                self.state = ConnectionState::LoggedOut;
                self.transport.close();
                Vec::new()
            }
            msgtype::TEST_REQUEST => vec![messages::heartbeat(msg.get_field(tags::TEST_REQ_ID))],
            msgtype::RESEND_REQUEST => self.handle_resend_request(msg, journaler)?,
            msgtype::SEQUENCE_RESET => {
                let new_seq_no: u64 = msg
                    .get_field(tags::NEW_SEQ_NO)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(seq_no);
                let current_expected = self.session.next_expected_recv_seq_num();
                next_expected_after = if new_seq_no > current_expected {
                    new_seq_no.saturating_sub(1)
                } else {
                    tracing::warn!(
                        session = %self.session_key,
                        new_seq_no,
                        current_expected,
                        "ignoring SequenceReset that would move the expected seq no backward"
                    );
                    current_expected.saturating_sub(1)
                };
                Vec::new()
            }
            msgtype::HEARTBEAT => Vec::new(),
            other => {
                tracing::warn!(session = %self.session_key, msg_type = other, "unhandled session message type");
                Vec::new()
            }
        };
        Ok((seq_no, next_expected_after, responses))
    }

    fn handle_logon(&mut self, msg: &Message, journaler: &Journaler) -> Result<Vec<Message>, EngineError> {
        if self.state == ConnectionState::LoggedIn {
            return Ok(Vec::new());
        }

        if self.role == HandlerRole::Acceptor {
            let incoming_sender = msg.get_field(tags::SENDER_COMP_ID).unwrap_or_default().to_string();
            let incoming_target = msg.get_field(tags::TARGET_COMP_ID).unwrap_or_default().to_string();
            // our sender is their target and vice versa
            self.session = lookup_or_create_session(journaler, &incoming_target, &incoming_sender)?;
            self.session_key = self.session.key();
        }

        // A HeartBtInt of 0 would arm a zero-period timer and busy-spin the
        // reactor, so a peer can't negotiate one even if it asks.
        let heart_bt_int: u64 = msg
            .get_field(tags::HEART_BT_INT)
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(30);
        self.heartbeat_interval_secs = heart_bt_int;
        self.state = ConnectionState::LoggedIn;

        Ok(match self.role {
            HandlerRole::Acceptor => vec![messages::logon(heart_bt_int)],
            HandlerRole::Initiator => Vec::new(),
        })
    }

    /// `_handleResendRequest`'s gap-fill cursor algorithm (§4.4,
    /// testable property 6 / scenario S5).
    fn handle_resend_request(&mut self, msg: &Message, journaler: &Journaler) -> Result<Vec<Message>, EngineError> {
        let begin_seq_no: u64 = msg
            .get_field(tags::BEGIN_SEQ_NO)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let end_seq_no: u64 = msg
            .get_field(tags::END_SEQ_NO)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let replay = journaler.recover_msgs(&self.session_key, Direction::Outbound, begin_seq_no, end_seq_no)?;

        // 0 means "through the latest message we've sent"; resolve it to a
        // concrete upper bound so a range with no journaled rows at all
        // still gets gap-filled instead of silently dropped.
        let effective_end = if end_seq_no == 0 {
            self.session.snd_seq_num()
        } else {
            end_seq_no + 1
        };

        let mut responses = Vec::new();
        let mut gap_fill_begin = begin_seq_no;
        let mut gap_fill_end = begin_seq_no;

        for (seq_no, raw) in replay {
            // A seq_no the journal jumped to without a row for everything in
            // between is a hole (never persisted, or pruned) — fold it into
            // the pending gap-fill range rather than silently skipping it.
            if seq_no > gap_fill_end {
                gap_fill_end = seq_no;
            }
            let Some((decoded, _)) = self.codec.decode(&raw)? else {
                continue;
            };
            if self.dictionary.is_session_message(decoded.msg_type()) {
                gap_fill_end = seq_no + 1;
                continue;
            }
            if self.should_resend_message(&decoded) {
                if gap_fill_begin < gap_fill_end {
                    responses.push(messages::gap_fill(gap_fill_begin, gap_fill_end));
                }
                responses.push(strip_for_resend(decoded, seq_no));
                gap_fill_begin = seq_no + 1;
            } else {
                gap_fill_end = seq_no + 1;
            }
        }
        if effective_end > gap_fill_end {
            gap_fill_end = effective_end;
        }
        if gap_fill_begin < gap_fill_end {
            responses.push(messages::gap_fill(gap_fill_begin, gap_fill_end));
        }
        Ok(responses)
    }

    /// Extension hook mirroring `Engine.shouldResendMessage` — like
    /// `validate_session`, a pure default of "yes" meant to be
    /// overridden by a caller wrapping the engine.
    fn should_resend_message(&self, _msg: &Message) -> bool {
        true
    }

    /// Encode, journal, then queue one outbound message for write.
    /// Journaling happens before the frame ever reaches the transport —
    /// a peer must never receive a message the durable log has no
    /// record of. Bytes the transport can't accept immediately stay in
    /// `pending_write` for the caller to drain via `flush_pending_write`
    /// on the next writable event. Returns the encoded frame so the
    /// caller (`Engine`) can reset the heartbeat-emit timer, matching
    /// the original treating any send as heartbeat activity.
    pub fn send_msg(&mut self, msg: &Message, journaler: &Journaler) -> Result<Vec<u8>, EngineError> {
        if !matches!(self.state, ConnectionState::Connected | ConnectionState::LoggedIn) {
            return Err(EngineError::NotConnected);
        }

        let (encoded, seq_no) = self.codec.encode_with_seq_no(msg, &mut self.session)?;

        match journaler.persist(&self.session_key, Direction::Outbound, seq_no, &encoded, &self.session) {
            Ok(()) => {}
            // A resend carries PossDupFlag=Y and reuses its original seq_no,
            // which the journal already has a row for — that's expected, and
            // the frame still goes out over the wire below.
            Err(JournalError::DuplicateSeqNo { .. }) => {
                tracing::error!(session = %self.session_key, seq_no, "duplicate outbound seqno on send");
            }
            Err(e) => return Err(e.into()),
        }

        self.pending_write.extend_from_slice(&encoded);
        self.flush_pending_write()?;
        Ok(encoded)
    }

    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

fn lookup_or_create_session(journaler: &Journaler, sender: &str, target: &str) -> Result<Session, EngineError> {
    if let Some(existing) = journaler.find_session(sender, target)? {
        return Ok(existing);
    }
    Ok(journaler.create_session(sender, target)?)
}

/// Strip the header/trailer fields a resend must re-stamp fresh
/// (`BeginString`, `BodyLength`, `SendingTime`, `SenderCompID`,
/// `TargetCompID`, `CheckSum`), keep the historical `MsgSeqNum`, and
/// mark `PossDupFlag=Y` (design notes, "Header re-stamping on resend").
fn strip_for_resend(mut msg: Message, seq_no: u64) -> Message {
    for tag in [
        tags::BEGIN_STRING,
        tags::BODY_LENGTH,
        tags::SENDING_TIME,
        tags::SENDER_COMP_ID,
        tags::TARGET_COMP_ID,
        tags::CHECK_SUM,
    ] {
        msg.remove_field(tag);
    }
    msg.set_field(tags::MSG_SEQ_NUM, seq_no.to_string());
    msg.set_field(tags::POSS_DUP_FLAG, "Y");
    msg
}

/// Constructors for the session-level message types a `ConnectionHandler`
/// emits on its own initiative.
pub mod messages {
    use fix_message::Message;
    use fix_protocol::{msgtype, tags};

    pub fn resend_request(begin_seq_no: u64, end_seq_no: u64) -> Message {
        let mut m = Message::new(msgtype::RESEND_REQUEST);
        m.set_field(tags::BEGIN_SEQ_NO, begin_seq_no.to_string());
        m.set_field(tags::END_SEQ_NO, end_seq_no.to_string());
        m
    }

    pub fn heartbeat(test_req_id: Option<&str>) -> Message {
        let mut m = Message::new(msgtype::HEARTBEAT);
        if let Some(id) = test_req_id {
            m.set_field(tags::TEST_REQ_ID, id.to_string());
        }
        m
    }

    pub fn test_request(id: &str) -> Message {
        let mut m = Message::new(msgtype::TEST_REQUEST);
        m.set_field(tags::TEST_REQ_ID, id.to_string());
        m
    }

    pub fn logon(heart_bt_int: u64) -> Message {
        let mut m = Message::new(msgtype::LOGON);
        m.set_field(tags::ENCRYPT_METHOD, "0");
        m.set_field(tags::HEART_BT_INT, heart_bt_int.to_string());
        m
    }

    pub fn logout() -> Message {
        Message::new(msgtype::LOGOUT)
    }

    pub fn gap_fill(begin_seq_no: u64, new_seq_no: u64) -> Message {
        let mut m = Message::new(msgtype::SEQUENCE_RESET);
        m.set_field(tags::GAP_FILL_FLAG, "Y");
        m.set_field(tags::MSG_SEQ_NUM, begin_seq_no.to_string());
        m.set_field(tags::NEW_SEQ_NO, new_seq_no.to_string());
        m
    }
}
