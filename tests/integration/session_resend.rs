//! End-to-end session lifecycle: Logon handshake, application sends that
//! actually round-trip through the journal, and a peer-initiated
//! ResendRequest replaying that journal — all driven through
//! `ConnectionHandler::on_readable` the way a real peer would, rather
//! than the narrower single-step unit tests in `connection.rs`.

use fix_engine::connection::{messages, ConnectionHandler, ConnectionState, HandlerRole, RecordingTransport};
use fix_engine::{msgtype, tags, Direction, Journaler, Message, ProtocolDictionary, Session, Tag};
use std::sync::Arc;

fn dict() -> Arc<ProtocolDictionary> {
    Arc::new(ProtocolDictionary::new())
}

/// Encode `msg` as if `sender` had sent it, advancing `peer_session`'s
/// own outbound counter the way a real remote session would.
fn encode_from_peer(peer_session: &mut Session, msg: &Message) -> Vec<u8> {
    let codec = fix_engine::Codec::new(dict());
    codec.encode(msg, peer_session).unwrap()
}

#[test]
fn a_full_handshake_then_sends_then_a_peer_resend_request_replay_the_journal() {
    let journaler = Journaler::open(None).unwrap();
    let mut h = ConnectionHandler::new(
        HandlerRole::Acceptor,
        Session::new("", ""),
        dict(),
        30,
        RecordingTransport::default(),
    );
    // Tracks CLI's own outbound stream to SRV, independent of our session.
    let mut peer_session = Session::new("CLI", "SRV");

    // 1. Logon handshake (S3) creates the session with swapped CompIDs
    // and logs in; our echoed Logon becomes our outbound seq 1.
    let raw_logon = encode_from_peer(&mut peer_session, &messages::logon(30));
    let outcomes = h.on_readable(&raw_logon, &journaler).unwrap();
    assert_eq!(h.state(), ConnectionState::LoggedIn);
    assert_eq!(outcomes[0].responses[0].msg_type(), msgtype::LOGON);
    for response in &outcomes[0].responses {
        h.send_msg(response, &journaler).unwrap();
    }

    // 2. Real application sends, persisted by send_msg itself: our
    // outbound stream is now 1=Logon, 2=order-1, 3=Heartbeat, 4=order-2.
    let mut order1 = Message::new("D");
    order1.set_field(Tag(11), "order-1");
    let encoded_order1 = h.send_msg(&order1, &journaler).unwrap();
    assert_eq!(h.transport_mut().sent.last().unwrap(), &encoded_order1);

    h.send_msg(&messages::heartbeat(None), &journaler).unwrap();

    let mut order2 = Message::new("D");
    order2.set_field(Tag(11), "order-2");
    h.send_msg(&order2, &journaler).unwrap();

    // 3. CLI asks us to replay its view of our outbound stream from 2
    // onward; this ResendRequest is itself CLI's seq 2 (after its own
    // Logon at seq 1), so it passes our recv-seq validation cleanly.
    let raw_resend_request = encode_from_peer(&mut peer_session, &messages::resend_request(2, 0));
    let outcomes = h.on_readable(&raw_resend_request, &journaler).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].notify_inbound.is_some());

    // Heartbeat (seq 3) folds silently into a gap-fill; the two
    // NewOrderSingles resend with PossDupFlag=Y.
    let replay = &outcomes[0].responses;
    assert_eq!(replay.len(), 3);
    assert_eq!(replay[0].get_field(tags::POSS_DUP_FLAG), Some("Y"));
    assert_eq!(replay[0].get_field(Tag(11)), Some("order-1"));
    assert_eq!(replay[1].msg_type(), msgtype::SEQUENCE_RESET);
    assert_eq!(replay[1].get_field(tags::MSG_SEQ_NUM), Some("3"));
    assert_eq!(replay[1].get_field(tags::NEW_SEQ_NO), Some("4"));
    assert_eq!(replay[2].get_field(Tag(11)), Some("order-2"));

    // 4. Re-persisting the same outbound seqno is a journal-level duplicate.
    let err = journaler
        .persist(h.session_key(), Direction::Outbound, 2, &encoded_order1, &peer_session)
        .unwrap_err();
    assert!(matches!(err, fix_engine::JournalError::DuplicateSeqNo { .. }));
}
