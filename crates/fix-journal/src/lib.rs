//! Durable session/message store, backed by an embedded SQLite database
//! (§4.5). Messages are journaled as the raw wire bytes the codec
//! produced or consumed for them — an opaque blob that round-trips
//! through `fix_codec::Codec::decode`, which is all replay needs.

use fix_session::Session;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_i64(self) -> i64 {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session {sender}_{target} already exists")]
    SessionExists { sender: String, target: String },
    #[error("duplicate seq_no {seq_no} for session {session_key} ({direction})")]
    DuplicateSeqNo {
        seq_no: u64,
        session_key: String,
        direction: Direction,
    },
    #[error("journal integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

pub struct Journaler {
    conn: Connection,
}

impl Journaler {
    /// Open (creating if needed) a file-backed journal, or an in-memory
    /// one when `path` is `None`.
    pub fn open(path: Option<&Path>) -> Result<Self, JournalError> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        let journaler = Journaler { conn };
        journaler.apply_pragmas(path.is_some())?;
        journaler.apply_schema()?;
        journaler.run_integrity_check()?;
        tracing::debug!(file_backed = path.is_some(), "journal opened");
        Ok(journaler)
    }

    fn apply_pragmas(&self, file_backed: bool) -> Result<(), JournalError> {
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        if file_backed {
            self.conn.pragma_update(None, "journal_mode", "WAL")?;
            self.conn.pragma_update(None, "synchronous", "FULL")?;
        }
        Ok(())
    }

    fn apply_schema(&self) -> Result<(), JournalError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn run_integrity_check(&self) -> Result<(), JournalError> {
        let result: String =
            self.conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(JournalError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    /// All sessions recorded in the journal, reconstructed with their
    /// persisted sequence-number state.
    pub fn sessions(&self) -> Result<Vec<Session>, JournalError> {
        let mut stmt = self.conn.prepare(
            "SELECT sender_comp_id, target_comp_id, outbound_seq_no, inbound_seq_no FROM session",
        )?;
        let rows = stmt.query_map([], |row| {
            let sender: String = row.get(0)?;
            let target: String = row.get(1)?;
            let outbound: i64 = row.get(2)?;
            let inbound: i64 = row.get(3)?;
            Ok(Session::from_persisted(sender, target, outbound as u64, inbound as u64))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(JournalError::from)
    }

    /// Look up one session by its comp IDs directly, rather than loading
    /// every persisted session to find it.
    pub fn find_session(&self, sender: &str, target: &str) -> Result<Option<Session>, JournalError> {
        self.conn
            .query_row(
                "SELECT outbound_seq_no, inbound_seq_no FROM session \
                 WHERE sender_comp_id = ?1 AND target_comp_id = ?2",
                (sender, target),
                |row| {
                    let outbound: i64 = row.get(0)?;
                    let inbound: i64 = row.get(1)?;
                    Ok(Session::from_persisted(sender, target, outbound as u64, inbound as u64))
                },
            )
            .optional()
            .map_err(JournalError::from)
    }

    /// Create a brand-new session row, starting both counters at 1.
    pub fn create_session(&self, sender: &str, target: &str) -> Result<Session, JournalError> {
        let inserted = self.conn.execute(
            "INSERT INTO session (sender_comp_id, target_comp_id) VALUES (?1, ?2)",
            (sender, target),
        );
        match inserted {
            Ok(_) => Ok(Session::new(sender, target)),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(JournalError::SessionExists {
                    sender: sender.to_string(),
                    target: target.to_string(),
                })
            }
            Err(e) => Err(JournalError::from(e)),
        }
    }

    /// Keep the journal's session row in step with a live `Session`'s
    /// in-memory sequence counters.
    pub fn sync_session(&self, session: &Session) -> Result<(), JournalError> {
        self.conn.execute(
            "UPDATE session SET outbound_seq_no = ?1, inbound_seq_no = ?2 \
             WHERE sender_comp_id = ?3 AND target_comp_id = ?4",
            (
                session.snd_seq_num() as i64,
                session.next_expected_recv_seq_num() as i64,
                session.sender_comp_id(),
                session.target_comp_id(),
            ),
        )?;
        Ok(())
    }

    /// Persist one wire frame under `session_key` / `direction` /
    /// `seq_no` and update `session`'s persisted counters, both inside a
    /// single transaction (§4.5 "insert; update the session's last seq
    /// in the same transaction") — a crash between a standalone insert
    /// and a later standalone session update would otherwise leave a
    /// persisted message whose session row still reports the pre-accept
    /// seq no, breaking crash-safe recovery (§1). `session` is expected
    /// to already reflect the state this message's acceptance produces;
    /// the caller commits that state to its own in-memory `Session` only
    /// after this call returns `Ok`. A re-used `(seq_no, session_key,
    /// direction)` is a protocol-level duplicate, surfaced distinctly so
    /// the caller can tell it apart from a genuine storage failure; that
    /// path rolls the transaction back, leaving the session row
    /// untouched, via `Transaction`'s drop-without-commit.
    pub fn persist(
        &self,
        session_key: &str,
        direction: Direction,
        seq_no: u64,
        raw: &[u8],
        session: &Session,
    ) -> Result<(), JournalError> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT INTO message (seq_no, session, direction, msg) VALUES (?1, ?2, ?3, ?4)",
            (seq_no as i64, session_key, direction.as_i64(), raw),
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tracing::warn!(seq_no, session_key, %direction, "duplicate seq_no rejected");
                return Err(JournalError::DuplicateSeqNo {
                    seq_no,
                    session_key: session_key.to_string(),
                    direction,
                });
            }
            Err(e) => return Err(JournalError::from(e)),
        }
        tx.execute(
            "UPDATE session SET outbound_seq_no = ?1, inbound_seq_no = ?2 \
             WHERE sender_comp_id = ?3 AND target_comp_id = ?4",
            (
                session.snd_seq_num() as i64,
                session.next_expected_recv_seq_num() as i64,
                session.sender_comp_id(),
                session.target_comp_id(),
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn recover_msg(
        &self,
        session_key: &str,
        direction: Direction,
        seq_no: u64,
    ) -> Result<Option<Vec<u8>>, JournalError> {
        self.conn
            .query_row(
                "SELECT msg FROM message WHERE session = ?1 AND direction = ?2 AND seq_no = ?3",
                (session_key, direction.as_i64(), seq_no as i64),
                |row| row.get(0),
            )
            .optional()
            .map_err(JournalError::from)
    }

    /// Ordered `(seq_no, raw_bytes)` for `begin..=end`. `end == 0` means
    /// "through the most recent message", matching a `ResendRequest`
    /// with `EndSeqNo=0`.
    /// All messages across `sessions` (every session in the journal if
    /// empty) and `direction` (both, if `None`), for inspection tooling
    /// (§4.5 `getAllMsgs`) rather than a live session's own replay path.
    pub fn get_all_msgs(
        &self,
        sessions: &[&str],
        direction: Option<Direction>,
    ) -> Result<Vec<(String, Direction, u64, Vec<u8>)>, JournalError> {
        let mut stmt = self
            .conn
            .prepare("SELECT session, direction, seq_no, msg FROM message ORDER BY session ASC, direction ASC, seq_no ASC")?;
        let rows = stmt.query_map([], |row| {
            let session: String = row.get(0)?;
            let dir_raw: i64 = row.get(1)?;
            let seq_no: i64 = row.get(2)?;
            let msg: Vec<u8> = row.get(3)?;
            Ok((session, dir_raw, seq_no as u64, msg))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (session, dir_raw, seq_no, msg) = row?;
            let dir = if dir_raw == Direction::Outbound.as_i64() {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            if !sessions.is_empty() && !sessions.contains(&session.as_str()) {
                continue;
            }
            if let Some(want) = direction {
                if dir != want {
                    continue;
                }
            }
            out.push((session, dir, seq_no, msg));
        }
        Ok(out)
    }

    pub fn recover_msgs(
        &self,
        session_key: &str,
        direction: Direction,
        begin: u64,
        end: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, JournalError> {
        let mut stmt = if end == 0 {
            self.conn.prepare(
                "SELECT seq_no, msg FROM message \
                 WHERE session = ?1 AND direction = ?2 AND seq_no >= ?3 \
                 ORDER BY seq_no ASC",
            )?
        } else {
            self.conn.prepare(
                "SELECT seq_no, msg FROM message \
                 WHERE session = ?1 AND direction = ?2 AND seq_no BETWEEN ?3 AND ?4 \
                 ORDER BY seq_no ASC",
            )?
        };

        let rows = if end == 0 {
            stmt.query_map((session_key, direction.as_i64(), begin as i64), |row| {
                let seq: i64 = row.get(0)?;
                let msg: Vec<u8> = row.get(1)?;
                Ok((seq as u64, msg))
            })?
            .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(
                (session_key, direction.as_i64(), begin as i64, end as i64),
                |row| {
                    let seq: i64 = row.get(0)?;
                    let msg: Vec<u8> = row.get(1)?;
                    Ok((seq as u64, msg))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_recover_a_single_message() {
        let journal = Journaler::open(None).unwrap();
        let session = journal.create_session("S1", "T1").unwrap();
        journal
            .persist("S1_T1", Direction::Outbound, 1, b"8=FIX.4.4\x01", &session)
            .unwrap();

        let recovered = journal
            .recover_msg("S1_T1", Direction::Outbound, 1)
            .unwrap();
        assert_eq!(recovered, Some(b"8=FIX.4.4\x01".to_vec()));
    }

    #[test]
    fn recover_msgs_returns_an_ordered_contiguous_range() {
        let journal = Journaler::open(None).unwrap();
        let session = journal.create_session("S1", "T1").unwrap();
        for seq in 1..=5u64 {
            journal
                .persist("S1_T1", Direction::Outbound, seq, format!("seq={seq}").as_bytes(), &session)
                .unwrap();
        }

        let msgs = journal
            .recover_msgs("S1_T1", Direction::Outbound, 2, 4)
            .unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].0, 2);
        assert_eq!(msgs[2].0, 4);

        let through_latest = journal
            .recover_msgs("S1_T1", Direction::Outbound, 3, 0)
            .unwrap();
        assert_eq!(through_latest.len(), 3);
    }

    #[test]
    fn persisting_the_same_seq_no_twice_is_a_duplicate_error() {
        let journal = Journaler::open(None).unwrap();
        let session = journal.create_session("S1", "T1").unwrap();
        journal
            .persist("S1_T1", Direction::Outbound, 1, b"first", &session)
            .unwrap();

        let err = journal
            .persist("S1_T1", Direction::Outbound, 1, b"second", &session)
            .unwrap_err();
        assert!(matches!(err, JournalError::DuplicateSeqNo { seq_no: 1, .. }));
    }

    #[test]
    fn creating_the_same_session_twice_is_rejected() {
        let journal = Journaler::open(None).unwrap();
        journal.create_session("S1", "T1").unwrap();
        let err = journal.create_session("S1", "T1").unwrap_err();
        assert!(matches!(err, JournalError::SessionExists { .. }));
    }

    #[test]
    fn find_session_looks_up_by_comp_ids_without_a_match() {
        let journal = Journaler::open(None).unwrap();
        assert!(journal.find_session("S1", "T1").unwrap().is_none());

        let mut created = journal.create_session("S1", "T1").unwrap();
        created.allocate_snd_seq_no();
        journal.sync_session(&created).unwrap();

        let found = journal.find_session("S1", "T1").unwrap().unwrap();
        assert_eq!(found.snd_seq_num(), 2);
        assert!(journal.find_session("S1", "OTHER").unwrap().is_none());
    }

    #[test]
    fn sessions_reflect_synced_counters() {
        let journal = Journaler::open(None).unwrap();
        let mut session = journal.create_session("S1", "T1").unwrap();
        session.allocate_snd_seq_no();
        session.set_recv_seq_no(4);
        journal.sync_session(&session).unwrap();

        let reloaded = journal.sessions().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].snd_seq_num(), 2);
        assert_eq!(reloaded[0].next_expected_recv_seq_num(), 5);
    }

    #[test]
    fn survives_a_file_backed_round_trip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let journal = Journaler::open(Some(file.path())).unwrap();
            let session = journal.create_session("S1", "T1").unwrap();
            journal
                .persist("S1_T1", Direction::Outbound, 1, b"hello", &session)
                .unwrap();
        }
        let journal = Journaler::open(Some(file.path())).unwrap();
        let recovered = journal
            .recover_msg("S1_T1", Direction::Outbound, 1)
            .unwrap();
        assert_eq!(recovered, Some(b"hello".to_vec()));
    }

    #[test]
    fn get_all_msgs_filters_by_session_and_direction() {
        let journal = Journaler::open(None).unwrap();
        let s1 = journal.create_session("S1", "T1").unwrap();
        let s2 = journal.create_session("S2", "T2").unwrap();
        journal.persist("S1_T1", Direction::Outbound, 1, b"s1-out", &s1).unwrap();
        journal.persist("S1_T1", Direction::Inbound, 1, b"s1-in", &s1).unwrap();
        journal.persist("S2_T2", Direction::Outbound, 1, b"s2-out", &s2).unwrap();

        let everything = journal.get_all_msgs(&[], None).unwrap();
        assert_eq!(everything.len(), 3);

        let just_s1 = journal.get_all_msgs(&["S1_T1"], None).unwrap();
        assert_eq!(just_s1.len(), 2);
        assert!(just_s1.iter().all(|(session, ..)| session == "S1_T1"));

        let s1_outbound = journal.get_all_msgs(&["S1_T1"], Some(Direction::Outbound)).unwrap();
        assert_eq!(s1_outbound.len(), 1);
        assert_eq!(s1_outbound[0].3, b"s1-out");
    }
}
