//! Tag numbers, message-type codes and the repeating-group dictionary for a
//! FIX 4.4 session. This crate carries no wire-format logic of its own
//! (see `fix-codec`) — it's just the static data the codec and session
//! layers are parameterized over.

use std::collections::{HashMap, HashSet};
use std::fmt;

/// A FIX tag number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u32);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Tag {
    fn from(value: u32) -> Self {
        Tag(value)
    }
}

impl std::str::FromStr for Tag {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Tag)
    }
}

/// Header and trailer tags, fixed by the protocol itself.
pub mod tags {
    use super::Tag;

    pub const BEGIN_STRING: Tag = Tag(8);
    pub const BODY_LENGTH: Tag = Tag(9);
    pub const MSG_TYPE: Tag = Tag(35);
    pub const SENDER_COMP_ID: Tag = Tag(49);
    pub const TARGET_COMP_ID: Tag = Tag(56);
    pub const SENDER_SUB_ID: Tag = Tag(50);
    pub const TARGET_SUB_ID: Tag = Tag(57);
    pub const MSG_SEQ_NUM: Tag = Tag(34);
    pub const SENDING_TIME: Tag = Tag(52);
    pub const POSS_DUP_FLAG: Tag = Tag(43);
    pub const CHECK_SUM: Tag = Tag(10);

    pub const ENCRYPT_METHOD: Tag = Tag(98);
    pub const HEART_BT_INT: Tag = Tag(108);
    pub const TEST_REQ_ID: Tag = Tag(112);
    pub const BEGIN_SEQ_NO: Tag = Tag(7);
    pub const END_SEQ_NO: Tag = Tag(16);
    pub const NEW_SEQ_NO: Tag = Tag(36);
    pub const GAP_FILL_FLAG: Tag = Tag(123);
    pub const TEXT: Tag = Tag(58);
}

/// Session-level message type codes (§4.1).
pub mod msgtype {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const LOGON: &str = "A";
}

pub const BEGIN_STRING: &str = "FIX.4.4";

/// Static protocol metadata: the session-message-type set, the repeating
/// group parent→child dictionary, and a (non-exhaustive) tag↔name table
/// used only for human-readable debugging.
pub struct ProtocolDictionary {
    session_message_types: HashSet<&'static str>,
    repeating_group_children: HashMap<Tag, HashSet<Tag>>,
    tag_names: HashMap<Tag, &'static str>,
}

impl Default for ProtocolDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolDictionary {
    pub fn new() -> Self {
        let session_message_types = [
            msgtype::HEARTBEAT,
            msgtype::TEST_REQUEST,
            msgtype::RESEND_REQUEST,
            msgtype::SEQUENCE_RESET,
            msgtype::LOGOUT,
            msgtype::LOGON,
        ]
        .into_iter()
        .collect();

        // Parent tag -> set of tags that belong to one repetition of that
        // group. Derived from the FIX 4.4 `NoLegs`/`NoAllocs`-style group
        // definitions exercised by the wire fixtures this engine is tested
        // against (see tests/integration/codec_scenarios.rs).
        let repeating_group_children = [
            (Tag(73), [Tag(11), Tag(38), Tag(800)].into_iter().collect()),
            (Tag(124), [Tag(32), Tag(17), Tag(31)].into_iter().collect()),
            (Tag(454), [Tag(455), Tag(456)].into_iter().collect()),
            (Tag(78), [Tag(79)].into_iter().collect()),
            (
                Tag(453),
                [Tag(448), Tag(447), Tag(452), Tag(802)].into_iter().collect(),
            ),
            (Tag(802), [Tag(523), Tag(803)].into_iter().collect()),
            (Tag(444), [Tag(611), Tag(612), Tag(613)].into_iter().collect()),
        ]
        .into_iter()
        .collect::<HashMap<Tag, HashSet<Tag>>>();

        let tag_names = [
            (tags::BEGIN_STRING, "BeginString"),
            (tags::BODY_LENGTH, "BodyLength"),
            (tags::MSG_TYPE, "MsgType"),
            (tags::SENDER_COMP_ID, "SenderCompID"),
            (tags::TARGET_COMP_ID, "TargetCompID"),
            (tags::SENDER_SUB_ID, "SenderSubID"),
            (tags::TARGET_SUB_ID, "TargetSubID"),
            (tags::MSG_SEQ_NUM, "MsgSeqNum"),
            (tags::SENDING_TIME, "SendingTime"),
            (tags::POSS_DUP_FLAG, "PossDupFlag"),
            (tags::CHECK_SUM, "CheckSum"),
            (tags::ENCRYPT_METHOD, "EncryptMethod"),
            (tags::HEART_BT_INT, "HeartBtInt"),
            (tags::TEST_REQ_ID, "TestReqID"),
            (tags::BEGIN_SEQ_NO, "BeginSeqNo"),
            (tags::END_SEQ_NO, "EndSeqNo"),
            (tags::NEW_SEQ_NO, "NewSeqNo"),
            (tags::GAP_FILL_FLAG, "GapFillFlag"),
            (tags::TEXT, "Text"),
        ]
        .into_iter()
        .collect();

        ProtocolDictionary {
            session_message_types,
            repeating_group_children,
            tag_names,
        }
    }

    /// True if `msg_type` is one handled by the session layer itself
    /// rather than passed through to application observers.
    pub fn is_session_message(&self, msg_type: &str) -> bool {
        self.session_message_types.contains(msg_type)
    }

    /// The set of tags that belong to one repetition of the group whose
    /// count tag is `parent`, if `parent` is a known group tag.
    pub fn group_children(&self, parent: Tag) -> Option<&HashSet<Tag>> {
        self.repeating_group_children.get(&parent)
    }

    pub fn is_group_tag(&self, tag: Tag) -> bool {
        self.repeating_group_children.contains_key(&tag)
    }

    pub fn tag_name(&self, tag: Tag) -> Option<&'static str> {
        self.tag_names.get(&tag).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_message_types_cover_the_six_codes() {
        let dict = ProtocolDictionary::new();
        for code in ["0", "1", "2", "4", "5", "A"] {
            assert!(dict.is_session_message(code), "{code} should be a session message");
        }
        assert!(!dict.is_session_message("D"));
    }

    #[test]
    fn group_453_nests_group_802() {
        let dict = ProtocolDictionary::new();
        let children = dict.group_children(Tag(453)).expect("453 is a group tag");
        assert!(children.contains(&Tag(802)));
        assert!(dict.is_group_tag(Tag(802)));
        assert!(!dict.is_group_tag(Tag(11)));
    }
}
