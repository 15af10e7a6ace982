//! Wire encode/decode for FIX tag-value messages (§4.2).
//!
//! Decoding is tolerant: a truncated frame just means "wait for more
//! bytes" (`Ok(None)`), a bad checksum is logged and the message is
//! still returned, and an unexpected header tag is logged but doesn't
//! stop decoding. A frame is only rejected outright as malformed when
//! its `BodyLength` isn't a number, or is one so large decoding it could
//! never complete (there's no way to know where such a frame ends, and
//! no legitimate frame is anywhere near that size).

use fix_message::Message;
use fix_protocol::{msgtype, tags, ProtocolDictionary, Tag, BEGIN_STRING};
use fix_session::Session;
use std::collections::HashSet;
use std::sync::Arc;

const SOH: u8 = 0x01;

/// No legitimate FIX 4.4 session or application message body approaches
/// this size; a `BodyLength` beyond it is either corrupt or a peer
/// trying to make `on_readable` buffer unbounded data waiting for a
/// frame that will never complete.
const MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("cannot encode {msg_type} ({reason}) without MsgSeqNum already set on the message")]
    MissingSeqNumForResend { msg_type: String, reason: &'static str },
}

pub struct Codec {
    dictionary: Arc<ProtocolDictionary>,
}

impl Codec {
    pub fn new(dictionary: Arc<ProtocolDictionary>) -> Self {
        Codec { dictionary }
    }

    pub fn dictionary(&self) -> &ProtocolDictionary {
        &self.dictionary
    }

    /// Attempt to decode one frame from the front of `buf`. Returns the
    /// decoded message and the number of bytes it consumed, or `None` if
    /// `buf` doesn't yet hold a complete frame.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
        let Some(soh1) = find_soh(buf, 0) else {
            return Ok(None);
        };
        let Some(soh2) = find_soh(buf, soh1 + 1) else {
            return Ok(None);
        };
        let field0 = &buf[0..soh1];
        let field1 = &buf[soh1 + 1..soh2];
        let (tag0, _) = split_tag_value(field0)?;
        let (tag1, val1) = split_tag_value(field1)?;

        if Tag(tag0) != tags::BEGIN_STRING {
            tracing::warn!(tag = tag0, "first field is not BeginString");
        }
        if Tag(tag1) != tags::BODY_LENGTH {
            tracing::warn!(tag = tag1, "second field is not BodyLength");
        }

        let body_len: usize = val1
            .parse()
            .map_err(|_| CodecError::Malformed(format!("non-numeric BodyLength {val1:?}")))?;
        if body_len > MAX_BODY_LENGTH {
            return Err(CodecError::Malformed(format!("BodyLength {body_len} exceeds the {MAX_BODY_LENGTH}-byte frame cap")));
        }

        // trailer is exactly "10=NNN\x01"; body_len is already bounded by
        // MAX_BODY_LENGTH above, so this can't overflow usize.
        let total_len = field0.len() + 1 + field1.len() + 1 + body_len + "10=000".len() + 1;
        if buf.len() < total_len {
            return Ok(None);
        }
        let frame = &buf[..total_len];

        let mut root = Message::anonymous();
        let mut stack: Vec<OpenGroup> = Vec::new();
        let mut pos = 0usize;

        while pos < frame.len() {
            let Some(next_soh) = frame[pos..].iter().position(|&b| b == SOH).map(|i| i + pos)
            else {
                break;
            };
            let field = &frame[pos..next_soh];
            pos = next_soh + 1;
            if field.is_empty() {
                continue;
            }
            let (tag_num, value) = split_tag_value(field)?;
            let tag = Tag(tag_num);

            if tag == tags::CHECK_SUM {
                let expected = checksum_of(&frame[..next_soh - field.len()]);
                let actual: u32 = value.parse().unwrap_or(u32::MAX);
                if expected != actual {
                    tracing::warn!(expected, actual, "FIX checksum mismatch");
                }
            } else if tag == tags::MSG_TYPE {
                root.set_msg_type(value.to_string());
            }

            insert_field(&mut root, &mut stack, &self.dictionary, tag, value);
        }

        // defensive: close any groups a well-formed frame would already
        // have closed via the trailing CheckSum field.
        while let Some(open) = stack.pop() {
            let parent = current_mut(&mut root, &mut stack);
            parent.add_repeating_group(open.tag, open.current_rep, None);
        }

        Ok(Some((root, total_len)))
    }

    /// Encode `msg` as a wire frame, stamping `MsgSeqNum` and the
    /// session's comp IDs as `SenderCompID`/`TargetCompID`.
    ///
    /// The sequence number is resolved from `msg` itself rather than
    /// taken as a parameter (§4.2):
    /// - A `SequenceReset` — gap-fill or plain — must already carry
    ///   `MsgSeqNum`; that value is reused as the wire seqno rather than
    ///   allocated. A *plain* reset additionally has its `NewSeqNo` field
    ///   overridden with a freshly allocated outbound number, advancing
    ///   the session's counter without touching the frame's own seqno.
    /// - Any other message with `PossDupFlag=Y` reuses its existing
    ///   `MsgSeqNum` (a resend).
    /// - Otherwise a fresh number comes from `session.allocate_snd_seq_no()`.
    pub fn encode(&self, msg: &Message, session: &mut Session) -> Result<Vec<u8>, CodecError> {
        Ok(self.encode_with_seq_no(msg, session)?.0)
    }

    /// Same as `encode`, but also hands back the `MsgSeqNum` this frame
    /// was stamped with, sparing a caller that needs it (e.g. for
    /// journal keying) a full re-decode of the frame it just built.
    pub fn encode_with_seq_no(&self, msg: &Message, session: &mut Session) -> Result<(Vec<u8>, u64), CodecError> {
        let plan = self.resolve_seq_no(msg, session)?;

        let mut body = Vec::new();
        append_field(&mut body, tags::SENDER_COMP_ID, session.sender_comp_id());
        append_field(&mut body, tags::TARGET_COMP_ID, session.target_comp_id());
        append_field(&mut body, tags::MSG_SEQ_NUM, &plan.seq_no.to_string());
        append_field(&mut body, tags::SENDING_TIME, &sending_time_now());
        let has_new_seq_no_field = msg.get_field(tags::NEW_SEQ_NO).is_some();
        for tag in msg.tags() {
            if matches!(
                tag,
                tags::MSG_SEQ_NUM
                    | tags::MSG_TYPE
                    | tags::BEGIN_STRING
                    | tags::BODY_LENGTH
                    | tags::CHECK_SUM
                    | tags::SENDER_COMP_ID
                    | tags::TARGET_COMP_ID
                    | tags::SENDING_TIME
            ) {
                continue;
            }
            if tag == tags::NEW_SEQ_NO {
                if let Some(new_seq_no) = plan.new_seq_no_override {
                    append_field(&mut body, tags::NEW_SEQ_NO, &new_seq_no.to_string());
                    continue;
                }
            }
            append_field_value(&mut body, tag, msg);
        }
        // A plain SequenceReset's NewSeqNo is always an allocated value,
        // even if the caller never set a placeholder for it on `msg`.
        if !has_new_seq_no_field {
            if let Some(new_seq_no) = plan.new_seq_no_override {
                append_field(&mut body, tags::NEW_SEQ_NO, &new_seq_no.to_string());
            }
        }

        let msg_type_field = format!("35={}", msg.msg_type());
        let body_length = body.len() + msg_type_field.len() + 1;

        let mut out = Vec::with_capacity(body.len() + 64);
        out.extend_from_slice(format!("8={BEGIN_STRING}\x01").as_bytes());
        out.extend_from_slice(format!("9={body_length}\x01").as_bytes());
        out.extend_from_slice(msg_type_field.as_bytes());
        out.push(SOH);
        out.extend_from_slice(&body);

        let checksum = checksum_of(&out);
        out.extend_from_slice(format!("10={checksum:03}\x01").as_bytes());
        Ok((out, plan.seq_no))
    }

    fn resolve_seq_no(&self, msg: &Message, session: &mut Session) -> Result<SeqNoPlan, CodecError> {
        if msg.msg_type() == msgtype::SEQUENCE_RESET {
            let seq_no = self.existing_seq_no(msg, "SequenceReset")?;
            let is_gap_fill = msg.get_field(tags::GAP_FILL_FLAG) == Some("Y");
            let new_seq_no_override = if is_gap_fill {
                None
            } else {
                Some(session.allocate_snd_seq_no())
            };
            return Ok(SeqNoPlan { seq_no, new_seq_no_override });
        }
        if msg.get_field(tags::POSS_DUP_FLAG) == Some("Y") {
            let seq_no = self.existing_seq_no(msg, "PossDupFlag=Y")?;
            return Ok(SeqNoPlan { seq_no, new_seq_no_override: None });
        }
        Ok(SeqNoPlan {
            seq_no: session.allocate_snd_seq_no(),
            new_seq_no_override: None,
        })
    }

    fn existing_seq_no(&self, msg: &Message, reason: &'static str) -> Result<u64, CodecError> {
        msg.get_field(tags::MSG_SEQ_NUM)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CodecError::MissingSeqNumForResend {
                msg_type: msg.msg_type().to_string(),
                reason,
            })
    }
}

struct SeqNoPlan {
    seq_no: u64,
    new_seq_no_override: Option<u64>,
}

/// UTC time formatted per FIX's `UTCTimestamp`: `YYYYMMDD-HH:MM:SS.sss`.
fn sending_time_now() -> String {
    chrono::Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

fn checksum_of(bytes: &[u8]) -> u32 {
    bytes.iter().map(|&b| u32::from(b)).sum::<u32>() % 256
}

fn find_soh(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == SOH).map(|i| i + from)
}

fn split_tag_value(field: &[u8]) -> Result<(u32, &str), CodecError> {
    let eq = field
        .iter()
        .position(|&b| b == b'=')
        .ok_or_else(|| CodecError::Malformed("field missing '='".into()))?;
    let tag_str = std::str::from_utf8(&field[..eq])
        .map_err(|_| CodecError::Malformed("non-utf8 tag".into()))?;
    let tag_num: u32 = tag_str
        .parse()
        .map_err(|_| CodecError::Malformed(format!("non-numeric tag {tag_str:?}")))?;
    let value = std::str::from_utf8(&field[eq + 1..])
        .map_err(|_| CodecError::Malformed("non-utf8 value".into()))?;
    Ok((tag_num, value))
}

fn append_field(out: &mut Vec<u8>, tag: Tag, value: &str) {
    out.extend_from_slice(format!("{tag}={value}").as_bytes());
    out.push(SOH);
}

fn append_field_value(out: &mut Vec<u8>, tag: Tag, msg: &Message) {
    if let Some(reps) = msg.get_repeating_group(tag) {
        append_field(out, tag, &reps.len().to_string());
        for rep in reps {
            for child_tag in rep.tags() {
                append_field_value(out, child_tag, rep);
            }
        }
    } else if let Some(value) = msg.get_field(tag) {
        append_field(out, tag, value);
    }
}

struct OpenGroup {
    tag: Tag,
    allowed_children: HashSet<Tag>,
    current_rep: Message,
}

fn current_mut<'a>(root: &'a mut Message, stack: &'a mut [OpenGroup]) -> &'a mut Message {
    match stack.last_mut() {
        Some(g) => &mut g.current_rep,
        None => root,
    }
}

/// The decode-side repeating-group reconstruction: a stack of in-progress
/// repetitions, closing and re-opening siblings as fields repeat.
fn insert_field(
    root: &mut Message,
    stack: &mut Vec<OpenGroup>,
    dict: &ProtocolDictionary,
    tag: Tag,
    value: &str,
) {
    if let Some(children) = dict.group_children(tag) {
        close_until_accepts(root, stack, tag);
        stack.push(OpenGroup {
            tag,
            allowed_children: children.clone(),
            current_rep: Message::anonymous(),
        });
        return;
    }

    close_until_accepts(root, stack, tag);

    if stack.last().is_some() {
        if stack.last().unwrap().current_rep.contains(tag) {
            let top = stack.last_mut().unwrap();
            let finished_tag = top.tag;
            let allowed = top.allowed_children.clone();
            let finished_rep = std::mem::replace(&mut top.current_rep, Message::anonymous());
            stack.pop();
            {
                let parent = current_mut(root, stack);
                parent.add_repeating_group(finished_tag, finished_rep, None);
            }
            stack.push(OpenGroup {
                tag: finished_tag,
                allowed_children: allowed,
                current_rep: Message::anonymous(),
            });
        }
        stack.last_mut().unwrap().current_rep.set_field(tag, value.to_string());
    } else {
        root.set_field(tag, value.to_string());
    }
}

fn close_until_accepts(root: &mut Message, stack: &mut Vec<OpenGroup>, tag: Tag) {
    while let Some(top) = stack.last() {
        if top.allowed_children.contains(&tag) {
            break;
        }
        let finished = stack.pop().unwrap();
        let parent = current_mut(root, stack);
        parent.add_repeating_group(finished.tag, finished.current_rep, None);
    }
}
