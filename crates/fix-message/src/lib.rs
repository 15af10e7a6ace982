//! In-memory representation of a decoded or to-be-encoded FIX message.
//!
//! Fields are kept in insertion order (significant for the wire encoder —
//! see `fix-codec`) with O(1) lookup and removal by tag, via `IndexMap`.
//! A repeating group is just another field whose value is a `Vec` of
//! sub-messages, each one itself an ordered field map.

use fix_protocol::Tag;
use indexmap::IndexMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(String),
    Group(Vec<Message>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    msg_type: String,
    fields: IndexMap<Tag, FieldValue>,
}

impl Message {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Message {
            msg_type: msg_type.into(),
            fields: IndexMap::new(),
        }
    }

    /// An unnamed message used to hold the fields of a single repeating
    /// group repetition while decoding or building one.
    pub fn anonymous() -> Self {
        Message {
            msg_type: String::new(),
            fields: IndexMap::new(),
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn set_msg_type(&mut self, msg_type: impl Into<String>) {
        self.msg_type = msg_type.into();
    }

    pub fn set_field(&mut self, tag: Tag, value: impl Into<String>) {
        self.fields.insert(tag, FieldValue::Scalar(value.into()));
    }

    pub fn get_field(&self, tag: Tag) -> Option<&str> {
        match self.fields.get(&tag) {
            Some(FieldValue::Scalar(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn remove_field(&mut self, tag: Tag) -> Option<FieldValue> {
        self.fields.shift_remove(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.fields.contains_key(&tag)
    }

    pub fn is_repeating_group(&self, tag: Tag) -> bool {
        matches!(self.fields.get(&tag), Some(FieldValue::Group(_)))
    }

    /// Append (or insert at `index`) one repetition to the group keyed by
    /// `tag`, creating the group if this is its first repetition.
    pub fn add_repeating_group(&mut self, tag: Tag, group: Message, index: Option<usize>) {
        match self.fields.entry(tag) {
            indexmap::map::Entry::Occupied(mut e) => {
                if let FieldValue::Group(reps) = e.get_mut() {
                    match index {
                        Some(i) => reps.insert(i.min(reps.len()), group),
                        None => reps.push(group),
                    }
                } else {
                    // existing scalar under this tag makes no sense once a
                    // group appears, but recovering is better than panicking
                    e.insert(FieldValue::Group(vec![group]));
                }
            }
            indexmap::map::Entry::Vacant(e) => {
                e.insert(FieldValue::Group(vec![group]));
            }
        }
    }

    pub fn remove_repeating_group_by_index(&mut self, tag: Tag, index: usize) {
        let mut now_empty = false;
        if let Some(FieldValue::Group(reps)) = self.fields.get_mut(&tag) {
            if index < reps.len() {
                reps.remove(index);
            }
            now_empty = reps.is_empty();
        }
        if now_empty {
            self.fields.shift_remove(&tag);
        }
    }

    pub fn get_repeating_group(&self, tag: Tag) -> Option<&[Message]> {
        match self.fields.get(&tag) {
            Some(FieldValue::Group(reps)) => Some(reps.as_slice()),
            _ => None,
        }
    }

    pub fn get_repeating_group_by_index(&self, tag: Tag, index: usize) -> Option<&Message> {
        self.get_repeating_group(tag).and_then(|reps| reps.get(index))
    }

    /// Find the first repetition whose `identifier_tag` equals
    /// `identifier_value`.
    pub fn get_repeating_group_by_tag(
        &self,
        tag: Tag,
        identifier_tag: Tag,
        identifier_value: &str,
    ) -> Option<&Message> {
        self.get_repeating_group(tag)?
            .iter()
            .find(|rep| rep.get_field(identifier_tag) == Some(identifier_value))
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.fields.keys().copied()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(tag, value)| match value {
                FieldValue::Scalar(s) => format!("{tag}={s}"),
                FieldValue::Group(reps) => {
                    let rendered: Vec<String> = reps.iter().map(Message::to_string).collect();
                    format!("{tag}={}=>[{}]", reps.len(), rendered.join(", "))
                }
            })
            .collect();
        write!(f, "{}", parts.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_scalars_and_nested_groups() {
        let mut msg = Message::new("AB");
        msg.set_field(Tag(45), "dgd");
        msg.set_field(Tag(32), "aaaa");
        msg.set_field(Tag(323), "bbbb");

        let mut rep1 = Message::anonymous();
        rep1.set_field(Tag(611), "aaa");
        rep1.set_field(Tag(612), "bbb");
        rep1.set_field(Tag(613), "ccc");
        msg.add_repeating_group(Tag(444), rep1, None);

        let mut rep2 = Message::anonymous();
        rep2.set_field(Tag(611), "zzz");
        rep2.set_field(Tag(612), "yyy");
        rep2.set_field(Tag(613), "xxx");
        let mut nested = Message::anonymous();
        nested.set_field(Tag(611), "ggg");
        nested.set_field(Tag(612), "hhh");
        nested.set_field(Tag(613), "jjj");
        rep2.add_repeating_group(Tag(445), nested, None);
        msg.add_repeating_group(Tag(444), rep2, None);

        assert_eq!(
            msg.to_string(),
            "45=dgd|32=aaaa|323=bbbb|444=2=>[611=aaa|612=bbb|613=ccc, \
             611=zzz|612=yyy|613=xxx|445=1=>[611=ggg|612=hhh|613=jjj]]"
        );
    }

    #[test]
    fn remove_by_index_drops_the_tag_once_empty() {
        let mut msg = Message::new("AB");
        let mut rep = Message::anonymous();
        rep.set_field(Tag(611), "aaa");
        msg.add_repeating_group(Tag(444), rep, None);

        msg.remove_repeating_group_by_index(Tag(444), 0);
        assert!(!msg.contains(Tag(444)));
    }

    #[test]
    fn get_repeating_group_by_tag_finds_matching_repetition() {
        let mut msg = Message::new("AB");
        let mut rep1 = Message::anonymous();
        rep1.set_field(Tag(611), "aaa");
        let mut rep2 = Message::anonymous();
        rep2.set_field(Tag(611), "zzz");
        msg.add_repeating_group(Tag(444), rep1, None);
        msg.add_repeating_group(Tag(444), rep2, None);

        let found = msg
            .get_repeating_group_by_tag(Tag(444), Tag(611), "zzz")
            .expect("repetition should be found");
        assert_eq!(found.get_field(Tag(611)), Some("zzz"));
    }
}
