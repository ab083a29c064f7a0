//! Projection of platform chats onto IRC channels and nicks.

use std::sync::{LazyLock, Mutex};

use deunicode::deunicode;
use regex::Regex;

use crate::irc::{self, Message};
use crate::platform::{ChatId, RawChat, RawParticipant};

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[^a-z\d+]").expect("static regex"));

/// Transliterate to ASCII and drop everything IRC would choke on.
pub fn safe_name(name: &str) -> String {
    UNSAFE_CHARS.replace_all(&deunicode(name), "").into_owned()
}

/// Nick for a contact: its sanitized display name, falling back to the
/// user part of its id.
pub fn contact_nick(name: Option<&str>, id: &ChatId) -> String {
    let from_name = name.map(safe_name).unwrap_or_default();
    if !from_name.is_empty() {
        return from_name;
    }
    let from_id = safe_name(id.user());
    if from_id.is_empty() { id.user().to_string() } else { from_id }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ChatId,
    pub name: Option<String>,
    pub is_admin: bool,
    pub is_self: bool,
}

impl Participant {
    fn project(raw: RawParticipant, me: Option<&ChatId>) -> Self {
        let is_self = raw.is_me || me.is_some_and(|me| *me == raw.id);
        Self {
            id: raw.id,
            name: raw.name,
            is_admin: raw.is_admin,
            is_self,
        }
    }

    pub fn nick(&self) -> String {
        contact_nick(self.name.as_deref(), &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub is_group: bool,
    pub participants: Vec<Participant>,
    /// Set once the JOIN sequence has been sent; never cleared.
    pub joined: bool,
    /// Newest activity timestamp last reported by the platform.
    pub timestamp: i64,
    pub description: Option<String>,
}

impl Chat {
    pub fn project(raw: RawChat, members: Vec<RawParticipant>, me: Option<&ChatId>) -> Self {
        Self {
            participants: members
                .into_iter()
                .map(|p| Participant::project(p, me))
                .collect(),
            id: raw.id,
            name: raw.title,
            is_group: raw.is_group,
            joined: false,
            timestamp: raw.timestamp,
            description: raw.description,
        }
    }

    /// `#name` for group chats, a nick for direct chats.
    pub fn identifier(&self) -> String {
        let nick = contact_nick(Some(&self.name), &self.id);
        if self.is_group { format!("#{nick}") } else { nick }
    }

    pub fn participant(&self, id: &ChatId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == *id)
    }

    /// Lines announcing this chat to the client as a joined channel.
    pub fn join_lines(&self, server: &str, nick: &str) -> Vec<Message> {
        let channel = self.identifier();
        let mut lines = vec![Message::with_prefix(nick, "JOIN", vec![channel.as_str()])];

        let mut topic = self.name.clone();
        if let Some(desc) = self.description.as_deref().map(str::trim)
            && !desc.is_empty()
        {
            topic = format!("{topic}: {}", desc.replace(['\r', '\n'], " "));
        }
        lines.push(Message::numeric(server, irc::RPL_TOPIC, nick, vec![channel.as_str(), topic.as_str()]));

        let mut names = Vec::new();
        for participant in &self.participants {
            if participant.is_self {
                if participant.is_admin {
                    lines.push(Message::with_prefix(server, "MODE", vec![channel.as_str(), "+o", nick]));
                }
                continue;
            }
            let prefix = if participant.is_admin { "@" } else { "" };
            names.push(format!("{prefix}{}", participant.nick()));
        }

        let names = names.join(" ");
        lines.push(Message::numeric(
            server,
            irc::RPL_NAMREPLY,
            nick,
            vec!["@", channel.as_str(), names.as_str()],
        ));
        lines.push(Message::numeric(
            server,
            irc::RPL_ENDOFNAMES,
            nick,
            vec![channel.as_str(), "End of /NAMES list."],
        ));
        lines
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("no such chat: {0}")]
    NoSuchChat(String),
    #[error("{0} is not a group chat")]
    NotGroup(String),
}

/// The ordered chat list of one connection, unique by id.
#[derive(Debug, Default)]
pub struct ChatList {
    chats: Mutex<Vec<Chat>>,
}

impl ChatList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `chat`, or replace the entry with the same id in place.
    /// An existing `joined` flag survives the replacement.
    pub fn upsert(&self, mut chat: Chat) {
        let mut chats = self.chats.lock().unwrap();
        match chats.iter_mut().find(|c| c.id == chat.id) {
            Some(existing) => {
                chat.joined |= existing.joined;
                *existing = chat;
            }
            None => chats.push(chat),
        }
    }

    pub fn get(&self, id: &ChatId) -> Option<Chat> {
        self.chats.lock().unwrap().iter().find(|c| c.id == *id).cloned()
    }

    /// Case-insensitive lookup by channel name or direct-chat nick.
    pub fn by_identifier(&self, identifier: &str) -> Option<Chat> {
        self.chats
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.identifier().eq_ignore_ascii_case(identifier))
            .cloned()
    }

    pub fn all(&self) -> Vec<Chat> {
        self.chats.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.chats.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.lock().unwrap().is_empty()
    }

    /// Record newer activity reported for a chat.
    pub fn touch(&self, id: &ChatId, timestamp: i64) {
        let mut chats = self.chats.lock().unwrap();
        if let Some(chat) = chats.iter_mut().find(|c| c.id == *id) {
            chat.timestamp = chat.timestamp.max(timestamp);
        }
    }

    /// Mark a group chat joined and return its JOIN sequence, or `None`
    /// if it was already joined.
    pub fn join(&self, id: &ChatId, server: &str, nick: &str) -> Result<Option<Vec<Message>>, JoinError> {
        let mut chats = self.chats.lock().unwrap();
        let chat = chats
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or_else(|| JoinError::NoSuchChat(id.to_string()))?;
        if !chat.is_group {
            return Err(JoinError::NotGroup(chat.identifier()));
        }
        if chat.joined {
            return Ok(None);
        }
        chat.joined = true;
        Ok(Some(chat.join_lines(server, nick)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, title: &str, ts: i64) -> RawChat {
        RawChat {
            id: ChatId::new(id),
            title: title.to_string(),
            is_group: true,
            timestamp: ts,
            description: None,
        }
    }

    fn member(id: &str, name: &str, admin: bool) -> RawParticipant {
        RawParticipant {
            id: ChatId::new(id),
            name: Some(name.to_string()),
            is_admin: admin,
            is_me: false,
        }
    }

    #[test]
    fn safe_name_transliterates_and_strips() {
        assert_eq!(safe_name("Família Ünïcode!"), "FamiliaUnicode");
        assert_eq!(safe_name("C++ devs"), "C++devs");
        assert_eq!(safe_name("#chan:name"), "channame");
    }

    #[test]
    fn contact_nick_falls_back_to_number() {
        let id = ChatId::new("31612345678@c.us");
        assert_eq!(contact_nick(Some("   "), &id), "31612345678");
        assert_eq!(contact_nick(None, &id), "31612345678");
        assert_eq!(contact_nick(Some("Bob Smith"), &id), "BobSmith");
    }

    #[test]
    fn identifiers() {
        let chat = Chat::project(group("g1@g.us", "Book Club", 1), vec![], None);
        assert_eq!(chat.identifier(), "#BookClub");

        let mut direct = group("316@c.us", "Ann-Marie", 1);
        direct.is_group = false;
        assert_eq!(Chat::project(direct, vec![], None).identifier(), "AnnMarie");
    }

    #[test]
    fn join_sequence_with_admin_self_and_description() {
        let me = ChatId::new("me@c.us");
        let mut raw = group("g1@g.us", "Family", 10);
        raw.description = Some("line one\nline two\n".to_string());
        let members = vec![
            RawParticipant { id: me.clone(), name: Some("Me".into()), is_admin: true, is_me: false },
            member("a@c.us", "Alice", true),
            member("b@c.us", "Bob", false),
        ];
        let chat = Chat::project(raw, members, Some(&me));
        let lines: Vec<String> = chat.join_lines("whapp-irc", "me").iter().map(|m| m.to_string()).collect();

        assert_eq!(
            lines,
            vec![
                ":me JOIN #Family",
                ":whapp-irc 332 me #Family :Family: line one line two",
                ":whapp-irc MODE #Family +o me",
                ":whapp-irc 353 me @ #Family :@Alice Bob",
                ":whapp-irc 366 me #Family :End of /NAMES list.",
            ]
        );
    }

    #[test]
    fn self_without_admin_is_only_excluded() {
        let mut me = member("me@c.us", "Me", false);
        me.is_me = true;
        let chat = Chat::project(group("g@g.us", "Quiet", 1), vec![me], None);
        let lines = chat.join_lines("s", "me");
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.command != "MODE"));
        assert_eq!(lines[2].param(3), Some(""));
    }

    #[test]
    fn join_twice_emits_once() {
        let list = ChatList::new();
        list.upsert(Chat::project(group("g@g.us", "Team", 1), vec![], None));
        let id = ChatId::new("g@g.us");
        assert!(list.join(&id, "s", "me").unwrap().is_some());
        assert_eq!(list.join(&id, "s", "me").unwrap(), None);
    }

    #[test]
    fn join_rejects_unknown_and_direct() {
        let list = ChatList::new();
        let mut direct = group("d@c.us", "Dan", 1);
        direct.is_group = false;
        list.upsert(Chat::project(direct, vec![], None));

        assert_eq!(
            list.join(&ChatId::new("nope"), "s", "me"),
            Err(JoinError::NoSuchChat("nope".into()))
        );
        assert_eq!(
            list.join(&ChatId::new("d@c.us"), "s", "me"),
            Err(JoinError::NotGroup("Dan".into()))
        );
    }

    #[test]
    fn upsert_updates_in_place_and_keeps_joined() {
        let list = ChatList::new();
        list.upsert(Chat::project(group("g1@g.us", "One", 1), vec![], None));
        list.upsert(Chat::project(group("g2@g.us", "Two", 1), vec![], None));
        list.join(&ChatId::new("g1@g.us"), "s", "me").unwrap();

        list.upsert(Chat::project(group("g1@g.us", "One renamed", 5), vec![], None));
        let all = list.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "One renamed");
        assert!(all[0].joined);
        assert_eq!(all[0].timestamp, 5);
    }

    #[test]
    fn lookup_by_identifier_is_case_insensitive() {
        let list = ChatList::new();
        list.upsert(Chat::project(group("g@g.us", "Book Club", 1), vec![], None));
        assert!(list.by_identifier("#bookclub").is_some());
        assert!(list.by_identifier("#other").is_none());
    }
}
