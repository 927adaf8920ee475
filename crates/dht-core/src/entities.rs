//! Archived entity types.
//!
//! These are the rows the capture script pushes into the archive: users,
//! servers, channels and messages with their dependent records. All ids are
//! snowflakes; timestamps are signed milliseconds since the epoch.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// 64-bit unsigned id used for every chat entity.
///
/// The wire format is a decimal string; SQLite stores the same bits as a
/// signed integer. Both conversions are lossless round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Reinterpret as the signed integer SQLite stores.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_db(self) -> i64 {
        self.0 as i64
    }

    /// Reinterpret a stored signed integer back into a snowflake.
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_db(raw: i64) -> Self {
        Self(raw as u64)
    }
}

impl FromStr for Snowflake {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A tracked user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Snowflake,
    pub name: String,
    pub avatar_url: Option<String>,
    pub discriminator: Option<String>,
}

/// Kind of place a channel lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Server,
    Group,
    DirectMessage,
}

impl ServerType {
    /// Stable tag stored in the database and accepted on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Group => "group",
            Self::DirectMessage => "dm",
        }
    }

    /// Parse a wire/database tag, case-insensitively.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "server" => Some(Self::Server),
            "group" => Some(Self::Group),
            "dm" => Some(Self::DirectMessage),
            _ => None,
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked server (guild, group chat or DM pseudo-server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: Snowflake,
    pub name: String,
    pub server_type: ServerType,
}

/// A tracked channel within a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: Snowflake,
    pub server_id: Snowflake,
    pub name: String,
    pub parent_id: Option<Snowflake>,
    pub position: Option<i32>,
    pub topic: Option<String>,
    pub nsfw: Option<bool>,
}

/// A media attachment referenced by a message.
///
/// `download_url` is kept verbatim from the wire; `normalized_url` is the
/// deterministic canonical form used as the download primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: Snowflake,
    pub name: String,
    pub content_type: Option<String>,
    pub normalized_url: String,
    pub download_url: String,
    pub size: u64,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

/// An embed, stored as the opaque JSON string the capture script sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    pub json: String,
}

/// Emoji half of a reaction; at least one of id or name is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionEmoji {
    pub id: Option<Snowflake>,
    pub name: Option<String>,
    /// Bitset; bit 0 = animated.
    pub flags: u32,
}

impl ReactionEmoji {
    pub const FLAG_ANIMATED: u32 = 1;
}

/// A reaction tally on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: ReactionEmoji,
    pub count: u64,
}

/// One answer of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollAnswer {
    pub answer_id: Snowflake,
    pub text: String,
    pub emoji: Option<ReactionEmoji>,
}

/// A poll attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    pub question: String,
    pub multi_select: bool,
    pub expiry_timestamp: i64,
    pub answers: Vec<PollAnswer>,
}

/// A tracked message and every dependent record it carries.
///
/// Re-adding a message with the same id replaces the message row and all of
/// its dependent rows atomically (last write wins).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Snowflake,
    pub sender_id: Snowflake,
    pub channel_id: Snowflake,
    pub text: String,
    pub timestamp: i64,
    pub edit_timestamp: Option<i64>,
    pub replied_to_id: Option<Snowflake>,
    pub attachments: Vec<Attachment>,
    pub embeds: Vec<Embed>,
    pub reactions: Vec<Reaction>,
    pub poll: Option<Poll>,
}

/// Deduplicate attachments by id, first occurrence wins, order preserved.
///
/// The capture script occasionally reports the same attachment id twice in
/// one message; the archive keeps a single row per id.
pub fn dedupe_attachments(attachments: Vec<Attachment>) -> Vec<Attachment> {
    let mut seen = std::collections::HashSet::with_capacity(attachments.len());
    attachments
        .into_iter()
        .filter(|a| seen.insert(a.id))
        .collect()
}
