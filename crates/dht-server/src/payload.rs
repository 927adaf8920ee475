//! Wire payload validation.
//!
//! Bodies are parsed to `serde_json::Value` and walked by hand so every
//! rejection names the dotted path of the offending field. Snowflakes
//! arrive as decimal strings and must parse to `u64`.

use serde_json::{Map, Value};

use dht_core::{
    normalize_download_url, Attachment, Channel, Embed, Message, Poll, PollAnswer, Reaction,
    ReactionEmoji, Server, ServerType, Snowflake, User,
};

use crate::error::ApiError;

type Result<T> = std::result::Result<T, ApiError>;

fn invalid(path: impl Into<String>, reason: impl Into<String>) -> ApiError {
    ApiError::Validation(path.into(), reason.into())
}

fn object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| invalid(path, "expected an object"))
}

fn array<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| invalid(path, "expected an array"))
}

fn required<'a>(obj: &'a Map<String, Value>, key: &str, path: &str) -> Result<&'a Value> {
    obj.get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| invalid(format!("{path}.{key}"), "missing required field"))
}

fn optional<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn string<'a>(value: &'a Value, path: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| invalid(path, "expected a string"))
}

fn snowflake(value: &Value, path: &str) -> Result<Snowflake> {
    let text = string(value, path)?;
    text.parse()
        .map_err(|_| invalid(path, "expected a decimal snowflake string"))
}

fn integer(value: &Value, path: &str) -> Result<i64> {
    value.as_i64().ok_or_else(|| invalid(path, "expected an integer"))
}

fn unsigned(value: &Value, path: &str) -> Result<u64> {
    value.as_u64().ok_or_else(|| invalid(path, "expected a non-negative integer"))
}

fn boolean(value: &Value, path: &str) -> Result<bool> {
    value.as_bool().ok_or_else(|| invalid(path, "expected a boolean"))
}

fn dimension(value: &Value, path: &str) -> Result<i32> {
    let raw = integer(value, path)?;
    i32::try_from(raw).map_err(|_| invalid(path, "dimension out of range"))
}

/// `/track-channel` body: `{server: {...}, channel: {...}}`.
pub fn parse_track_channel(value: &Value) -> Result<(Server, Channel)> {
    let root = object(value, "body")?;

    let server_value = required(root, "server", "body")?;
    let server_obj = object(server_value, "server")?;
    let server = Server {
        id: snowflake(required(server_obj, "id", "server")?, "server.id")?,
        name: string(required(server_obj, "name", "server")?, "server.name")?.to_owned(),
        server_type: {
            let tag = string(required(server_obj, "type", "server")?, "server.type")?;
            ServerType::parse(tag)
                .ok_or_else(|| invalid("server.type", "expected server, group or dm"))?
        },
    };

    let channel_value = required(root, "channel", "body")?;
    let channel_obj = object(channel_value, "channel")?;
    let channel = Channel {
        id: snowflake(required(channel_obj, "id", "channel")?, "channel.id")?,
        server_id: server.id,
        name: string(required(channel_obj, "name", "channel")?, "channel.name")?.to_owned(),
        parent_id: optional(channel_obj, "parent")
            .map(|v| snowflake(v, "channel.parent"))
            .transpose()?,
        position: optional(channel_obj, "position")
            .map(|v| dimension(v, "channel.position"))
            .transpose()?,
        topic: optional(channel_obj, "topic")
            .map(|v| string(v, "channel.topic").map(str::to_owned))
            .transpose()?,
        nsfw: optional(channel_obj, "nsfw")
            .map(|v| boolean(v, "channel.nsfw"))
            .transpose()?,
    };

    Ok((server, channel))
}

/// `/track-users` body: array of user objects.
pub fn parse_track_users(value: &Value) -> Result<Vec<User>> {
    array(value, "users")?
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let path = format!("users[{i}]");
            let obj = object(entry, &path)?;
            Ok(User {
                id: snowflake(required(obj, "id", &path)?, &format!("{path}.id"))?,
                name: string(required(obj, "name", &path)?, &format!("{path}.name"))?.to_owned(),
                avatar_url: optional(obj, "avatar")
                    .map(|v| string(v, &format!("{path}.avatar")).map(str::to_owned))
                    .transpose()?,
                discriminator: optional(obj, "discriminator")
                    .map(|v| string(v, &format!("{path}.discriminator")).map(str::to_owned))
                    .transpose()?,
            })
        })
        .collect()
}

/// `/track-messages` body: array of message objects.
pub fn parse_track_messages(value: &Value) -> Result<Vec<Message>> {
    array(value, "messages")?
        .iter()
        .enumerate()
        .map(|(i, entry)| parse_message(entry, &format!("messages[{i}]")))
        .collect()
}

fn parse_message(value: &Value, path: &str) -> Result<Message> {
    let obj = object(value, path)?;

    let attachments = optional(obj, "attachments")
        .map(|v| parse_attachments(v, &format!("{path}.attachments")))
        .transpose()?
        .unwrap_or_default();

    let embeds = optional(obj, "embeds")
        .map(|v| parse_embeds(v, &format!("{path}.embeds")))
        .transpose()?
        .unwrap_or_default();

    let reactions = optional(obj, "reactions")
        .map(|v| parse_reactions(v, &format!("{path}.reactions")))
        .transpose()?
        .unwrap_or_default();

    let poll = optional(obj, "poll")
        .map(|v| parse_poll(v, &format!("{path}.poll")))
        .transpose()?;

    Ok(Message {
        id: snowflake(required(obj, "id", path)?, &format!("{path}.id"))?,
        sender_id: snowflake(required(obj, "sender", path)?, &format!("{path}.sender"))?,
        channel_id: snowflake(required(obj, "channel", path)?, &format!("{path}.channel"))?,
        text: string(required(obj, "text", path)?, &format!("{path}.text"))?.to_owned(),
        timestamp: integer(required(obj, "timestamp", path)?, &format!("{path}.timestamp"))?,
        edit_timestamp: optional(obj, "editTimestamp")
            .map(|v| integer(v, &format!("{path}.editTimestamp")))
            .transpose()?,
        replied_to_id: optional(obj, "repliedToId")
            .map(|v| snowflake(v, &format!("{path}.repliedToId")))
            .transpose()?,
        attachments,
        embeds,
        reactions,
        poll,
    })
}

fn parse_attachments(value: &Value, path: &str) -> Result<Vec<Attachment>> {
    array(value, path)?
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let path = format!("{path}[{i}]");
            let obj = object(entry, &path)?;
            // The wire URL is kept verbatim for fetching; its canonical
            // form keys the download tables.
            let download_url =
                string(required(obj, "url", &path)?, &format!("{path}.url"))?.to_owned();
            Ok(Attachment {
                id: snowflake(required(obj, "id", &path)?, &format!("{path}.id"))?,
                name: string(required(obj, "name", &path)?, &format!("{path}.name"))?.to_owned(),
                content_type: optional(obj, "type")
                    .map(|v| string(v, &format!("{path}.type")).map(str::to_owned))
                    .transpose()?,
                normalized_url: normalize_download_url(&download_url),
                download_url,
                size: unsigned(required(obj, "size", &path)?, &format!("{path}.size"))?,
                width: optional(obj, "width")
                    .map(|v| dimension(v, &format!("{path}.width")))
                    .transpose()?,
                height: optional(obj, "height")
                    .map(|v| dimension(v, &format!("{path}.height")))
                    .transpose()?,
            })
        })
        .collect()
}

fn parse_embeds(value: &Value, path: &str) -> Result<Vec<Embed>> {
    array(value, path)?
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let json = string(entry, &format!("{path}[{i}]"))?;
            Ok(Embed {
                json: json.to_owned(),
            })
        })
        .collect()
}

fn emoji_flags(obj: &Map<String, Value>, path: &str) -> Result<u32> {
    let animated = optional(obj, "isAnimated")
        .map(|v| boolean(v, &format!("{path}.isAnimated")))
        .transpose()?
        .unwrap_or(false);
    Ok(if animated { ReactionEmoji::FLAG_ANIMATED } else { 0 })
}

fn parse_reactions(value: &Value, path: &str) -> Result<Vec<Reaction>> {
    array(value, path)?
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let path = format!("{path}[{i}]");
            let obj = object(entry, &path)?;

            let id = optional(obj, "id")
                .map(|v| snowflake(v, &format!("{path}.id")))
                .transpose()?;
            let name = optional(obj, "name")
                .map(|v| string(v, &format!("{path}.name")).map(str::to_owned))
                .transpose()?;
            if id.is_none() && name.is_none() {
                return Err(invalid(&path, "reaction needs an emoji id or name"));
            }

            Ok(Reaction {
                emoji: ReactionEmoji {
                    id,
                    name,
                    flags: emoji_flags(obj, &path)?,
                },
                count: unsigned(required(obj, "count", &path)?, &format!("{path}.count"))?,
            })
        })
        .collect()
}

fn parse_poll(value: &Value, path: &str) -> Result<Poll> {
    let obj = object(value, path)?;

    let answers_path = format!("{path}.answers");
    let answers = array(required(obj, "answers", path)?, &answers_path)?
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let path = format!("{answers_path}[{i}]");
            let obj = object(entry, &path)?;

            let emoji = optional(obj, "emoji")
                .map(|v| {
                    let emoji_path = format!("{path}.emoji");
                    let emoji_obj = object(v, &emoji_path)?;
                    let id = optional(emoji_obj, "id")
                        .map(|v| snowflake(v, &format!("{emoji_path}.id")))
                        .transpose()?;
                    let name = optional(emoji_obj, "name")
                        .map(|v| string(v, &format!("{emoji_path}.name")).map(str::to_owned))
                        .transpose()?;
                    if id.is_none() && name.is_none() {
                        return Err(invalid(&emoji_path, "emoji needs an id or name"));
                    }
                    Ok(ReactionEmoji {
                        id,
                        name,
                        flags: emoji_flags(emoji_obj, &emoji_path)?,
                    })
                })
                .transpose()?;

            Ok(PollAnswer {
                answer_id: snowflake(required(obj, "id", &path)?, &format!("{path}.id"))?,
                text: string(required(obj, "text", &path)?, &format!("{path}.text"))?.to_owned(),
                emoji,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Poll {
        question: string(required(obj, "question", path)?, &format!("{path}.question"))?
            .to_owned(),
        multi_select: boolean(
            required(obj, "multiSelect", path)?,
            &format!("{path}.multiSelect"),
        )?,
        expiry_timestamp: integer(
            required(obj, "expiryTimestamp", path)?,
            &format!("{path}.expiryTimestamp"),
        )?,
        answers,
    })
}
