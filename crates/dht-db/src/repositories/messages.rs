//! Repository for tracked messages and their dependent rows.
//!
//! A message carries attachments, embeds, reactions, an edit timestamp, a
//! reply reference and a poll. All of them live in side tables keyed by
//! `message_id` and are replaced wholesale whenever the message is
//! re-added, which makes ingest idempotent even for the tables without a
//! natural primary key (embeds, reactions).

use futures_util::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dht_core::entities::dedupe_attachments;
use dht_core::{
    Attachment, CountObservable, CountPublisher, Embed, Message, Poll, PollAnswer, Reaction,
    ReactionEmoji, Snowflake, StorageError,
};

use super::storage_err;
use crate::upsert::TableColumns;

const MESSAGES: TableColumns = TableColumns {
    table: "messages",
    key_columns: &["message_id"],
    data_columns: &["sender_id", "channel_id", "text", "timestamp"],
};

/// Side tables cleared before re-inserting a message's dependent rows.
const DEPENDENT_TABLES: [&str; 7] = [
    "attachments",
    "embeds",
    "reactions",
    "edit_timestamps",
    "replied_to",
    "polls",
    "poll_answers",
];

pub struct MessagesRepository {
    pool: SqlitePool,
    total_count: CountPublisher,
    attachment_count: CountPublisher,
}

impl MessagesRepository {
    pub(crate) async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        let repo = Self {
            pool,
            total_count: CountPublisher::default(),
            attachment_count: CountPublisher::default(),
        };
        repo.update_total_count().await?;
        Ok(repo)
    }

    /// Upsert a batch and all derived rows in one transaction.
    ///
    /// Re-adding an existing id replaces the message row and every
    /// dependent row atomically (last write wins). Duplicate attachment
    /// ids within one message keep the first occurrence.
    pub async fn add(&self, messages: &[Message]) -> Result<(), StorageError> {
        let upsert = MESSAGES.upsert_sql();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for message in messages {
            let id = message.id.to_db();

            sqlx::query(&upsert)
                .bind(id)
                .bind(message.sender_id.to_db())
                .bind(message.channel_id.to_db())
                .bind(&message.text)
                .bind(message.timestamp)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;

            for table in DEPENDENT_TABLES {
                sqlx::query(&format!("DELETE FROM {table} WHERE message_id = ?"))
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }

            if let Some(edit_timestamp) = message.edit_timestamp {
                sqlx::query(
                    "INSERT INTO edit_timestamps (message_id, edit_timestamp) VALUES (?, ?)",
                )
                .bind(id)
                .bind(edit_timestamp)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            }

            if let Some(replied_to_id) = message.replied_to_id {
                sqlx::query("INSERT INTO replied_to (message_id, replied_to_id) VALUES (?, ?)")
                    .bind(id)
                    .bind(replied_to_id.to_db())
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }

            for attachment in dedupe_attachments(message.attachments.clone()) {
                sqlx::query(
                    "INSERT INTO attachments
                     (message_id, attachment_id, name, type, normalized_url, download_url, size, width, height)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT (attachment_id) DO UPDATE SET
                         message_id = excluded.message_id,
                         name = excluded.name,
                         type = excluded.type,
                         normalized_url = excluded.normalized_url,
                         download_url = excluded.download_url,
                         size = excluded.size,
                         width = excluded.width,
                         height = excluded.height",
                )
                .bind(id)
                .bind(attachment.id.to_db())
                .bind(&attachment.name)
                .bind(&attachment.content_type)
                .bind(&attachment.normalized_url)
                .bind(&attachment.download_url)
                .bind(to_i64(attachment.size))
                .bind(attachment.width)
                .bind(attachment.height)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            }

            for embed in &message.embeds {
                sqlx::query("INSERT INTO embeds (message_id, json) VALUES (?, ?)")
                    .bind(id)
                    .bind(&embed.json)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }

            for reaction in &message.reactions {
                sqlx::query(
                    "INSERT INTO reactions (message_id, emoji_id, emoji_name, emoji_flags, count)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(reaction.emoji.id.map(Snowflake::to_db))
                .bind(&reaction.emoji.name)
                .bind(i64::from(reaction.emoji.flags))
                .bind(to_i64(reaction.count))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            }

            if let Some(poll) = &message.poll {
                sqlx::query(
                    "INSERT INTO polls (message_id, question, multi_select, expiry_timestamp)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(id)
                .bind(&poll.question)
                .bind(poll.multi_select)
                .bind(poll.expiry_timestamp)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;

                for answer in &poll.answers {
                    sqlx::query(
                        "INSERT INTO poll_answers
                         (message_id, answer_id, text, emoji_id, emoji_name, emoji_flags)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(answer.answer_id.to_db())
                    .bind(&answer.text)
                    .bind(answer.emoji.as_ref().and_then(|e| e.id).map(Snowflake::to_db))
                    .bind(answer.emoji.as_ref().and_then(|e| e.name.clone()))
                    .bind(answer.emoji.as_ref().map(|e| i64::from(e.flags)))
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                }
            }
        }

        tx.commit().await.map_err(storage_err)?;
        self.update_total_count().await
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count)
    }

    pub async fn count_attachments(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM attachments")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count)
    }

    /// How many of `ids` are already archived. Used for new-vs-seen reports.
    pub async fn count_existing(&self, ids: &[Snowflake]) -> Result<i64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT COUNT(*) FROM messages WHERE message_id IN ({placeholders})");
        let mut query = sqlx::query_as(&sql);
        for id in ids {
            query = query.bind(id.to_db());
        }
        let (count,): (i64,) = query.fetch_one(&self.pool).await.map_err(storage_err)?;
        Ok(count)
    }

    /// Fetch one message with every dependent record hydrated.
    pub async fn get_one(&self, id: Snowflake) -> Result<Option<Message>, StorageError> {
        let raw = id.to_db();

        let core: Option<SqliteRow> = sqlx::query(
            "SELECT m.message_id, m.sender_id, m.channel_id, m.text, m.timestamp,
                    e.edit_timestamp, r.replied_to_id
             FROM messages m
             LEFT JOIN edit_timestamps e ON e.message_id = m.message_id
             LEFT JOIN replied_to r ON r.message_id = m.message_id
             WHERE m.message_id = ?",
        )
        .bind(raw)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(core) = core else {
            return Ok(None);
        };

        let attachments = sqlx::query(
            "SELECT attachment_id, name, type, normalized_url, download_url, size, width, height
             FROM attachments WHERE message_id = ? ORDER BY rowid",
        )
        .bind(raw)
        .fetch(&self.pool)
        .map_err(storage_err)
        .and_then(|row| async move { attachment_from_row(&row) })
        .try_collect::<Vec<_>>()
        .await?;

        let embeds: Vec<(String,)> =
            sqlx::query_as("SELECT json FROM embeds WHERE message_id = ? ORDER BY rowid")
                .bind(raw)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;

        let reactions = sqlx::query(
            "SELECT emoji_id, emoji_name, emoji_flags, count
             FROM reactions WHERE message_id = ? ORDER BY rowid",
        )
        .bind(raw)
        .fetch(&self.pool)
        .map_err(storage_err)
        .and_then(|row| async move { reaction_from_row(&row) })
        .try_collect::<Vec<_>>()
        .await?;

        let poll = self.get_poll(raw).await?;

        Ok(Some(Message {
            id,
            sender_id: Snowflake::from_db(core.try_get("sender_id").map_err(storage_err)?),
            channel_id: Snowflake::from_db(core.try_get("channel_id").map_err(storage_err)?),
            text: core.try_get("text").map_err(storage_err)?,
            timestamp: core.try_get("timestamp").map_err(storage_err)?,
            edit_timestamp: core.try_get("edit_timestamp").map_err(storage_err)?,
            replied_to_id: core
                .try_get::<Option<i64>, _>("replied_to_id")
                .map_err(storage_err)?
                .map(Snowflake::from_db),
            attachments,
            embeds: embeds.into_iter().map(|(json,)| Embed { json }).collect(),
            reactions,
            poll,
        }))
    }

    /// Fetch several messages; missing ids are skipped.
    pub async fn get(&self, ids: &[Snowflake]) -> Result<Vec<Message>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = self.get_one(*id).await? {
                out.push(message);
            }
        }
        Ok(out)
    }

    async fn get_poll(&self, message_id: i64) -> Result<Option<Poll>, StorageError> {
        let row: Option<SqliteRow> = sqlx::query(
            "SELECT question, multi_select, expiry_timestamp FROM polls WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let answers = sqlx::query(
            "SELECT answer_id, text, emoji_id, emoji_name, emoji_flags
             FROM poll_answers WHERE message_id = ? ORDER BY answer_id",
        )
        .bind(message_id)
        .fetch(&self.pool)
        .map_err(storage_err)
        .and_then(|row| async move { poll_answer_from_row(&row) })
        .try_collect::<Vec<_>>()
        .await?;

        Ok(Some(Poll {
            question: row.try_get("question").map_err(storage_err)?,
            multi_select: row.try_get("multi_select").map_err(storage_err)?,
            expiry_timestamp: row.try_get("expiry_timestamp").map_err(storage_err)?,
            answers,
        }))
    }

    pub fn total_count(&self) -> CountObservable {
        self.total_count.subscribe()
    }

    pub fn attachment_total_count(&self) -> CountObservable {
        self.attachment_count.subscribe()
    }

    async fn update_total_count(&self) -> Result<(), StorageError> {
        self.total_count.set(self.count().await?);
        self.attachment_count.set(self.count_attachments().await?);
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn to_i64(value: u64) -> i64 {
    value as i64
}

#[allow(clippy::cast_sign_loss)]
fn attachment_from_row(row: &SqliteRow) -> Result<Attachment, StorageError> {
    Ok(Attachment {
        id: Snowflake::from_db(row.try_get("attachment_id").map_err(storage_err)?),
        name: row.try_get("name").map_err(storage_err)?,
        content_type: row.try_get("type").map_err(storage_err)?,
        normalized_url: row.try_get("normalized_url").map_err(storage_err)?,
        download_url: row.try_get("download_url").map_err(storage_err)?,
        size: row.try_get::<i64, _>("size").map_err(storage_err)? as u64,
        width: row.try_get("width").map_err(storage_err)?,
        height: row.try_get("height").map_err(storage_err)?,
    })
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn reaction_from_row(row: &SqliteRow) -> Result<Reaction, StorageError> {
    Ok(Reaction {
        emoji: ReactionEmoji {
            id: row
                .try_get::<Option<i64>, _>("emoji_id")
                .map_err(storage_err)?
                .map(Snowflake::from_db),
            name: row.try_get("emoji_name").map_err(storage_err)?,
            flags: row.try_get::<i64, _>("emoji_flags").map_err(storage_err)? as u32,
        },
        count: row.try_get::<i64, _>("count").map_err(storage_err)? as u64,
    })
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn poll_answer_from_row(row: &SqliteRow) -> Result<PollAnswer, StorageError> {
    let emoji_id: Option<i64> = row.try_get("emoji_id").map_err(storage_err)?;
    let emoji_name: Option<String> = row.try_get("emoji_name").map_err(storage_err)?;
    let emoji_flags: Option<i64> = row.try_get("emoji_flags").map_err(storage_err)?;

    let emoji = if emoji_id.is_some() || emoji_name.is_some() {
        Some(ReactionEmoji {
            id: emoji_id.map(Snowflake::from_db),
            name: emoji_name,
            flags: emoji_flags.unwrap_or(0) as u32,
        })
    } else {
        None
    };

    Ok(PollAnswer {
        answer_id: Snowflake::from_db(row.try_get("answer_id").map_err(storage_err)?),
        text: row.try_get("text").map_err(storage_err)?,
        emoji,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support::test_pool;

    fn attachment(id: u64) -> Attachment {
        Attachment {
            id: Snowflake(id),
            name: format!("file{id}.png"),
            content_type: Some("image/png".to_owned()),
            normalized_url: format!("https://cdn.example.com/{id}.png"),
            download_url: format!("https://cdn.example.com/{id}.png?ex=66"),
            size: 256,
            width: Some(32),
            height: Some(32),
        }
    }

    fn message(id: u64) -> Message {
        Message {
            id: Snowflake(id),
            sender_id: Snowflake(1),
            channel_id: Snowflake(2),
            text: "hello".to_owned(),
            timestamp: 1_700_000_000_000,
            edit_timestamp: Some(1_700_000_100_000),
            replied_to_id: Some(Snowflake(99)),
            attachments: vec![attachment(id * 10)],
            embeds: vec![Embed {
                json: r#"{"title":"t"}"#.to_owned(),
            }],
            reactions: vec![Reaction {
                emoji: ReactionEmoji {
                    id: None,
                    name: Some("🦀".to_owned()),
                    flags: 0,
                },
                count: 3,
            }],
            poll: Some(Poll {
                question: "soup or salad".to_owned(),
                multi_select: false,
                expiry_timestamp: 1_700_001_000_000,
                answers: vec![PollAnswer {
                    answer_id: Snowflake(1),
                    text: "soup".to_owned(),
                    emoji: None,
                }],
            }),
        }
    }

    #[tokio::test]
    async fn full_message_round_trips() {
        let repo = MessagesRepository::new(test_pool().await).await.unwrap();
        let original = message(100);
        repo.add(std::slice::from_ref(&original)).await.unwrap();

        let fetched = repo.get_one(Snowflake(100)).await.unwrap().unwrap();
        assert_eq!(fetched, original);
    }

    #[tokio::test]
    async fn re_add_replaces_dependent_rows_without_duplicates() {
        let repo = MessagesRepository::new(test_pool().await).await.unwrap();
        let original = message(100);

        repo.add(std::slice::from_ref(&original)).await.unwrap();
        repo.add(std::slice::from_ref(&original)).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);
        let fetched = repo.get_one(Snowflake(100)).await.unwrap().unwrap();
        assert_eq!(fetched.embeds.len(), 1);
        assert_eq!(fetched.reactions.len(), 1);
        assert_eq!(fetched.attachments.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_attachment_ids_keep_first() {
        let repo = MessagesRepository::new(test_pool().await).await.unwrap();
        let mut msg = message(100);
        let mut dup = attachment(1000);
        dup.name = "duplicate.png".to_owned();
        msg.attachments = vec![attachment(1000), dup];

        repo.add(&[msg]).await.unwrap();

        assert_eq!(repo.count_attachments().await.unwrap(), 1);
        let fetched = repo.get_one(Snowflake(100)).await.unwrap().unwrap();
        assert_eq!(fetched.attachments[0].name, "file1000.png");
    }

    #[tokio::test]
    async fn count_existing_only_counts_archived_ids() {
        let repo = MessagesRepository::new(test_pool().await).await.unwrap();
        repo.add(&[message(1), message(2)]).await.unwrap();

        let existing = repo
            .count_existing(&[Snowflake(1), Snowflake(2), Snowflake(3)])
            .await
            .unwrap();
        assert_eq!(existing, 2);
        assert_eq!(repo.count_existing(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn edit_of_existing_message_wins() {
        let repo = MessagesRepository::new(test_pool().await).await.unwrap();
        repo.add(&[message(7)]).await.unwrap();

        let mut edited = message(7);
        edited.text = "edited".to_owned();
        edited.edit_timestamp = Some(1_700_000_200_000);
        repo.add(&[edited]).await.unwrap();

        let fetched = repo.get_one(Snowflake(7)).await.unwrap().unwrap();
        assert_eq!(fetched.text, "edited");
        assert_eq!(fetched.edit_timestamp, Some(1_700_000_200_000));
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attachment_count_observable_tracks_mutations() {
        let repo = MessagesRepository::new(test_pool().await).await.unwrap();
        let mut observable = repo.attachment_total_count();
        assert_eq!(observable.get(), 0);

        repo.add(&[message(5)]).await.unwrap();
        assert_eq!(observable.changed().await, Some(1));
    }
}
