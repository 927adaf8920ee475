//! Schema versioning: initialization and forward-only migrations.
//!
//! The `metadata` table holds a single `version` row. Opening a fresh file
//! creates the current schema directly; opening an older file walks the
//! migration list one adjacent pair at a time, each step in its own
//! transaction with the version row bumped inside it, so an interrupted
//! upgrade resumes at the step it died in.

use sqlx::{Connection, SqliteConnection};

use dht_core::{SchemaError, StorageError};

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 8;

/// Decisions and progress reporting supplied by the caller of `open`.
pub trait SchemaUpgradeCallbacks: Send + Sync {
    /// Asked once before any migration runs. Refusing leaves the database
    /// unopened and unmodified.
    fn can_upgrade(&self, from: u32, to: u32) -> bool;

    /// Invoked before each migration step with the version being created.
    fn next_version(&self, _version: u32) {}
}

/// Callbacks that always permit the upgrade and ignore progress.
pub struct AlwaysUpgrade;

impl SchemaUpgradeCallbacks for AlwaysUpgrade {
    fn can_upgrade(&self, _from: u32, _to: u32) -> bool {
        true
    }
}

/// Outcome of schema setup.
#[derive(Debug, PartialEq, Eq)]
pub enum SchemaSetupOutcome {
    /// Schema is at [`CURRENT_VERSION`]; the database may be used.
    Ready,
    /// The caller refused the upgrade; nothing was modified.
    UpgradeRefused,
}

/// Tables created for a fresh archive.
const INITIAL_SCHEMA: &[&str] = &[
    "CREATE TABLE users (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        avatar_url TEXT,
        discriminator TEXT
    )",
    "CREATE TABLE servers (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        type TEXT NOT NULL
    )",
    "CREATE TABLE channels (
        id INTEGER PRIMARY KEY NOT NULL,
        server INTEGER NOT NULL,
        name TEXT NOT NULL,
        parent_id INTEGER,
        position INTEGER,
        topic TEXT,
        nsfw INTEGER
    )",
    "CREATE TABLE messages (
        message_id INTEGER PRIMARY KEY NOT NULL,
        sender_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE attachments (
        message_id INTEGER NOT NULL,
        attachment_id INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        type TEXT,
        normalized_url TEXT NOT NULL,
        download_url TEXT NOT NULL,
        size INTEGER NOT NULL,
        width INTEGER,
        height INTEGER
    )",
    "CREATE INDEX attachments_message_ix ON attachments (message_id)",
    "CREATE TABLE embeds (
        message_id INTEGER NOT NULL,
        json TEXT NOT NULL
    )",
    "CREATE INDEX embeds_message_ix ON embeds (message_id)",
    "CREATE TABLE reactions (
        message_id INTEGER NOT NULL,
        emoji_id INTEGER,
        emoji_name TEXT,
        emoji_flags INTEGER NOT NULL,
        count INTEGER NOT NULL
    )",
    "CREATE INDEX reactions_message_ix ON reactions (message_id)",
    "CREATE TABLE edit_timestamps (
        message_id INTEGER PRIMARY KEY NOT NULL,
        edit_timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE replied_to (
        message_id INTEGER PRIMARY KEY NOT NULL,
        replied_to_id INTEGER NOT NULL
    )",
    "CREATE TABLE download_metadata (
        normalized_url TEXT PRIMARY KEY NOT NULL,
        download_url TEXT NOT NULL,
        status INTEGER NOT NULL,
        type TEXT,
        size INTEGER
    )",
    "CREATE TABLE download_blobs (
        normalized_url TEXT PRIMARY KEY NOT NULL,
        blob BLOB NOT NULL,
        FOREIGN KEY (normalized_url) REFERENCES download_metadata (normalized_url)
            ON UPDATE CASCADE ON DELETE CASCADE
    )",
    "CREATE TABLE polls (
        message_id INTEGER PRIMARY KEY NOT NULL,
        question TEXT NOT NULL,
        multi_select INTEGER NOT NULL,
        expiry_timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE poll_answers (
        message_id INTEGER NOT NULL,
        answer_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        emoji_id INTEGER,
        emoji_name TEXT,
        emoji_flags INTEGER,
        PRIMARY KEY (message_id, answer_id)
    )",
    "CREATE INDEX poll_answers_message_ix ON poll_answers (message_id)",
];

/// Statements upgrading `from` to `from + 1`, for every adjacent pair.
///
/// Order matters; entries are applied exactly as listed. A step never
/// touches the version row itself, the runner bumps it in the same
/// transaction after the statements succeed.
fn migration_statements(from: u32) -> Option<&'static [&'static str]> {
    // Split the edit/reply columns out of messages
    const V1_TO_V2: &[&str] = &[
        "CREATE TABLE edit_timestamps (
            message_id INTEGER PRIMARY KEY NOT NULL,
            edit_timestamp INTEGER NOT NULL
        )",
        "INSERT INTO edit_timestamps (message_id, edit_timestamp)
         SELECT message_id, edit_timestamp FROM messages WHERE edit_timestamp IS NOT NULL",
        "CREATE TABLE replied_to (
            message_id INTEGER PRIMARY KEY NOT NULL,
            replied_to_id INTEGER NOT NULL
        )",
        "INSERT INTO replied_to (message_id, replied_to_id)
         SELECT message_id, replied_to_id FROM messages WHERE replied_to_id IS NOT NULL",
        "ALTER TABLE messages DROP COLUMN edit_timestamp",
        "ALTER TABLE messages DROP COLUMN replied_to_id",
    ];

    // Download tables
    const V2_TO_V3: &[&str] = &[
        "CREATE TABLE download_metadata (
            normalized_url TEXT PRIMARY KEY NOT NULL,
            download_url TEXT NOT NULL,
            status INTEGER NOT NULL,
            type TEXT,
            size INTEGER
        )",
        "CREATE TABLE download_blobs (
            normalized_url TEXT PRIMARY KEY NOT NULL,
            blob BLOB NOT NULL,
            FOREIGN KEY (normalized_url) REFERENCES download_metadata (normalized_url)
                ON UPDATE CASCADE ON DELETE CASCADE
        )",
    ];

    // Group chats and DMs join guilds under one table
    const V3_TO_V4: &[&str] =
        &["ALTER TABLE servers ADD COLUMN type TEXT NOT NULL DEFAULT 'server'"];

    // Embeds and reactions
    const V4_TO_V5: &[&str] = &[
        "CREATE TABLE embeds (
            message_id INTEGER NOT NULL,
            json TEXT NOT NULL
        )",
        "CREATE INDEX embeds_message_ix ON embeds (message_id)",
        "CREATE TABLE reactions (
            message_id INTEGER NOT NULL,
            emoji_id INTEGER,
            emoji_name TEXT,
            emoji_flags INTEGER NOT NULL,
            count INTEGER NOT NULL
        )",
        "CREATE INDEX reactions_message_ix ON reactions (message_id)",
    ];

    // Keep the verbatim CDN URL next to the canonical one
    const V5_TO_V6: &[&str] = &[
        "ALTER TABLE attachments RENAME COLUMN url TO normalized_url",
        "ALTER TABLE attachments ADD COLUMN download_url TEXT NOT NULL DEFAULT ''",
        "UPDATE attachments SET download_url = normalized_url WHERE download_url = ''",
    ];

    const V6_TO_V7: &[&str] = &[
        "ALTER TABLE attachments ADD COLUMN width INTEGER",
        "ALTER TABLE attachments ADD COLUMN height INTEGER",
    ];

    const V7_TO_V8: &[&str] = &[
        "CREATE TABLE polls (
            message_id INTEGER PRIMARY KEY NOT NULL,
            question TEXT NOT NULL,
            multi_select INTEGER NOT NULL,
            expiry_timestamp INTEGER NOT NULL
        )",
        "CREATE TABLE poll_answers (
            message_id INTEGER NOT NULL,
            answer_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            emoji_id INTEGER,
            emoji_name TEXT,
            emoji_flags INTEGER,
            PRIMARY KEY (message_id, answer_id)
        )",
        "CREATE INDEX poll_answers_message_ix ON poll_answers (message_id)",
    ];

    match from {
        1 => Some(V1_TO_V2),
        2 => Some(V2_TO_V3),
        3 => Some(V3_TO_V4),
        4 => Some(V4_TO_V5),
        5 => Some(V5_TO_V6),
        6 => Some(V6_TO_V7),
        7 => Some(V7_TO_V8),
        _ => None,
    }
}

fn storage(e: sqlx::Error) -> StorageError {
    StorageError::Storage(e.to_string())
}

/// Read the stored schema version, if any.
async fn read_version(conn: &mut SqliteConnection) -> Result<Option<String>, StorageError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM metadata WHERE key = 'version'")
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage)?;
    Ok(row.map(|(v,)| v))
}

/// Bring the schema to [`CURRENT_VERSION`], creating or migrating as needed.
///
/// Runs on a dedicated connection acquired before any repository exists, so
/// long migrations cannot starve regular writers.
pub async fn setup_schema(
    conn: &mut SqliteConnection,
    callbacks: &dyn SchemaUpgradeCallbacks,
) -> Result<SchemaSetupOutcome, SchemaError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)")
        .execute(&mut *conn)
        .await
        .map_err(|e| SchemaError::Storage(storage(e)))?;

    let Some(raw) = read_version(conn).await? else {
        initialize_schemas(conn).await?;
        tracing::info!(version = CURRENT_VERSION, "created fresh schema");
        return Ok(SchemaSetupOutcome::Ready);
    };

    let version: u32 = raw
        .parse()
        .ok()
        .filter(|v| *v >= 1)
        .ok_or_else(|| SchemaError::InvalidDatabaseVersion(raw.clone()))?;

    if version > CURRENT_VERSION {
        return Err(SchemaError::DatabaseTooNew {
            found: version,
            supported: CURRENT_VERSION,
        });
    }

    if version == CURRENT_VERSION {
        return Ok(SchemaSetupOutcome::Ready);
    }

    if !callbacks.can_upgrade(version, CURRENT_VERSION) {
        tracing::info!(from = version, to = CURRENT_VERSION, "upgrade refused");
        return Ok(SchemaSetupOutcome::UpgradeRefused);
    }

    for from in version..CURRENT_VERSION {
        callbacks.next_version(from + 1);
        apply_migration(conn, from).await?;
        tracing::info!(from, to = from + 1, "schema migrated");
    }

    Ok(SchemaSetupOutcome::Ready)
}

/// Create the full current schema and stamp the version, atomically.
async fn initialize_schemas(conn: &mut SqliteConnection) -> Result<(), SchemaError> {
    let mut tx = conn.begin().await.map_err(|e| SchemaError::Storage(storage(e)))?;
    for statement in INITIAL_SCHEMA {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| SchemaError::Storage(storage(e)))?;
    }
    sqlx::query("INSERT INTO metadata (key, value) VALUES ('version', ?)")
        .bind(CURRENT_VERSION.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| SchemaError::Storage(storage(e)))?;
    tx.commit().await.map_err(|e| SchemaError::Storage(storage(e)))
}

/// Run one migration step in its own transaction, bumping the version row
/// with it. An interrupted attempt leaves the version untouched and the
/// step re-runs cleanly next open.
async fn apply_migration(conn: &mut SqliteConnection, from: u32) -> Result<(), SchemaError> {
    let statements = migration_statements(from).ok_or_else(|| SchemaError::MigrationFailed {
        from,
        message: "no migration registered".to_owned(),
    })?;

    let mut tx = conn.begin().await.map_err(|e| SchemaError::Storage(storage(e)))?;
    for statement in statements {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| SchemaError::MigrationFailed {
                from,
                message: e.to_string(),
            })?;
    }
    sqlx::query("UPDATE metadata SET value = ? WHERE key = 'version'")
        .bind((from + 1).to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| SchemaError::MigrationFailed {
            from,
            message: e.to_string(),
        })?;
    tx.commit().await.map_err(|e| SchemaError::Storage(storage(e)))
}
