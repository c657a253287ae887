use crate::models::{ConversationRow, MessageRow, UserRow};
use crate::{Database, StoreError, now_timestamp};
use anyhow::Result;
use idm_types::models::Role;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, types::Type};

const USER_COLUMNS: &str = "id, username, name, email, password, created_at";
const CONVERSATION_COLUMNS: &str = "id, user_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, created_at";

impl Database {
    // -- Users --

    /// Insert a user. A duplicate username or email is reported as
    /// [`StoreError::Conflict`] even if it slipped past an earlier lookup.
    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, username, name, email, password, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, username, name, email, password_hash, now_timestamp()],
            );

            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, msg))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    let field = if msg.as_deref().is_some_and(|m| m.contains("users.email")) {
                        "email"
                    } else {
                        "username"
                    };
                    Err(StoreError::Conflict { field }.into())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Conversations --

    /// Returns the new conversation's id.
    pub fn create_conversation(&self, user_id: &str, title: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO conversations (user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![user_id, title, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_conversation(&self, id: i64) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                    [id],
                    map_conversation,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Most recently active first. `limit = None` returns every row.
    pub fn list_conversations(&self, user_id: &str, limit: Option<u32>) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE user_id = ?1
                 ORDER BY updated_at DESC, id DESC
                 LIMIT ?2"
            ))?;

            // SQLite treats a negative LIMIT as "no limit"
            let limit = limit.map(i64::from).unwrap_or(-1);
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], map_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Delete a conversation and all of its messages in one transaction.
    /// Returns false if there was nothing to delete.
    pub fn delete_conversation(&self, id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM conversation_messages WHERE conversation_id = ?1", [id])?;
            let deleted = tx.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
    }

    // -- Messages --

    /// Append a message and bump the parent's `updated_at` atomically.
    ///
    /// The stored timestamp never precedes the conversation's latest message,
    /// so chronological order survives a wall clock stepping backwards.
    pub fn append_message(&self, conversation_id: i64, role: Role, content: &str) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let latest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM conversation_messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            let created_at = match latest {
                Some(latest) => now_timestamp().max(latest),
                None => now_timestamp(),
            };

            tx.execute(
                "INSERT INTO conversation_messages (conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![conversation_id, role.as_str(), content, created_at],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![created_at, conversation_id],
            )?;

            tx.commit()?;

            Ok(MessageRow {
                id,
                conversation_id,
                role,
                content: content.to_string(),
                created_at,
            })
        })
    }

    /// All messages of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM conversation_messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;

            let rows = stmt
                .query_map([conversation_id], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// The last `limit` messages of a conversation, oldest first.
    pub fn get_recent_messages(&self, conversation_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                     SELECT {MESSAGE_COLUMNS} FROM conversation_messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2
                 )
                 ORDER BY created_at ASC, id ASC"
            ))?;

            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn count_messages(&self, conversation_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

/// `column` is always one of our own literals, never user input.
fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1"))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                name: row.get(2)?,
                email: row.get(3)?,
                password: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let role: String = row.get(2)?;
    let role = role
        .parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;

    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}
