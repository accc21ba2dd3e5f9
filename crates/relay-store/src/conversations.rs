use crate::StoreError;
use relay_types::{ConversationMessage, MessageRole, Registration};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Parameters for opening a conversation record at session start.
#[derive(Debug, Clone)]
pub struct CreateConversationParams {
    pub session_id: String,
    pub agent_id: String,
    pub client_id: String,
    pub stream_sid: String,
}

/// Creates the conversation record for a new session.
pub fn create_conversation(
    conn: &Connection,
    params: &CreateConversationParams,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO conversations (session_id, agent_id, client_id, stream_sid)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            params.session_id,
            params.agent_id,
            params.client_id,
            params.stream_sid,
        ],
    )?;
    tracing::debug!(
        session_id = %params.session_id,
        agent_id = %params.agent_id,
        "conversation record created"
    );
    Ok(())
}

/// Appends one message to a session's conversation log.
pub fn append_message(
    conn: &Connection,
    session_id: &str,
    role: MessageRole,
    content: &str,
) -> Result<ConversationMessage, StoreError> {
    let created_at = conn
        .query_row(
            "INSERT INTO conversation_messages (session_id, role, content)
             SELECT session_id, ?2, ?3 FROM conversations WHERE session_id = ?1
             RETURNING created_at",
            params![session_id, role.as_str(), content],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::ConversationNotFound(session_id.to_string()))?;

    Ok(ConversationMessage {
        role,
        content: content.to_string(),
        created_at,
    })
}

/// Returns the last `limit` messages of a session, oldest first.
pub fn recent_messages(
    conn: &Connection,
    session_id: &str,
    limit: usize,
) -> Result<Vec<ConversationMessage>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT role, content, created_at FROM (
            SELECT id, role, content, created_at FROM conversation_messages
            WHERE session_id = ?1
            ORDER BY id DESC
            LIMIT ?2
         ) ORDER BY id ASC",
    )?;

    let rows = stmt.query_map(params![session_id, limit as i64], map_row_to_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Reads the caller details recorded so far for a session.
pub fn get_registration(conn: &Connection, session_id: &str) -> Result<Registration, StoreError> {
    conn.query_row(
        "SELECT caller_name, caller_phone FROM conversations WHERE session_id = ?1",
        [session_id],
        |row| {
            Ok(Registration {
                caller_name: row.get(0)?,
                caller_phone: row.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::ConversationNotFound(session_id.to_string()))
}

/// Stores caller details. `None` fields leave the stored value untouched.
pub fn update_registration(
    conn: &Connection,
    session_id: &str,
    registration: &Registration,
) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE conversations SET
            caller_name = COALESCE(?2, caller_name),
            caller_phone = COALESCE(?3, caller_phone)
         WHERE session_id = ?1",
        params![
            session_id,
            registration.caller_name,
            registration.caller_phone
        ],
    )?;
    if count == 0 {
        return Err(StoreError::ConversationNotFound(session_id.to_string()));
    }
    Ok(())
}

/// Marks a conversation as ended.
///
/// Returns `false` if it had already been ended, so repeated calls are safe.
pub fn end_conversation(conn: &Connection, session_id: &str) -> Result<bool, StoreError> {
    let count = conn.execute(
        "UPDATE conversations SET ended_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE session_id = ?1 AND ended_at IS NULL",
        [session_id],
    )?;
    Ok(count == 1)
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<ConversationMessage> {
    let role_str: String = row.get(0)?;
    let role = role_str.parse::<MessageRole>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ConversationMessage {
        role,
        content: row.get(1)?,
        created_at: row.get(2)?,
    })
}
