use crate::{Result, from_sql_ms, to_sql_ms};
use rusqlite::{Connection, OptionalExtension, Row, params};
use teamflow_core::model::{ChatMessage, MessageRead};

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        author_user_id: row.get(2)?,
        content: row.get(3)?,
        created_at_ms: from_sql_ms(row.get(4)?),
    })
}

pub fn insert_message(conn: &Connection, message: &ChatMessage) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_messages (id, session_id, author_user_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.id,
            message.session_id,
            message.author_user_id,
            message.content,
            to_sql_ms(message.created_at_ms)
        ],
    )?;
    Ok(())
}

pub fn get_message(conn: &Connection, message_id: &str) -> Result<Option<ChatMessage>> {
    let message = conn
        .query_row(
            "SELECT id, session_id, author_user_id, content, created_at
               FROM chat_messages WHERE id = ?1",
            [message_id],
            message_from_row,
        )
        .optional()?;
    Ok(message)
}

pub fn delete_message(conn: &Connection, message_id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM chat_messages WHERE id = ?1", [message_id])?;
    Ok(n > 0)
}

/// Messages of a session, oldest first.
pub fn list_messages(conn: &Connection, session_id: &str) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, author_user_id, content, created_at
           FROM chat_messages WHERE session_id = ?1
          ORDER BY created_at, rowid",
    )?;
    let messages = stmt
        .query_map([session_id], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

/// Record a read receipt. Messages outside `session_id` are ignored and an
/// existing receipt is kept. Returns whether a new row was written.
pub fn mark_read(
    conn: &Connection,
    session_id: &str,
    message_id: &str,
    user_id: &str,
    at_ms: u64,
) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
         SELECT id, ?3, ?4 FROM chat_messages WHERE id = ?1 AND session_id = ?2",
        params![message_id, session_id, user_id, to_sql_ms(at_ms)],
    )?;
    Ok(n > 0)
}

/// Read receipts for every message of a session.
pub fn list_reads(conn: &Connection, session_id: &str) -> Result<Vec<MessageRead>> {
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id, r.read_at
           FROM message_reads r
           JOIN chat_messages m ON m.id = r.message_id
          WHERE m.session_id = ?1
          ORDER BY r.read_at, r.user_id",
    )?;
    let reads = stmt
        .query_map([session_id], |row| {
            Ok(MessageRead {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                read_at_ms: from_sql_ms(row.get(2)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(reads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sessions, templates, test_support};

    fn setup() -> Connection {
        let conn = test_support::conn();
        templates::insert_template(&conn, &test_support::template("t1", "o", &["a"])).unwrap();
        sessions::insert_session(&conn, &test_support::session("s1", "t1", "o")).unwrap();
        sessions::insert_session(&conn, &test_support::session("s2", "t1", "o")).unwrap();
        conn
    }

    fn message(id: &str, session: &str, at: u64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            session_id: session.into(),
            author_user_id: "o".into(),
            content: format!("hello from {id}"),
            created_at_ms: at,
        }
    }

    #[test]
    fn read_receipts_are_idempotent() {
        let conn = setup();
        insert_message(&conn, &message("m1", "s1", 1)).unwrap();
        assert!(mark_read(&conn, "s1", "m1", "bob", 5).unwrap());
        assert!(!mark_read(&conn, "s1", "m1", "bob", 9).unwrap());

        let reads = list_reads(&conn, "s1").unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].read_at_ms, 5);
    }

    #[test]
    fn read_receipts_ignore_foreign_messages() {
        let conn = setup();
        insert_message(&conn, &message("m2", "s2", 1)).unwrap();
        assert!(!mark_read(&conn, "s1", "m2", "bob", 5).unwrap());
        assert!(!mark_read(&conn, "s1", "missing", "bob", 5).unwrap());
        assert!(list_reads(&conn, "s2").unwrap().is_empty());
    }

    #[test]
    fn messages_list_oldest_first_and_delete_cascades() {
        let conn = setup();
        insert_message(&conn, &message("m2", "s1", 20)).unwrap();
        insert_message(&conn, &message("m1", "s1", 10)).unwrap();
        mark_read(&conn, "s1", "m1", "bob", 30).unwrap();

        let ids: Vec<_> = list_messages(&conn, "s1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        assert!(delete_message(&conn, "m1").unwrap());
        assert!(get_message(&conn, "m1").unwrap().is_none());
        assert!(list_reads(&conn, "s1").unwrap().is_empty());
    }
}
