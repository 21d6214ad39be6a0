use crate::{Result, assignments, from_sql_ms, steps, templates, to_sql_ms};
use rusqlite::{Connection, OptionalExtension, Row, params};
use teamflow_core::SessionSnapshot;
use teamflow_core::model::{Capabilities, Member, Session};

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        template_id: row.get(1)?,
        owner_id: row.get(2)?,
        name: row.get(3)?,
        created_at_ms: from_sql_ms(row.get(4)?),
    })
}

pub fn insert_session(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, template_id, owner_id, name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            session.id,
            session.template_id,
            session.owner_id,
            session.name,
            to_sql_ms(session.created_at_ms)
        ],
    )?;
    Ok(())
}

pub fn get_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT id, template_id, owner_id, name, created_at FROM sessions WHERE id = ?1",
            [session_id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

/// Delete a session; child rows go with it through `ON DELETE CASCADE`.
pub fn delete_session(conn: &Connection, session_id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
    Ok(n > 0)
}

/// Sessions the user owns or is a member of, newest first.
pub fn list_sessions_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(
        "SELECT id, template_id, owner_id, name, created_at FROM sessions
          WHERE owner_id = ?1
             OR id IN (SELECT session_id FROM members WHERE user_id = ?1)
          ORDER BY created_at DESC, id",
    )?;
    let sessions = stmt
        .query_map([user_id], session_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sessions)
}

/// Owner or member of the session. False if the session does not exist.
pub fn is_participant(conn: &Connection, session_id: &str, user_id: &str) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM sessions WHERE id = ?1 AND owner_id = ?2
            UNION ALL
            SELECT 1 FROM members WHERE session_id = ?1 AND user_id = ?2
         )",
        params![session_id, user_id],
        |row| row.get(0),
    )?;
    Ok(found)
}

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

const MEMBER_COLUMNS: &str = "session_id, user_id, can_edit_steps, can_manage_assignments,
     can_manage_sharing, can_edit_intel, can_edit_proof, can_chat, allow_lane_delegation,
     lane_color, added_at";

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        capabilities: Capabilities {
            can_edit_steps: row.get(2)?,
            can_manage_assignments: row.get(3)?,
            can_manage_sharing: row.get(4)?,
            can_edit_intel: row.get(5)?,
            can_edit_proof: row.get(6)?,
            can_chat: row.get(7)?,
            allow_lane_delegation: row.get(8)?,
        },
        lane_color: row.get(9)?,
        added_at_ms: from_sql_ms(row.get(10)?),
    })
}

pub fn insert_member(conn: &Connection, member: &Member) -> Result<()> {
    let c = &member.capabilities;
    conn.execute(
        &format!("INSERT INTO members ({MEMBER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
        params![
            member.session_id,
            member.user_id,
            c.can_edit_steps,
            c.can_manage_assignments,
            c.can_manage_sharing,
            c.can_edit_intel,
            c.can_edit_proof,
            c.can_chat,
            c.allow_lane_delegation,
            member.lane_color,
            to_sql_ms(member.added_at_ms),
        ],
    )?;
    Ok(())
}

pub fn get_member(conn: &Connection, session_id: &str, user_id: &str) -> Result<Option<Member>> {
    let member = conn
        .query_row(
            &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE session_id = ?1 AND user_id = ?2"),
            params![session_id, user_id],
            member_from_row,
        )
        .optional()?;
    Ok(member)
}

/// Overwrite the capability flags and lane colour of an existing member.
pub fn update_member(conn: &Connection, member: &Member) -> Result<bool> {
    let c = &member.capabilities;
    let n = conn.execute(
        "UPDATE members
            SET can_edit_steps = ?3, can_manage_assignments = ?4, can_manage_sharing = ?5,
                can_edit_intel = ?6, can_edit_proof = ?7, can_chat = ?8,
                allow_lane_delegation = ?9, lane_color = ?10
          WHERE session_id = ?1 AND user_id = ?2",
        params![
            member.session_id,
            member.user_id,
            c.can_edit_steps,
            c.can_manage_assignments,
            c.can_manage_sharing,
            c.can_edit_intel,
            c.can_edit_proof,
            c.can_chat,
            c.allow_lane_delegation,
            member.lane_color,
        ],
    )?;
    Ok(n > 0)
}

pub fn delete_member(conn: &Connection, session_id: &str, user_id: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM members WHERE session_id = ?1 AND user_id = ?2",
        params![session_id, user_id],
    )?;
    Ok(n > 0)
}

pub fn list_members(conn: &Connection, session_id: &str) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMBER_COLUMNS} FROM members WHERE session_id = ?1 ORDER BY added_at, user_id"
    ))?;
    let members = stmt
        .query_map([session_id], member_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(members)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read everything the access resolver needs for one session.
///
/// Call inside a transaction when the snapshot guards a write, so the
/// checks and the write see the same state.
pub fn load_snapshot(conn: &Connection, session_id: &str) -> Result<Option<SessionSnapshot>> {
    let Some(session) = get_session(conn, session_id)? else {
        return Ok(None);
    };
    let step_order = templates::list_template_steps(conn, &session.template_id)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    Ok(Some(SessionSnapshot {
        step_order,
        steps: steps::list_session_steps(conn, session_id)?,
        members: list_members(conn, session_id)?,
        assignments: assignments::list_assignments(conn, session_id)?,
        lane_delegates: assignments::list_lane_delegates(conn, session_id)?,
        session,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use teamflow_core::model::Capability;

    fn setup() -> Connection {
        let conn = test_support::conn();
        templates::insert_template(&conn, &test_support::template("t1", "owner", &["a", "b"]))
            .unwrap();
        insert_session(&conn, &test_support::session("s1", "t1", "owner")).unwrap();
        conn
    }

    fn member(user: &str, caps: &[Capability]) -> Member {
        Member {
            session_id: "s1".into(),
            user_id: user.into(),
            capabilities: Capabilities::from_granted(caps),
            lane_color: None,
            added_at_ms: 5,
        }
    }

    #[test]
    fn member_round_trip_and_update() {
        let conn = setup();
        insert_member(&conn, &member("bob", &[Capability::Chat])).unwrap();
        let mut bob = get_member(&conn, "s1", "bob").unwrap().unwrap();
        assert!(bob.capabilities.can_chat);
        assert!(!bob.capabilities.can_edit_proof);

        bob.capabilities.can_edit_proof = true;
        bob.lane_color = Some("#00ff00".into());
        assert!(update_member(&conn, &bob).unwrap());
        let bob = get_member(&conn, "s1", "bob").unwrap().unwrap();
        assert!(bob.capabilities.can_edit_proof);
        assert_eq!(bob.lane_color.as_deref(), Some("#00ff00"));
    }

    #[test]
    fn duplicate_member_is_rejected_by_key() {
        let conn = setup();
        insert_member(&conn, &member("bob", &[])).unwrap();
        assert!(insert_member(&conn, &member("bob", &[])).is_err());
    }

    #[test]
    fn participants_include_owner_without_member_row() {
        let conn = setup();
        insert_member(&conn, &member("bob", &[])).unwrap();
        assert!(is_participant(&conn, "s1", "owner").unwrap());
        assert!(is_participant(&conn, "s1", "bob").unwrap());
        assert!(!is_participant(&conn, "s1", "eve").unwrap());
        assert!(!is_participant(&conn, "nope", "owner").unwrap());
    }

    #[test]
    fn list_sessions_covers_owned_and_joined() {
        let conn = setup();
        insert_session(&conn, &test_support::session("s2", "t1", "carol")).unwrap();
        insert_member(
            &conn,
            &Member {
                session_id: "s2".into(),
                ..member("bob", &[])
            },
        )
        .unwrap();
        let owner_sessions = list_sessions_for_user(&conn, "owner").unwrap();
        assert_eq!(owner_sessions.len(), 1);
        let bob_sessions = list_sessions_for_user(&conn, "bob").unwrap();
        assert_eq!(bob_sessions.len(), 1);
        assert_eq!(bob_sessions[0].id, "s2");
    }

    #[test]
    fn delete_session_cascades_members() {
        let conn = setup();
        insert_member(&conn, &member("bob", &[])).unwrap();
        assert!(delete_session(&conn, "s1").unwrap());
        assert!(list_members(&conn, "s1").unwrap().is_empty());
        assert!(!delete_session(&conn, "s1").unwrap());
    }

    #[test]
    fn snapshot_uses_template_order() {
        let conn = setup();
        let snap = load_snapshot(&conn, "s1").unwrap().unwrap();
        assert_eq!(snap.step_order, vec!["a", "b"]);
        assert!(snap.members.is_empty());
        assert!(load_snapshot(&conn, "missing").unwrap().is_none());
    }
}
