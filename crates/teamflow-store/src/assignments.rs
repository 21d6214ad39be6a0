use crate::{Result, now_sql};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashMap;
use teamflow_core::model::{Assignment, LaneDelegate};

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: row.get(0)?,
        session_id: row.get(1)?,
        step_id: row.get(2)?,
        assignee_user_id: row.get(3)?,
        allow_delegation: row.get(4)?,
        allow_delegation_to_everyone: row.get(5)?,
        delegates: Vec::new(),
    })
}

const ASSIGNMENT_COLUMNS: &str =
    "id, session_id, step_id, assignee_user_id, allow_delegation, allow_delegation_to_everyone";

/// Insert the assignment row and its explicit delegates.
pub fn insert_assignment(conn: &Connection, assignment: &Assignment) -> Result<()> {
    conn.execute(
        "INSERT INTO assignments
            (id, session_id, step_id, assignee_user_id, allow_delegation,
             allow_delegation_to_everyone, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            assignment.id,
            assignment.session_id,
            assignment.step_id,
            assignment.assignee_user_id,
            assignment.allow_delegation,
            assignment.allow_delegation_to_everyone,
            now_sql(),
        ],
    )?;
    for delegate in &assignment.delegates {
        insert_assignment_delegate(conn, &assignment.id, delegate)?;
    }
    Ok(())
}

/// Id of an existing assignment binding `step_id` to `assignee`, if any.
pub fn find_assignment(
    conn: &Connection,
    session_id: &str,
    step_id: &str,
    assignee: &str,
) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM assignments
              WHERE session_id = ?1 AND step_id = ?2 AND assignee_user_id = ?3",
            params![session_id, step_id, assignee],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn get_assignment(conn: &Connection, assignment_id: &str) -> Result<Option<Assignment>> {
    let assignment = conn
        .query_row(
            &format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?1"),
            [assignment_id],
            assignment_from_row,
        )
        .optional()?;
    let Some(mut assignment) = assignment else {
        return Ok(None);
    };
    assignment.delegates = list_assignment_delegates(conn, assignment_id)?;
    Ok(Some(assignment))
}

/// All assignments of a session with their delegates, in creation order.
pub fn list_assignments(conn: &Connection, session_id: &str) -> Result<Vec<Assignment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
          WHERE session_id = ?1 ORDER BY created_at, rowid"
    ))?;
    let mut assignments = stmt
        .query_map([session_id], assignment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT d.assignment_id, d.delegate_user_id
           FROM assignment_delegates d
           JOIN assignments a ON a.id = d.assignment_id
          WHERE a.session_id = ?1
          ORDER BY d.delegate_user_id",
    )?;
    let mut delegates: HashMap<String, Vec<String>> = HashMap::new();
    let rows = stmt.query_map([session_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (assignment_id, delegate) = row?;
        delegates.entry(assignment_id).or_default().push(delegate);
    }
    for assignment in &mut assignments {
        if let Some(list) = delegates.remove(&assignment.id) {
            assignment.delegates = list;
        }
    }
    Ok(assignments)
}

/// Overwrite the delegation flags. Explicit delegates are left in place.
pub fn update_assignment_flags(
    conn: &Connection,
    assignment_id: &str,
    allow_delegation: bool,
    to_everyone: bool,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE assignments SET allow_delegation = ?2, allow_delegation_to_everyone = ?3
          WHERE id = ?1",
        params![assignment_id, allow_delegation, to_everyone],
    )?;
    Ok(n > 0)
}

pub fn delete_assignment(conn: &Connection, assignment_id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM assignments WHERE id = ?1", [assignment_id])?;
    Ok(n > 0)
}

// ---------------------------------------------------------------------------
// Assignment delegates
// ---------------------------------------------------------------------------

fn list_assignment_delegates(conn: &Connection, assignment_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT delegate_user_id FROM assignment_delegates
          WHERE assignment_id = ?1 ORDER BY delegate_user_id",
    )?;
    let delegates = stmt
        .query_map([assignment_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(delegates)
}

/// Returns false when the delegate was already present.
pub fn insert_assignment_delegate(
    conn: &Connection,
    assignment_id: &str,
    delegate_user_id: &str,
) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO assignment_delegates (assignment_id, delegate_user_id)
         VALUES (?1, ?2)",
        params![assignment_id, delegate_user_id],
    )?;
    Ok(n > 0)
}

pub fn delete_assignment_delegate(
    conn: &Connection,
    assignment_id: &str,
    delegate_user_id: &str,
) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM assignment_delegates WHERE assignment_id = ?1 AND delegate_user_id = ?2",
        params![assignment_id, delegate_user_id],
    )?;
    Ok(n > 0)
}

// ---------------------------------------------------------------------------
// Lane delegates
// ---------------------------------------------------------------------------

/// Returns false when the pair was already present.
pub fn insert_lane_delegate(conn: &Connection, delegate: &LaneDelegate) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO lane_delegates (session_id, owner_user_id, delegate_user_id)
         VALUES (?1, ?2, ?3)",
        params![
            delegate.session_id,
            delegate.owner_user_id,
            delegate.delegate_user_id
        ],
    )?;
    Ok(n > 0)
}

pub fn delete_lane_delegate(conn: &Connection, delegate: &LaneDelegate) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM lane_delegates
          WHERE session_id = ?1 AND owner_user_id = ?2 AND delegate_user_id = ?3",
        params![
            delegate.session_id,
            delegate.owner_user_id,
            delegate.delegate_user_id
        ],
    )?;
    Ok(n > 0)
}

pub fn list_lane_delegates(conn: &Connection, session_id: &str) -> Result<Vec<LaneDelegate>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, owner_user_id, delegate_user_id FROM lane_delegates
          WHERE session_id = ?1 ORDER BY owner_user_id, delegate_user_id",
    )?;
    let delegates = stmt
        .query_map([session_id], |row| {
            Ok(LaneDelegate {
                session_id: row.get(0)?,
                owner_user_id: row.get(1)?,
                delegate_user_id: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(delegates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sessions, templates, test_support};

    fn setup() -> Connection {
        let conn = test_support::conn();
        templates::insert_template(&conn, &test_support::template("t1", "o", &["a", "b"]))
            .unwrap();
        sessions::insert_session(&conn, &test_support::session("s1", "t1", "o")).unwrap();
        conn
    }

    fn assignment(id: &str, step: &str, assignee: &str) -> Assignment {
        Assignment {
            id: id.into(),
            session_id: "s1".into(),
            step_id: step.into(),
            assignee_user_id: assignee.into(),
            allow_delegation: true,
            allow_delegation_to_everyone: false,
            delegates: Vec::new(),
        }
    }

    #[test]
    fn delegates_load_with_assignment() {
        let conn = setup();
        insert_assignment(
            &conn,
            &Assignment {
                delegates: vec!["carol".into()],
                ..assignment("x1", "a", "bob")
            },
        )
        .unwrap();
        insert_assignment(&conn, &assignment("x2", "b", "bob")).unwrap();

        assert!(insert_assignment_delegate(&conn, "x1", "dave").unwrap());
        assert!(!insert_assignment_delegate(&conn, "x1", "dave").unwrap());

        let x1 = get_assignment(&conn, "x1").unwrap().unwrap();
        assert_eq!(x1.delegates, vec!["carol", "dave"]);

        let all = list_assignments(&conn, "s1").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].delegates, vec!["carol", "dave"]);
        assert!(all[1].delegates.is_empty());
    }

    #[test]
    fn find_matches_step_and_assignee() {
        let conn = setup();
        insert_assignment(&conn, &assignment("x1", "a", "bob")).unwrap();
        assert_eq!(
            find_assignment(&conn, "s1", "a", "bob").unwrap().as_deref(),
            Some("x1")
        );
        assert!(find_assignment(&conn, "s1", "a", "carol").unwrap().is_none());
        assert!(find_assignment(&conn, "s1", "b", "bob").unwrap().is_none());
    }

    #[test]
    fn flag_update_keeps_explicit_delegates() {
        let conn = setup();
        insert_assignment(
            &conn,
            &Assignment {
                delegates: vec!["carol".into()],
                ..assignment("x1", "a", "bob")
            },
        )
        .unwrap();
        assert!(update_assignment_flags(&conn, "x1", true, true).unwrap());
        let x1 = get_assignment(&conn, "x1").unwrap().unwrap();
        assert!(x1.allow_delegation_to_everyone);
        assert_eq!(x1.delegates, vec!["carol"]);
    }

    #[test]
    fn deleting_assignment_drops_its_delegates() {
        let conn = setup();
        insert_assignment(
            &conn,
            &Assignment {
                delegates: vec!["carol".into()],
                ..assignment("x1", "a", "bob")
            },
        )
        .unwrap();
        assert!(delete_assignment(&conn, "x1").unwrap());
        assert!(!delete_assignment_delegate(&conn, "x1", "carol").unwrap());
        assert!(get_assignment(&conn, "x1").unwrap().is_none());
    }

    #[test]
    fn lane_delegates_are_idempotent() {
        let conn = setup();
        let d = LaneDelegate {
            session_id: "s1".into(),
            owner_user_id: "bob".into(),
            delegate_user_id: "carol".into(),
        };
        assert!(insert_lane_delegate(&conn, &d).unwrap());
        assert!(!insert_lane_delegate(&conn, &d).unwrap());
        assert_eq!(list_lane_delegates(&conn, "s1").unwrap(), vec![d.clone()]);
        assert!(delete_lane_delegate(&conn, &d).unwrap());
        assert!(list_lane_delegates(&conn, "s1").unwrap().is_empty());
    }
}
