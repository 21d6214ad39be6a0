use crate::{Result, from_sql_ms, to_sql_ms};
use rusqlite::{Connection, OptionalExtension, Row, params};
use teamflow_core::model::{ContentPatch, ProofState, SessionStep};

const STEP_COLUMNS: &str = "id, session_id, step_id, position, is_completed, completed_by,
     completed_at, proof_required, proof_instructions, proof_content, proof_file_ref,
     proof_file_name, proof_submitted_by, proof_submitted_at, name_override,
     description_override, objective_override, instructions_override";

fn session_step_from_row(row: &Row<'_>) -> rusqlite::Result<SessionStep> {
    Ok(SessionStep {
        id: row.get(0)?,
        session_id: row.get(1)?,
        step_id: row.get(2)?,
        position: row.get(3)?,
        is_completed: row.get(4)?,
        completed_by: row.get(5)?,
        completed_at_ms: row.get::<_, Option<i64>>(6)?.map(from_sql_ms),
        proof: ProofState {
            required: row.get(7)?,
            instructions: row.get(8)?,
            content: row.get(9)?,
            file_ref: row.get(10)?,
            file_name: row.get(11)?,
            submitted_by: row.get(12)?,
            submitted_at_ms: row.get::<_, Option<i64>>(13)?.map(from_sql_ms),
        },
        overrides: ContentPatch {
            name: row.get(14)?,
            description: row.get(15)?,
            objective: row.get(16)?,
            instructions: row.get(17)?,
        },
    })
}

/// Seed a session step. Called once per template step at session creation.
pub fn insert_session_step(conn: &Connection, step: &SessionStep) -> Result<()> {
    conn.execute(
        "INSERT INTO session_steps
            (id, session_id, step_id, position, is_completed, proof_required, proof_instructions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            step.id,
            step.session_id,
            step.step_id,
            step.position,
            step.is_completed,
            step.proof.required,
            step.proof.instructions,
        ],
    )?;
    Ok(())
}

pub fn list_session_steps(conn: &Connection, session_id: &str) -> Result<Vec<SessionStep>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM session_steps WHERE session_id = ?1 ORDER BY position"
    ))?;
    let steps = stmt
        .query_map([session_id], session_step_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(steps)
}

pub fn get_session_step(conn: &Connection, session_step_id: &str) -> Result<Option<SessionStep>> {
    let step = conn
        .query_row(
            &format!("SELECT {STEP_COLUMNS} FROM session_steps WHERE id = ?1"),
            [session_step_id],
            session_step_from_row,
        )
        .optional()?;
    Ok(step)
}

/// Session id owning a session step, without loading the row.
pub fn session_of_step(conn: &Connection, session_step_id: &str) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT session_id FROM session_steps WHERE id = ?1",
            [session_step_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Mark a step completed if it is not already.
///
/// Returns false when another writer completed it first; the caller treats
/// that as a lost race.
pub fn mark_completed(
    conn: &Connection,
    session_step_id: &str,
    user_id: &str,
    at_ms: u64,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE session_steps SET is_completed = 1, completed_by = ?2, completed_at = ?3
          WHERE id = ?1 AND is_completed = 0",
        params![session_step_id, user_id, to_sql_ms(at_ms)],
    )?;
    Ok(n == 1)
}

/// Overwrite every proof column of a step.
pub fn update_proof(conn: &Connection, session_step_id: &str, proof: &ProofState) -> Result<bool> {
    let n = conn.execute(
        "UPDATE session_steps
            SET proof_required = ?2, proof_instructions = ?3, proof_content = ?4,
                proof_file_ref = ?5, proof_file_name = ?6, proof_submitted_by = ?7,
                proof_submitted_at = ?8
          WHERE id = ?1",
        params![
            session_step_id,
            proof.required,
            proof.instructions,
            proof.content,
            proof.file_ref,
            proof.file_name,
            proof.submitted_by,
            proof.submitted_at_ms.map(to_sql_ms),
        ],
    )?;
    Ok(n > 0)
}

/// Overwrite the session-local content overrides of a step.
pub fn update_overrides(
    conn: &Connection,
    session_step_id: &str,
    overrides: &ContentPatch,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE session_steps
            SET name_override = ?2, description_override = ?3,
                objective_override = ?4, instructions_override = ?5
          WHERE id = ?1",
        params![
            session_step_id,
            overrides.name,
            overrides.description,
            overrides.objective,
            overrides.instructions,
        ],
    )?;
    Ok(n > 0)
}

/// Blob references held by a session's proofs.
pub fn proof_file_refs(conn: &Connection, session_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT proof_file_ref FROM session_steps
          WHERE session_id = ?1 AND proof_file_ref IS NOT NULL",
    )?;
    let refs = stmt
        .query_map([session_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(refs)
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
        for (i, step_id) in ["a", "b"].iter().enumerate() {
            insert_session_step(
                &conn,
                &SessionStep {
                    id: format!("ss-{step_id}"),
                    session_id: "s1".into(),
                    step_id: step_id.to_string(),
                    position: i as u32,
                    is_completed: false,
                    completed_by: None,
                    completed_at_ms: None,
                    proof: ProofState {
                        required: *step_id == "b",
                        ..ProofState::default()
                    },
                    overrides: ContentPatch::default(),
                },
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn completion_is_conditional() {
        let conn = setup();
        assert!(mark_completed(&conn, "ss-a", "alice", 10).unwrap());
        assert!(!mark_completed(&conn, "ss-a", "carol", 11).unwrap());

        let step = get_session_step(&conn, "ss-a").unwrap().unwrap();
        assert!(step.is_completed);
        assert_eq!(step.completed_by.as_deref(), Some("alice"));
        assert_eq!(step.completed_at_ms, Some(10));
    }

    #[test]
    fn proof_round_trip() {
        let conn = setup();
        let mut step = get_session_step(&conn, "ss-b").unwrap().unwrap();
        assert!(step.proof.required);
        assert!(!step.proof.is_satisfied());

        step.proof.file_ref = Some("blob-1".into());
        step.proof.file_name = Some("log.txt".into());
        step.proof.submitted_by = Some("bob".into());
        step.proof.submitted_at_ms = Some(42);
        assert!(update_proof(&conn, "ss-b", &step.proof).unwrap());

        let step = get_session_step(&conn, "ss-b").unwrap().unwrap();
        assert!(step.proof.is_satisfied());
        assert_eq!(step.proof.submitted_at_ms, Some(42));
        assert_eq!(proof_file_refs(&conn, "s1").unwrap(), vec!["blob-1"]);
    }

    #[test]
    fn overrides_round_trip() {
        let conn = setup();
        let overrides = ContentPatch {
            objective: Some("only this session".into()),
            ..ContentPatch::default()
        };
        assert!(update_overrides(&conn, "ss-a", &overrides).unwrap());
        let steps = list_session_steps(&conn, "s1").unwrap();
        assert_eq!(steps[0].overrides, overrides);
        assert!(steps[1].overrides.is_empty());
        assert_eq!(session_of_step(&conn, "ss-b").unwrap().as_deref(), Some("s1"));
    }
}
