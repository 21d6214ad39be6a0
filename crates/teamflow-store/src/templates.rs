use crate::{Result, from_sql_ms, to_sql_ms};
use rusqlite::{Connection, OptionalExtension, Row, params};
use teamflow_core::model::{
    CompositeTemplate, ContentPatch, ProofConfig, StepContent, TemplateStep,
};

pub fn insert_template(conn: &Connection, template: &CompositeTemplate) -> Result<()> {
    conn.execute(
        "INSERT INTO templates (id, owner_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            template.id,
            template.owner_id,
            template.name,
            to_sql_ms(template.created_at_ms)
        ],
    )?;
    for step in &template.steps {
        conn.execute(
            "INSERT INTO template_steps
                (id, template_id, position, name, description, objective, instructions,
                 proof_required, proof_instructions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                step.id,
                template.id,
                step.position,
                step.content.name,
                step.content.description,
                step.content.objective,
                step.content.instructions,
                step.proof.required,
                step.proof.instructions,
            ],
        )?;
    }
    Ok(())
}

pub fn get_template(conn: &Connection, template_id: &str) -> Result<Option<CompositeTemplate>> {
    let header = conn
        .query_row(
            "SELECT id, owner_id, name, created_at FROM templates WHERE id = ?1",
            [template_id],
            |row| {
                Ok(CompositeTemplate {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    name: row.get(2)?,
                    created_at_ms: from_sql_ms(row.get(3)?),
                    steps: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut template) = header else {
        return Ok(None);
    };
    template.steps = list_template_steps(conn, template_id)?;
    Ok(Some(template))
}

fn template_step_from_row(row: &Row<'_>) -> rusqlite::Result<TemplateStep> {
    Ok(TemplateStep {
        id: row.get(0)?,
        template_id: row.get(1)?,
        position: row.get(2)?,
        content: StepContent {
            name: row.get(3)?,
            description: row.get(4)?,
            objective: row.get(5)?,
            instructions: row.get(6)?,
        },
        proof: ProofConfig {
            required: row.get(7)?,
            instructions: row.get(8)?,
        },
    })
}

const STEP_COLUMNS: &str = "id, template_id, position, name, description, objective, instructions,
     proof_required, proof_instructions";

pub fn list_template_steps(conn: &Connection, template_id: &str) -> Result<Vec<TemplateStep>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM template_steps WHERE template_id = ?1 ORDER BY position"
    ))?;
    let steps = stmt
        .query_map([template_id], template_step_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(steps)
}

pub fn get_template_step(conn: &Connection, step_id: &str) -> Result<Option<TemplateStep>> {
    let step = conn
        .query_row(
            &format!("SELECT {STEP_COLUMNS} FROM template_steps WHERE id = ?1"),
            [step_id],
            template_step_from_row,
        )
        .optional()?;
    Ok(step)
}

/// Write a content edit into the shared template step. Returns false if the
/// step does not exist.
pub fn update_template_step_content(
    conn: &Connection,
    step_id: &str,
    patch: &ContentPatch,
) -> Result<bool> {
    let Some(mut step) = get_template_step(conn, step_id)? else {
        return Ok(false);
    };
    patch.apply_to(&mut step.content);
    conn.execute(
        "UPDATE template_steps
            SET name = ?2, description = ?3, objective = ?4, instructions = ?5
          WHERE id = ?1",
        params![
            step_id,
            step.content.name,
            step.content.description,
            step.content.objective,
            step.content.instructions,
        ],
    )?;
    Ok(true)
}

/// Ids of every session launched from `template_id`.
pub fn sessions_using_template(conn: &Connection, template_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM sessions WHERE template_id = ?1")?;
    let ids = stmt
        .query_map([template_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}
