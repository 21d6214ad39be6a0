use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    id              TEXT PRIMARY KEY NOT NULL,
    owner_id        TEXT NOT NULL,
    name            TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS template_steps (
    id                  TEXT PRIMARY KEY NOT NULL,
    template_id         TEXT NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
    position            INTEGER NOT NULL,
    name                TEXT NOT NULL,
    description         TEXT NOT NULL DEFAULT '',
    objective           TEXT NOT NULL DEFAULT '',
    instructions        TEXT NOT NULL DEFAULT '',
    proof_required      INTEGER NOT NULL DEFAULT 0,
    proof_instructions  TEXT
);
CREATE INDEX IF NOT EXISTS idx_template_steps_template ON template_steps(template_id, position);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY NOT NULL,
    template_id     TEXT NOT NULL REFERENCES templates(id),
    owner_id        TEXT NOT NULL,
    name            TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_template ON sessions(template_id);

CREATE TABLE IF NOT EXISTS members (
    session_id              TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    user_id                 TEXT NOT NULL,
    can_edit_steps          INTEGER NOT NULL DEFAULT 0,
    can_manage_assignments  INTEGER NOT NULL DEFAULT 0,
    can_manage_sharing      INTEGER NOT NULL DEFAULT 0,
    can_edit_intel          INTEGER NOT NULL DEFAULT 0,
    can_edit_proof          INTEGER NOT NULL DEFAULT 0,
    can_chat                INTEGER NOT NULL DEFAULT 0,
    allow_lane_delegation   INTEGER NOT NULL DEFAULT 0,
    lane_color              TEXT,
    added_at                INTEGER NOT NULL,
    PRIMARY KEY (session_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id);

CREATE TABLE IF NOT EXISTS assignments (
    id                              TEXT PRIMARY KEY NOT NULL,
    session_id                      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    step_id                         TEXT NOT NULL,
    assignee_user_id                TEXT NOT NULL,
    allow_delegation                INTEGER NOT NULL DEFAULT 0,
    allow_delegation_to_everyone    INTEGER NOT NULL DEFAULT 0,
    created_at                      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assignments_session ON assignments(session_id, step_id);

CREATE TABLE IF NOT EXISTS assignment_delegates (
    assignment_id       TEXT NOT NULL REFERENCES assignments(id) ON DELETE CASCADE,
    delegate_user_id    TEXT NOT NULL,
    PRIMARY KEY (assignment_id, delegate_user_id)
);

CREATE TABLE IF NOT EXISTS lane_delegates (
    session_id          TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    owner_user_id       TEXT NOT NULL,
    delegate_user_id    TEXT NOT NULL,
    PRIMARY KEY (session_id, owner_user_id, delegate_user_id)
);

CREATE TABLE IF NOT EXISTS session_steps (
    id                      TEXT PRIMARY KEY NOT NULL,
    session_id              TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    step_id                 TEXT NOT NULL,
    position                INTEGER NOT NULL,
    is_completed            INTEGER NOT NULL DEFAULT 0,
    completed_by            TEXT,
    completed_at            INTEGER,
    proof_required          INTEGER NOT NULL DEFAULT 0,
    proof_instructions      TEXT,
    proof_content           TEXT,
    proof_file_ref          TEXT,
    proof_file_name         TEXT,
    proof_submitted_by      TEXT,
    proof_submitted_at      INTEGER,
    name_override           TEXT,
    description_override    TEXT,
    objective_override      TEXT,
    instructions_override   TEXT,
    UNIQUE (session_id, step_id)
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    author_user_id  TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_session ON chat_messages(session_id, created_at);

CREATE TABLE IF NOT EXISTS message_reads (
    message_id  TEXT NOT NULL REFERENCES chat_messages(id) ON DELETE CASCADE,
    user_id     TEXT NOT NULL,
    read_at     INTEGER NOT NULL,
    PRIMARY KEY (message_id, user_id)
);
";

pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
