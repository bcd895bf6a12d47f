//! SQL migration definitions for the Linetag run database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: runs, batch_log",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per pipeline invocation
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    run_date    TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    status      TEXT NOT NULL DEFAULT 'running',
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_run_date ON runs(run_date);

-- Every attempt of every chunk of every pass
CREATE TABLE IF NOT EXISTS batch_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    pass        TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    attempt     INTEGER NOT NULL,
    outcome     TEXT NOT NULL,
    records     INTEGER NOT NULL,
    error_kind  TEXT,
    error       TEXT,
    duration_ms INTEGER NOT NULL,
    logged_at   TEXT NOT NULL,
    UNIQUE(run_id, pass, chunk_index, attempt)
);

CREATE INDEX IF NOT EXISTS idx_batch_log_run ON batch_log(run_id, pass);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
