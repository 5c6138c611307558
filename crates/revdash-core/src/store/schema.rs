//! SQLite schema for the record store.
//!
//! - `records` holds every persisted entity as a JSON body keyed by
//!   `(kind, key)`, including scalar `Meta` values (checkpoints, counters,
//!   leases, cached credentials)
//! - `tasks` is the persisted work queue behind the cron and scan dispatchers
//! - `store_meta` records the schema version for inspection tools

/// Migration v1: records, tasks and store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
    kind TEXT NOT NULL CHECK (length(kind) > 0),
    key TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL,
    updated_at_us INTEGER NOT NULL,
    PRIMARY KEY (kind, key)
);

CREATE TABLE IF NOT EXISTS tasks (
    name TEXT PRIMARY KEY,
    func TEXT NOT NULL,
    args_json TEXT NOT NULL DEFAULT 'null',
    attempts INTEGER NOT NULL DEFAULT 0,
    not_before_us INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (1, 0);

CREATE INDEX IF NOT EXISTS idx_tasks_due
    ON tasks(not_before_us, name);
";

/// Migration v2: version sweep index.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_kind_version
    ON records(kind, version);
";

pub const REQUIRED_INDEXES: &[&str] = &["idx_tasks_due", "idx_records_kind_version"];
