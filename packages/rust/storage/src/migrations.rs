//! SQL migration definitions for the entity graph database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

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
        description: "Initial schema: transactions, entities, involvements, associations",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One node per assessed transaction
CREATE TABLE IF NOT EXISTS transactions (
    id               TEXT PRIMARY KEY,
    recorded_at      TEXT NOT NULL,
    risk_score       REAL NOT NULL,
    confidence_score REAL NOT NULL,
    reason           TEXT NOT NULL DEFAULT ''
);

-- Organizations and people, merged across transactions by normalized key
CREATE TABLE IF NOT EXISTS entities (
    kind         TEXT NOT NULL,
    key          TEXT NOT NULL,
    name         TEXT NOT NULL,
    entity_type  TEXT,
    region       TEXT,
    first_seen   TEXT NOT NULL,
    last_seen    TEXT NOT NULL,
    PRIMARY KEY (kind, key)
);

-- INVOLVED_IN edges: entity -> transaction
CREATE TABLE IF NOT EXISTS involvements (
    transaction_id TEXT NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
    kind           TEXT NOT NULL,
    key            TEXT NOT NULL,
    role           TEXT NOT NULL,
    PRIMARY KEY (transaction_id, kind, key, role)
);

CREATE INDEX IF NOT EXISTS idx_involvements_entity ON involvements(kind, key);

-- ASSOCIATED_WITH edges: person -> organization
CREATE TABLE IF NOT EXISTS associations (
    person_key TEXT NOT NULL,
    org_key    TEXT NOT NULL,
    role       TEXT NOT NULL,
    since      TEXT NOT NULL,
    PRIMARY KEY (person_key, org_key, role)
);

CREATE INDEX IF NOT EXISTS idx_associations_org ON associations(org_key);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
