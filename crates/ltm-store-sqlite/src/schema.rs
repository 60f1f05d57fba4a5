//! SQL schema for the SQLite knowledge store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Identity envelopes. Never updated or deleted.
CREATE TABLE IF NOT EXISTS entities (
    entity_id   TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,     -- 'node' | 'event' | 'edge'
    label       TEXT NOT NULL,
    stable_key  TEXT UNIQUE,
    edge_source TEXT REFERENCES entities(entity_id),
    edge_target TEXT REFERENCES entities(entity_id),
    created_at  TEXT NOT NULL,
    CHECK ((kind = 'edge') = (edge_source IS NOT NULL AND edge_target IS NOT NULL))
);

-- Property version records are strictly append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS versions (
    version_id   TEXT PRIMARY KEY,
    entity_id    TEXT NOT NULL REFERENCES entities(entity_id),
    property     TEXT NOT NULL,
    value_json   TEXT NOT NULL,
    valid_from   TEXT NOT NULL,    -- RFC 3339, fixed microsecond width
    valid_to     TEXT,             -- NULL = open
    tx_id        INTEGER NOT NULL,
    tx_timestamp TEXT NOT NULL,
    source_id    TEXT,
    confidence   REAL NOT NULL,
    metadata     TEXT NOT NULL DEFAULT '{}',
    derived_from TEXT REFERENCES versions(version_id),
    CHECK (valid_to IS NULL OR valid_to > valid_from)
);

-- Lifecycle entries against versions; append-only as well.
CREATE TABLE IF NOT EXISTS closures (
    closure_id   TEXT PRIMARY KEY,
    version_id   TEXT NOT NULL REFERENCES versions(version_id),
    kind         TEXT NOT NULL,    -- 'truncated' | 'replaced' | 'deleted'
    valid_to     TEXT,
    caused_by    TEXT,
    tx_id        INTEGER NOT NULL,
    tx_timestamp TEXT NOT NULL
);

-- Latest transaction per property, for compare-and-append. This is the
-- only table rows are ever rewritten in; it holds no facts.
CREATE TABLE IF NOT EXISTS heads (
    entity_id    TEXT NOT NULL REFERENCES entities(entity_id),
    property     TEXT NOT NULL,
    tx_id        INTEGER NOT NULL,
    tx_timestamp TEXT NOT NULL,
    PRIMARY KEY (entity_id, property)
);

CREATE TABLE IF NOT EXISTS idempotency (
    idem_key     TEXT PRIMARY KEY,
    fingerprint  TEXT NOT NULL,
    receipt_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS versions_key_valid_idx ON versions(entity_id, property, valid_from);
CREATE INDEX IF NOT EXISTS versions_key_tx_idx    ON versions(entity_id, property, tx_timestamp);
CREATE INDEX IF NOT EXISTS closures_version_idx   ON closures(version_id);
CREATE INDEX IF NOT EXISTS entities_label_idx     ON entities(label);
CREATE INDEX IF NOT EXISTS entities_source_idx    ON entities(edge_source);
CREATE INDEX IF NOT EXISTS entities_target_idx    ON entities(edge_target);
CREATE INDEX IF NOT EXISTS heads_tx_idx           ON heads(tx_id);

PRAGMA user_version = 1;
";
