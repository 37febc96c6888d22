/// Schema for cache namespaces and their entries.
pub const SCHEMA: &str = r#"
-- One row per namespace; created implicitly on first write
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    ready INTEGER NOT NULL DEFAULT 0,
    -- Increases with every committed precache
    promotion INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request digest within a namespace
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_url TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, request_hash),
    FOREIGN KEY (namespace) REFERENCES namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace);
"#;
