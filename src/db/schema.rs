/// Schema for the cache generations and the pending request queue.
pub const SCHEMA: &str = r#"
-- One row per cache generation; at most one is 'active' after activation
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by the SHA-256 of "METHOD url"
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash)
);

-- Scan submissions waiting for replay; seq preserves enqueue order
CREATE TABLE IF NOT EXISTS pending_requests (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_requests_status ON pending_requests(status, seq);
"#;
