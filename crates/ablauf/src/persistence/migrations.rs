//! Ordered DDL migrations for the SQLite store
//!
//! Replaying the full list on an empty database produces the schema; every
//! statement is idempotent, so replaying on an up-to-date database is a
//! no-op. Stores are scoped by the `actor` column: the backend shares one
//! database file while each actor only ever touches its own rows.

pub const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workflow (
        actor TEXT NOT NULL PRIMARY KEY,
        id TEXT NOT NULL,
        workflow_type TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        result TEXT,
        error TEXT,
        paused INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS steps (
        actor TEXT NOT NULL,
        name TEXT NOT NULL,
        step_type TEXT NOT NULL,
        status TEXT NOT NULL,
        result TEXT,
        error TEXT,
        error_stack TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        wake_at INTEGER,
        started_at INTEGER,
        completed_at INTEGER,
        duration_ms INTEGER,
        retry_history TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (actor, name)
    )",
    "CREATE TABLE IF NOT EXISTS sse_messages (
        actor TEXT NOT NULL,
        seq INTEGER NOT NULL,
        event TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (actor, seq)
    )",
    "CREATE TABLE IF NOT EXISTS event_buffer (
        actor TEXT NOT NULL,
        event TEXT NOT NULL,
        payload TEXT NOT NULL,
        received_at INTEGER NOT NULL,
        PRIMARY KEY (actor, event)
    )",
    "CREATE TABLE IF NOT EXISTS instances (
        actor TEXT NOT NULL,
        id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (actor, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_steps_status_wake ON steps (actor, status, wake_at)",
    "CREATE INDEX IF NOT EXISTS idx_instances_status ON instances (actor, status, updated_at)",
];
