use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;
use tracing::{info, instrument};

/// Local development database.
pub const DEFAULT_DATABASE_URL: &str = "data/recordings.db";

/// Strips an optional `sqlite://` / `sqlite:` scheme from a database URL.
pub fn database_path(database_url: &str) -> &str {
    database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url)
}

fn open_flags(read_only: bool) -> OpenFlags {
    // Never SQLITE_OPEN_CREATE: a missing database is a connection failure.
    let access = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
    };
    access | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

fn check_recordings_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.prepare("SELECT id FROM conversation_recordings LIMIT 1")?;
    Ok(())
}

/// Opens a single connection, failing if the database is absent or does not
/// hold recordings.
#[instrument(err)]
pub fn open_database(database_url: &str, read_only: bool) -> Result<Connection> {
    let path = database_path(database_url);
    let conn = Connection::open_with_flags(path, open_flags(read_only))
        .with_context(|| format!("Could not open database at {}", path))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    check_recordings_table(&conn).with_context(|| {
        format!("{} does not look like a recordings database", path)
    })?;
    info!("Connected to database {}", path);
    Ok(conn)
}

#[derive(Debug)]
struct RecordingsCheck;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for RecordingsCheck {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(5))?;
        check_recordings_table(conn)
    }
}

/// Connection pool for the browsing server.
#[instrument(err)]
pub fn create_pool(
    database_url: &str,
    read_only: bool,
) -> Result<Pool<SqliteConnectionManager>> {
    let path = database_path(database_url);
    let manager =
        SqliteConnectionManager::file(path).with_flags(open_flags(read_only));
    let pool = Pool::builder()
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(RecordingsCheck))
        .build(manager)
        .with_context(|| format!("Could not connect to database at {}", path))?;
    Ok(pool)
}

/// Creates the tables the browser and the batch jobs read, for tests and
/// local development databases.
pub fn init_recordings_db_for_testing(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activities (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS topics (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS topic_activities (
            "activityId" TEXT NOT NULL REFERENCES activities(id),
            "topicId" TEXT NOT NULL REFERENCES topics(id),
            PRIMARY KEY ("activityId", "topicId")
        );

        CREATE TABLE IF NOT EXISTS conversation_recordings (
            id TEXT PRIMARY KEY,
            "audioFileUrl" TEXT,
            status TEXT NOT NULL,
            duration REAL,
            "createdAt" TEXT NOT NULL,
            "organizationId" TEXT NOT NULL REFERENCES organizations(id),
            "studentId" TEXT NOT NULL REFERENCES users(id),
            "activityId" TEXT NOT NULL REFERENCES activities(id),
            "feedbackReport" TEXT
        );
        "#,
    )?;
    Ok(())
}
