use crate::db::init_recordings_db_for_testing;
use anyhow::Result;
use rusqlite::{params, Connection};
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test logging in a thread-safe way.
/// This function ensures that logging is initialized only once across all tests,
/// even when multiple test files are running in parallel.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        // Another harness may already have installed one.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// In-memory database with the recordings schema.
pub fn test_connection() -> Connection {
    let conn = Connection::open_in_memory()
        .expect("Failed to create in-memory database");
    init_recordings_db_for_testing(&conn)
        .expect("Failed to initialize recordings schema");
    conn
}

/// One recording plus the rows it references, keyed by display name.
#[derive(Debug, Clone)]
pub struct SeedRecording<'a> {
    pub id: &'a str,
    pub org: &'a str,
    pub student: &'a str,
    pub activity: &'a str,
    pub topic: Option<&'a str>,
    pub url: Option<&'a str>,
    pub status: &'a str,
    pub duration: Option<f64>,
    pub created_at: &'a str,
    pub report: Option<&'a str>,
}

impl Default for SeedRecording<'_> {
    fn default() -> Self {
        Self {
            id: "rec-1",
            org: "Acme",
            student: "Student",
            activity: "Activity",
            topic: None,
            url: None,
            status: "READY",
            duration: None,
            created_at: "2024-01-01T00:00:00Z",
            report: None,
        }
    }
}

pub fn seed_recording(conn: &Connection, seed: &SeedRecording) -> Result<()> {
    let org_id = format!("org-{}", seed.org);
    let student_id = format!("user-{}", seed.student);
    let activity_id = format!("activity-{}", seed.activity);

    conn.execute(
        "INSERT OR IGNORE INTO organizations (id, name) VALUES (?, ?)",
        params![org_id, seed.org],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO users (id, name) VALUES (?, ?)",
        params![student_id, seed.student],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO activities (id, title) VALUES (?, ?)",
        params![activity_id, seed.activity],
    )?;
    if let Some(topic) = seed.topic {
        let topic_id = format!("topic-{}", topic);
        conn.execute(
            "INSERT OR IGNORE INTO topics (id, name) VALUES (?, ?)",
            params![topic_id, topic],
        )?;
        conn.execute(
            r#"INSERT OR IGNORE INTO topic_activities ("activityId", "topicId")
               VALUES (?, ?)"#,
            params![activity_id, topic_id],
        )?;
    }

    conn.execute(
        r#"INSERT INTO conversation_recordings (
            id, "audioFileUrl", status, duration, "createdAt",
            "organizationId", "studentId", "activityId", "feedbackReport"
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        params![
            seed.id,
            seed.url,
            seed.status,
            seed.duration,
            seed.created_at,
            org_id,
            student_id,
            activity_id,
            seed.report,
        ],
    )?;
    Ok(())
}

/// Stored duration of one recording.
pub fn stored_duration(conn: &Connection, id: &str) -> Result<Option<f64>> {
    Ok(conn.query_row(
        "SELECT duration FROM conversation_recordings WHERE id = ?",
        params![id],
        |row| row.get(0),
    )?)
}
