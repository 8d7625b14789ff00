//! Database operations for solution history

use std::path::Path;

use rusqlite::{params, Connection};

use crate::models::HistoryEntry;
use crate::paths::get_db_path;

/// Initializes the SQLite database, creating tables if needed
pub fn init_database() -> Result<Connection, String> {
    let db_path = get_db_path()?;
    init_database_at(&db_path)
}

pub fn init_database_at(db_path: &Path) -> Result<Connection, String> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(db_path).map_err(|e| format!("Failed to open database: {}", e))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS solve_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            kind TEXT NOT NULL,
            problem_statement TEXT NOT NULL,
            solution_json TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create table: {}", e))?;

    // Migration: add language column if it doesn't exist (for existing databases)
    let _ = conn.execute(
        "ALTER TABLE solve_history ADD COLUMN language TEXT DEFAULT 'python'",
        [],
    ); // Ignore error if column already exists

    Ok(conn)
}

/// Stores a completed pipeline run
pub fn store_history_entry(
    timestamp: &str,
    kind: &str,
    language: &str,
    problem_statement: &str,
    solution_json: &str,
) -> Result<(), String> {
    let conn = init_database()?;
    store_history_entry_with(&conn, timestamp, kind, language, problem_statement, solution_json)
}

pub fn store_history_entry_with(
    conn: &Connection,
    timestamp: &str,
    kind: &str,
    language: &str,
    problem_statement: &str,
    solution_json: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO solve_history (timestamp, kind, language, problem_statement, solution_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![timestamp, kind, language, problem_statement, solution_json],
    )
    .map_err(|e| format!("Failed to store history entry: {}", e))?;
    Ok(())
}

/// Retrieves recent history in chronological order
pub fn get_history_internal(limit: i64) -> Result<Vec<HistoryEntry>, String> {
    let conn = init_database()?;
    get_history_with(&conn, limit)
}

pub fn get_history_with(conn: &Connection, limit: i64) -> Result<Vec<HistoryEntry>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, timestamp, kind, COALESCE(language, 'python'), problem_statement, solution_json
             FROM solve_history ORDER BY id DESC LIMIT ?1",
        )
        .map_err(|e| format!("Failed to prepare query: {}", e))?;

    let entries = stmt
        .query_map(params![limit], |row| {
            Ok(HistoryEntry {
                id: Some(row.get(0)?),
                timestamp: row.get(1)?,
                kind: row.get(2)?,
                language: row.get(3)?,
                problem_statement: row.get(4)?,
                solution_json: row.get(5)?,
            })
        })
        .map_err(|e| format!("Failed to query: {}", e))?;

    let mut result: Vec<HistoryEntry> = entries.filter_map(|e| e.ok()).collect();

    // Reverse to get chronological order
    result.reverse();
    Ok(result)
}

/// Clears all stored history
pub fn clear_history_internal() -> Result<(), String> {
    let conn = init_database()?;
    conn.execute("DELETE FROM solve_history", [])
        .map_err(|e| format!("Failed to clear history: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stores_and_reads_entries_in_chronological_order() {
        let dir = tempdir().unwrap();
        let conn = init_database_at(&dir.path().join("history.db")).unwrap();

        store_history_entry_with(&conn, "2026-01-01T00:00:00Z", "solve", "python", "p1", "{}")
            .unwrap();
        store_history_entry_with(&conn, "2026-01-02T00:00:00Z", "debug", "rust", "p2", "{}")
            .unwrap();

        let entries = get_history_with(&conn, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].problem_statement, "p1");
        assert_eq!(entries[1].kind, "debug");
        assert_eq!(entries[1].language, "rust");
    }

    #[test]
    fn limit_keeps_only_the_most_recent_entries() {
        let dir = tempdir().unwrap();
        let conn = init_database_at(&dir.path().join("history.db")).unwrap();

        store_history_entry_with(&conn, "t1", "solve", "python", "first", "{}").unwrap();
        store_history_entry_with(&conn, "t2", "solve", "python", "second", "{}").unwrap();
        store_history_entry_with(&conn, "t3", "debug", "python", "fix", "{}").unwrap();

        let entries = get_history_with(&conn, 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].problem_statement, "fix");
    }
}
