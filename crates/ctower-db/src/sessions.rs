//! Persisted terminal tabs, restored at startup.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// One saved terminal tab. The table is always rewritten as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub project_id: String,
    pub tab_name: String,
    pub tab_type: String,
    pub working_directory: String,
    pub sort_order: i64,
    /// tmux session backing the tab, if any.
    pub durable_session: Option<String>,
}

/// Replace every saved session with `records` in one transaction.
pub fn replace_all(conn: &mut Connection, records: &[SessionRecord]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM terminal_sessions", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO terminal_sessions \
             (project_id, tab_name, tab_type, working_directory, sort_order, durable_session) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for record in records {
            stmt.execute(params![
                record.project_id,
                record.tab_name,
                record.tab_type,
                record.working_directory,
                record.sort_order,
                record.durable_session,
            ])?;
        }
    }
    tx.commit()?;
    Ok(records.len())
}

/// All saved sessions in sort order.
pub fn list_all(conn: &Connection) -> rusqlite::Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, tab_name, tab_type, working_directory, sort_order, durable_session \
         FROM terminal_sessions ORDER BY sort_order ASC, id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(SessionRecord {
            project_id: row.get(0)?,
            tab_name: row.get(1)?,
            tab_type: row.get(2)?,
            working_directory: row.get(3)?,
            sort_order: row.get(4)?,
            durable_session: row.get(5)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(project: &str, name: &str, order: i64, durable: Option<&str>) -> SessionRecord {
        SessionRecord {
            project_id: project.to_string(),
            tab_name: name.to_string(),
            tab_type: "shell".to_string(),
            working_directory: format!("/work/{project}"),
            sort_order: order,
            durable_session: durable.map(str::to_string),
        }
    }

    #[test]
    fn test_replace_and_list_round_trip() {
        let mut conn = crate::open_in_memory().unwrap();
        let records = vec![
            record("p1", "Shell", 0, Some("ct-1234abcd")),
            record("p1", "Claude", 1, None),
            record("p2", "Shell", 2, Some("ct-deadbeef")),
        ];

        assert_eq!(replace_all(&mut conn, &records).unwrap(), 3);
        assert_eq!(list_all(&conn).unwrap(), records);
    }

    #[test]
    fn test_replace_overwrites_previous_rows() {
        let mut conn = crate::open_in_memory().unwrap();
        replace_all(&mut conn, &[record("p1", "Old", 0, None)]).unwrap();
        replace_all(&mut conn, &[record("p2", "New", 0, None)]).unwrap();

        let saved = list_all(&conn).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].tab_name, "New");

        replace_all(&mut conn, &[]).unwrap();
        assert!(list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_list_orders_by_sort_order() {
        let mut conn = crate::open_in_memory().unwrap();
        replace_all(
            &mut conn,
            &[record("p1", "B", 5, None), record("p1", "A", 1, None)],
        )
        .unwrap();
        let names: Vec<String> = list_all(&conn).unwrap().into_iter().map(|r| r.tab_name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_record_json_field_names() {
        let json = serde_json::to_value(record("p1", "Shell", 0, None)).unwrap();
        assert_eq!(json["project_id"], "p1");
        assert_eq!(json["tab_type"], "shell");
        assert!(json["durable_session"].is_null());
    }
}
