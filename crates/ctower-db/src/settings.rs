use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};

pub fn get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Read and parse a setting, falling back to `default` when it is missing or malformed.
pub fn get_or<T: FromStr>(conn: &Connection, key: &str, default: T) -> rusqlite::Result<T> {
    Ok(get(conn, key)?
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_overwrite() {
        let conn = crate::open_in_memory().unwrap();
        assert_eq!(get(&conn, "terminal_font_size").unwrap(), None);

        set(&conn, "terminal_font_size", "16").unwrap();
        set(&conn, "terminal_font_size", "18").unwrap();
        assert_eq!(
            get(&conn, "terminal_font_size").unwrap().as_deref(),
            Some("18")
        );
    }

    #[test]
    fn test_get_or_parses_and_falls_back() {
        let conn = crate::open_in_memory().unwrap();
        assert!(get_or(&conn, "use_tmux", true).unwrap());

        set(&conn, "use_tmux", "false").unwrap();
        assert!(!get_or(&conn, "use_tmux", true).unwrap());

        set(&conn, "terminal_line_height", "tall").unwrap();
        assert_eq!(get_or(&conn, "terminal_line_height", 1.2_f32).unwrap(), 1.2);

        set(&conn, "terminal_save_debounce_ms", " 2500 ").unwrap();
        assert_eq!(get_or(&conn, "terminal_save_debounce_ms", 5000_u64).unwrap(), 2500);
    }
}
