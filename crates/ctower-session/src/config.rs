use std::time::Duration;

use ctower_db::settings;
use ctower_vt::GeometryOptions;
use rusqlite::Connection;

pub const MIN_FONT_SIZE: u16 = 8;
pub const MAX_FONT_SIZE: u16 = 32;

/// Engine settings, read from the `settings` table with defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Prefer durable (tmux) sessions for fresh connects.
    pub use_tmux: bool,
    pub font_size: u16,
    pub line_height: f32,
    pub save_debounce: Duration,
    pub resize_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_tmux: true,
            font_size: 14,
            line_height: 1.2,
            save_debounce: Duration::from_millis(5000),
            resize_debounce: Duration::from_millis(150),
        }
    }
}

impl EngineConfig {
    pub fn load(conn: &Connection) -> rusqlite::Result<Self> {
        let defaults = Self::default();
        let font_size: i64 = settings::get_or(conn, "terminal_font_size", defaults.font_size.into())?;
        let line_height: f32 = settings::get_or(conn, "terminal_line_height", defaults.line_height)?;
        Ok(Self {
            use_tmux: settings::get_or(conn, "use_tmux", defaults.use_tmux)?,
            font_size: clamp_font_size(font_size),
            line_height: if line_height.is_finite() && line_height > 0.0 {
                line_height
            } else {
                defaults.line_height
            },
            save_debounce: Duration::from_millis(settings::get_or(
                conn,
                "terminal_save_debounce_ms",
                5000,
            )?),
            resize_debounce: Duration::from_millis(settings::get_or(
                conn,
                "terminal_resize_debounce_ms",
                150,
            )?),
        })
    }

    pub fn geometry(&self) -> GeometryOptions {
        GeometryOptions::new(self.font_size, self.line_height)
    }
}

/// Clamp a requested font size to the supported range.
pub fn clamp_font_size(size: i64) -> u16 {
    size.clamp(MIN_FONT_SIZE.into(), MAX_FONT_SIZE.into()) as u16
}
