use alacritty_terminal::grid::{Dimensions, Row};
use alacritty_terminal::index::{Column, Line};
use alacritty_terminal::term::cell::{Cell, Flags};
use alacritty_terminal::term::Term;

use crate::terminal::EventProxy;

/// A read-only view into the terminal buffer.
pub struct ScreenView<'a> {
    term: &'a Term<EventProxy>,
}

impl<'a> ScreenView<'a> {
    pub(crate) fn new(term: &'a Term<EventProxy>) -> Self {
        Self { term }
    }

    /// Number of visible rows.
    pub fn rows(&self) -> u16 {
        self.term.screen_lines() as u16
    }

    /// Number of columns.
    pub fn cols(&self) -> u16 {
        self.term.columns() as u16
    }

    /// Number of lines that have scrolled off the top of the screen.
    pub fn history_len(&self) -> usize {
        self.term.grid().history_size()
    }

    /// Text of a visible row with trailing blanks removed.
    ///
    /// Row 0 is the top of the visible screen.
    pub fn row_text(&self, row: u16) -> String {
        if (row as usize) >= self.term.screen_lines() {
            return String::new();
        }
        row_to_string(&self.term.grid()[Line(row as i32)], self.term.columns())
    }

    /// All buffer lines, scrollback first, with trailing empty lines dropped.
    pub fn lines(&self) -> Vec<String> {
        let grid = self.term.grid();
        let columns = self.term.columns();
        let top = grid.topmost_line().0;
        let bottom = grid.bottommost_line().0;

        let mut lines: Vec<String> = (top..=bottom)
            .map(|line| row_to_string(&grid[Line(line)], columns))
            .collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }

    /// The whole buffer as newline-separated text.
    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

fn row_to_string(row: &Row<Cell>, columns: usize) -> String {
    let mut text = String::with_capacity(columns);
    for col in 0..columns {
        let cell = &row[Column(col)];
        if cell
            .flags
            .intersects(Flags::WIDE_CHAR_SPACER | Flags::LEADING_WIDE_CHAR_SPACER)
        {
            continue;
        }
        text.push(cell.c);
    }
    text.truncate(text.trim_end().len());
    text
}

/// What changed since damage was last reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Damage {
    /// Repaint everything.
    Full,
    /// Visible rows that changed, top to bottom.
    Rows(Vec<u16>),
}
