use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::term::{Config, Term, TermDamage};
use alacritty_terminal::vte::ansi;

use crate::fit::TermSize;
use crate::screen::{Damage, ScreenView};

/// Lines of scrollback kept by every terminal.
pub const SCROLLBACK_LINES: usize = 10_000;

/// Collects replies the terminal owes the PTY, such as cursor position
/// reports. Everything else the terminal emits is ignored.
#[derive(Clone, Default)]
pub struct EventProxy {
    pty_writes: Arc<Mutex<Vec<String>>>,
}

impl EventProxy {
    fn writes(&self) -> MutexGuard<'_, Vec<String>> {
        self.pty_writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        if let Event::PtyWrite(data) = event {
            self.writes().push(data);
        }
    }
}

/// Dimensions helper for creating / resizing the terminal.
struct GridSize {
    columns: usize,
    screen_lines: usize,
}

impl From<TermSize> for GridSize {
    fn from(size: TermSize) -> Self {
        Self {
            columns: size.cols.max(1) as usize,
            screen_lines: size.rows.max(1) as usize,
        }
    }
}

impl Dimensions for GridSize {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

fn term_config() -> Config {
    Config {
        scrolling_history: SCROLLBACK_LINES,
        ..Config::default()
    }
}

/// The display engine behind one cached terminal instance.
///
/// Wraps `alacritty_terminal::Term` and a VTE parser. Bytes are applied in the
/// order `write` is called; nothing is reordered or coalesced.
pub struct VtTerminal {
    term: Term<EventProxy>,
    parser: ansi::Processor,
    event_proxy: EventProxy,
    size: TermSize,
    bytes_written: u64,
    /// Set by `refresh`, cleared by `reset_damage`.
    full_damage: bool,
}

impl VtTerminal {
    /// Create a new terminal with the given grid size.
    pub fn new(size: TermSize) -> Self {
        let event_proxy = EventProxy::default();
        let term = Term::new(term_config(), &GridSize::from(size), event_proxy.clone());

        Self {
            term,
            parser: ansi::Processor::new(),
            event_proxy,
            size,
            bytes_written: 0,
            full_damage: true,
        }
    }

    /// Feed raw PTY output bytes into the terminal.
    pub fn write(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.term, bytes);
        self.bytes_written += bytes.len() as u64;
    }

    /// Resize the grid. Returns `false` when the size did not change.
    pub fn resize(&mut self, size: TermSize) -> bool {
        if size == self.size {
            return false;
        }
        self.term.resize(GridSize::from(size));
        self.size = size;
        true
    }

    /// Current grid size.
    pub fn size(&self) -> TermSize {
        self.size
    }

    /// Clear the buffer, scrollback and parser state, keeping the grid size.
    pub fn reset(&mut self) {
        self.term = Term::new(
            term_config(),
            &GridSize::from(self.size),
            self.event_proxy.clone(),
        );
        self.parser = ansi::Processor::new();
        self.event_proxy.writes().clear();
        self.bytes_written = 0;
        self.full_damage = true;
    }

    /// Mark every row dirty so the next frame repaints the whole screen.
    pub fn refresh(&mut self) {
        self.full_damage = true;
    }

    /// Total bytes applied since creation or the last reset.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Get a read-only view of the terminal buffer.
    pub fn screen(&self) -> ScreenView<'_> {
        ScreenView::new(&self.term)
    }

    /// Whole buffer (scrollback included) as text.
    pub fn text(&self) -> String {
        self.screen().text()
    }

    /// What needs repainting since the last `reset_damage`.
    pub fn damage(&mut self) -> Damage {
        if self.full_damage {
            return Damage::Full;
        }
        match self.term.damage() {
            TermDamage::Full => Damage::Full,
            TermDamage::Partial(rows) => Damage::Rows(rows.map(|d| d.line as u16).collect()),
        }
    }

    /// Call once a frame has been painted.
    pub fn reset_damage(&mut self) {
        self.full_damage = false;
        self.term.reset_damage();
    }

    /// Drain write-back data (e.g. device status responses) owed to the PTY.
    pub fn take_pty_writes(&mut self) -> Vec<String> {
        std::mem::take(&mut *self.event_proxy.writes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(cols: u16, rows: u16) -> VtTerminal {
        VtTerminal::new(TermSize::new(cols, rows))
    }

    #[test]
    fn test_create_terminal_dimensions() {
        let term = term(80, 24);
        let screen = term.screen();
        assert_eq!(screen.cols(), 80);
        assert_eq!(screen.rows(), 24);
        assert_eq!(term.text(), "");
    }

    #[test]
    fn test_write_hello() {
        let mut term = term(80, 24);
        term.write(b"hello");
        assert_eq!(term.screen().row_text(0), "hello");
        assert_eq!(term.bytes_written(), 5);
    }

    #[test]
    fn test_chunks_applied_in_order() {
        let mut term = term(80, 24);
        term.write(b"a");
        term.write(b"b");
        term.write(b"c");
        assert_eq!(term.text(), "abc");
    }

    #[test]
    fn test_escape_sequence_split_across_chunks() {
        let mut term = term(80, 24);
        term.write(b"x\x1b[");
        term.write(b"31my");
        assert_eq!(term.text(), "xy");
    }

    #[test]
    fn test_multiline_text() {
        let mut term = term(80, 24);
        term.write(b"one\r\ntwo\r\n");
        assert_eq!(term.text(), "one\ntwo");
    }

    #[test]
    fn test_scrollback_survives_in_text() {
        let mut term = term(20, 3);
        for i in 0..6 {
            term.write(format!("line{i}\r\n").as_bytes());
        }
        assert!(term.screen().history_len() > 0);
        let text = term.text();
        assert!(text.starts_with("line0"), "got: {text}");
        assert!(text.contains("line5"));
    }

    #[test]
    fn test_resize_terminal() {
        let mut term = term(80, 24);
        assert!(term.resize(TermSize::new(120, 40)));
        assert!(!term.resize(TermSize::new(120, 40)));
        assert_eq!(term.screen().cols(), 120);
        assert_eq!(term.screen().rows(), 40);
        assert_eq!(term.size(), TermSize::new(120, 40));
    }

    #[test]
    fn test_reset_clears_buffer() {
        let mut term = term(80, 24);
        term.write(b"stale output\x1b[6n");
        term.reset();
        assert_eq!(term.text(), "");
        assert!(term.take_pty_writes().is_empty());
        assert_eq!(term.bytes_written(), 0);
        assert_eq!(term.size(), TermSize::new(80, 24));
    }

    #[test]
    fn test_damage_lists_changed_rows() {
        let mut term = term(80, 24);
        term.refresh();
        term.reset_damage();
        term.write(b"\r\nsecond");
        match term.damage() {
            Damage::Rows(rows) => assert!(rows.contains(&1)),
            Damage::Full => panic!("expected partial damage"),
        }
    }

    #[test]
    fn test_refresh_forces_full_damage() {
        let mut term = term(80, 24);
        let _ = term.damage();
        term.reset_damage();
        term.write(b"x");
        assert!(matches!(term.damage(), Damage::Rows(_)));

        term.refresh();
        assert_eq!(term.damage(), Damage::Full);
        // Still full until the frame is painted.
        term.write(b"y");
        assert_eq!(term.damage(), Damage::Full);

        term.reset_damage();
        assert!(matches!(term.damage(), Damage::Rows(_)));
    }

    #[test]
    fn test_device_status_response() {
        let mut term = term(80, 24);
        term.write(b"\x1b[6n");
        let writes = term.take_pty_writes();
        assert!(!writes.is_empty(), "Expected a device status response");
        assert!(writes[0].starts_with("\x1b["));
    }
}
