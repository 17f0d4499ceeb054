//! ctower-vt: Terminal emulation engine for Control Tower.
//!
//! Provides a small Rust API over `alacritty_terminal`: feed PTY output in,
//! read the buffer back out as text, and compute how many cells fit into a
//! pixel-sized container. Glyph rendering is left to the view layer.

pub mod fit;
pub mod screen;
pub mod terminal;

pub use fit::{fit, ContainerSize, GeometryOptions, TermSize};
pub use screen::{Damage, ScreenView};
pub use terminal::VtTerminal;
