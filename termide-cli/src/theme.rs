use ratatui::style::{Color, Modifier, Style};

// ── Background ─────────────────────────────────────────────────────
pub const FORM: Color = Color::Rgb(14, 13, 11);
pub const FORM_RAISED: Color = Color::Rgb(20, 20, 18);

// ── Greys ──────────────────────────────────────────────────────────
pub const ASH: Color = Color::Rgb(42, 42, 40);
pub const ASH_MID: Color = Color::Rgb(74, 74, 68);
pub const ASH_TEXT: Color = Color::Rgb(90, 90, 80);

// ── Text ───────────────────────────────────────────────────────────
pub const CHALK_DIM: Color = Color::Rgb(122, 122, 112);
pub const CHALK_MID: Color = Color::Rgb(200, 196, 184);
pub const CHALK: Color = Color::Rgb(232, 228, 208);

// ── Accents ────────────────────────────────────────────────────────
pub const SODIUM: Color = Color::Rgb(232, 163, 60);
pub const LICHEN: Color = Color::Rgb(138, 158, 108);
pub const ERROR: Color = Color::Rgb(204, 68, 68);

pub const PROMPT_CHAR: &str = "❯";
pub const STATUS_SEP: &str = " · ";
pub const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

pub fn prompt() -> Style {
    Style::default().fg(SODIUM).add_modifier(Modifier::BOLD)
}

pub fn user_input() -> Style {
    Style::default().fg(CHALK_MID)
}

pub fn assistant_text() -> Style {
    Style::default().fg(CHALK)
}

/// Help output, search listings, apply confirmations
pub fn system_message() -> Style {
    Style::default().fg(ASH_TEXT)
}

pub fn error() -> Style {
    Style::default().fg(ERROR)
}

/// Tool call and handoff lines
pub fn tool_line() -> Style {
    Style::default().fg(ASH_MID)
}

pub fn code_chrome() -> Style {
    Style::default().fg(ASH)
}

// ── Diff ───────────────────────────────────────────────────────────

pub fn diff_added() -> Style {
    Style::default().fg(LICHEN)
}

pub fn diff_removed() -> Style {
    Style::default().fg(ERROR)
}

/// `@@` hunk headers and `---`/`+++` file headers
pub fn diff_header() -> Style {
    Style::default().fg(SODIUM)
}

pub fn diff_context() -> Style {
    Style::default().fg(CHALK_DIM)
}

/// Style for one line of unified diff output.
pub fn diff_line(line: &str) -> Style {
    if line.starts_with("+++") || line.starts_with("---") || line.starts_with("@@") {
        diff_header()
    } else if line.starts_with('+') {
        diff_added()
    } else if line.starts_with('-') {
        diff_removed()
    } else {
        diff_context()
    }
}

// ── Chrome ─────────────────────────────────────────────────────────

pub fn help_key() -> Style {
    Style::default().fg(SODIUM).add_modifier(Modifier::BOLD)
}

pub fn help_desc() -> Style {
    Style::default().fg(ASH_MID)
}

pub fn input_border() -> Style {
    Style::default().fg(ASH)
}

pub fn modal_border() -> Style {
    Style::default().fg(SODIUM)
}

pub fn spinner() -> Style {
    Style::default().fg(SODIUM)
}

pub fn app_title() -> Style {
    Style::default().fg(SODIUM).add_modifier(Modifier::BOLD)
}

pub fn status_value() -> Style {
    Style::default().fg(CHALK_DIM)
}

pub fn status_separator() -> Style {
    Style::default().fg(ASH_MID)
}

/// Request counter once usage passes 80% of the window
pub fn status_warning() -> Style {
    Style::default().fg(SODIUM)
}

pub fn bar_bg() -> Style {
    Style::default().bg(FORM_RAISED)
}

pub fn history_bg() -> Style {
    Style::default().bg(FORM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_line_styles() {
        assert_eq!(diff_line("+++ Modified"), diff_header());
        assert_eq!(diff_line("--- Original"), diff_header());
        assert_eq!(diff_line("@@ -1,2 +1,2 @@"), diff_header());
        assert_eq!(diff_line("+new"), diff_added());
        assert_eq!(diff_line("-old"), diff_removed());
        assert_eq!(diff_line(" same"), diff_context());
    }
}
