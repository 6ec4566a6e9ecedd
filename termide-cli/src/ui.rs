use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use unicode_width::UnicodeWidthStr;

use crate::app::{App, DisplayBlock};
use crate::theme;

pub fn draw(frame: &mut Frame, app: &App) {
    frame.render_widget(Block::default().style(theme::history_bg()), frame.area());

    let inner_w = frame.area().width.saturating_sub(2) as usize;
    let visual_lines = input_visual_lines(&app.input, inner_w);
    let queue_lines = app.message_queue.len() as u16;
    let input_h = (visual_lines as u16 + 2 + queue_lines).min(12);

    let chunks = Layout::vertical([
        Constraint::Length(1),       // status bar
        Constraint::Min(3),          // history
        Constraint::Length(input_h), // input
        Constraint::Length(1),       // help bar
    ])
    .split(frame.area());

    draw_status_bar(frame, app, chunks[0]);
    draw_history(frame, app, chunks[1]);
    draw_input(frame, app, chunks[2]);
    draw_help_bar(frame, app, chunks[3]);
    draw_review(frame, app, chunks[1]);
}

/// Height of the history viewport for a terminal of the given size.
pub fn history_viewport_height(app: &App, width: u16, height: u16) -> usize {
    let inner_w = width.saturating_sub(2) as usize;
    let input_h = (input_visual_lines(&app.input, inner_w) + 2 + app.message_queue.len()).min(12);
    (height as usize).saturating_sub(input_h + 2)
}

fn draw_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let mut spans = vec![
        Span::styled(" termide", theme::app_title()),
        Span::styled(theme::STATUS_SEP, theme::status_separator()),
        Span::styled(app.model.as_str(), theme::status_value()),
    ];
    if app.offline {
        spans.push(Span::styled(" (offline)", theme::status_separator()));
    }
    spans.push(Span::styled(theme::STATUS_SEP, theme::status_separator()));
    spans.push(Span::styled(
        app.open_file.as_deref().unwrap_or("no file"),
        theme::status_value(),
    ));

    if app.running {
        let frame_char = theme::SPINNER[app.tick % theme::SPINNER.len()];
        spans.push(Span::styled(theme::STATUS_SEP, theme::status_separator()));
        spans.push(Span::styled(frame_char, theme::spinner()));
        if let Some(status) = &app.status_text {
            spans.push(Span::styled(format!(" {status}"), theme::status_separator()));
        }
    }

    let requests = format!("{}/{} requests ", app.requests_used, app.max_requests);
    let used_pct = if app.max_requests == 0 {
        100
    } else {
        app.requests_used * 100 / app.max_requests
    };
    let left_width: usize = spans.iter().map(|s| s.content.width()).sum();
    let pad = (area.width as usize).saturating_sub(left_width + requests.width());
    spans.push(Span::raw(" ".repeat(pad)));
    let style = if used_pct >= 80 {
        theme::status_warning()
    } else {
        theme::status_value()
    };
    spans.push(Span::styled(requests, style));

    frame.render_widget(Paragraph::new(Line::from(spans)).style(theme::bar_bg()), area);
}

fn draw_history(frame: &mut Frame, app: &App, area: Rect) {
    let width = area.width as usize;
    let mut lines: Vec<Line> = Vec::new();
    for block in &app.blocks {
        render_block(block, &mut lines, width);
    }
    for line in app.pending_text.lines() {
        lines.push(Line::from(Span::styled(line, theme::assistant_text())));
    }

    // scroll_offset is clamped by the main loop before draw()
    let scroll = app.scroll_offset.min(u16::MAX as usize) as u16;
    let history = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0));
    frame.render_widget(history, area);
}

/// Clip `text` to `width` columns, marking the cut with an ellipsis.
fn truncate(text: &str, width: usize) -> String {
    let flat: String = text.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    if flat.width() <= width {
        return flat;
    }
    let mut out = String::new();
    for c in flat.chars() {
        if out.width() + c.to_string().width() + 1 > width {
            break;
        }
        out.push(c);
    }
    out.push('\u{2026}');
    out
}

fn render_block<'a>(block: &'a DisplayBlock, lines: &mut Vec<Line<'a>>, width: usize) {
    match block {
        DisplayBlock::UserInput(text) => {
            for line in text.lines() {
                lines.push(Line::from(vec![
                    Span::styled(format!("{} ", theme::PROMPT_CHAR), theme::prompt()),
                    Span::styled(line, theme::user_input()),
                ]));
            }
            lines.push(Line::from(""));
        }
        DisplayBlock::AssistantText(text) | DisplayBlock::SystemMessage(text) => {
            let style = if matches!(block, DisplayBlock::AssistantText(_)) {
                theme::assistant_text()
            } else {
                theme::system_message()
            };
            if text.is_empty() {
                lines.push(Line::from(""));
            }
            for line in text.lines() {
                lines.push(Line::from(Span::styled(line, style)));
            }
            lines.push(Line::from(""));
        }
        DisplayBlock::Error(text) => {
            for line in text.lines() {
                lines.push(Line::from(vec![
                    Span::styled("\u{2717} ", theme::error()),
                    Span::styled(line, theme::error()),
                ]));
            }
            lines.push(Line::from(""));
        }
        DisplayBlock::ToolCall { name, arguments } => {
            let label = format!("\u{2699} {name}({arguments})");
            lines.push(Line::from(Span::styled(truncate(&label, width), theme::tool_line())));
        }
        DisplayBlock::ToolResult { tool_name, output } => {
            let label = match tool_name {
                Some(name) => format!("  \u{21b3} {name}: {output}"),
                None => format!("  \u{21b3} {output}"),
            };
            lines.push(Line::from(Span::styled(truncate(&label, width), theme::tool_line())));
        }
        DisplayBlock::Handoff { from, to } => {
            let label = format!("\u{21c4} {from} \u{2192} {to}");
            lines.push(Line::from(Span::styled(truncate(&label, width), theme::tool_line())));
        }
        DisplayBlock::Diff {
            path,
            diff_text,
            accepted,
        } => {
            let (mark, style) = if *accepted {
                ("\u{2713} applied", theme::diff_added())
            } else {
                ("\u{2717} discarded", theme::diff_removed())
            };
            lines.push(Line::from(vec![
                Span::styled(format!("{mark} "), style),
                Span::styled(path.as_str(), theme::status_value()),
            ]));
            for line in diff_text.lines() {
                lines.push(Line::from(vec![
                    Span::styled("\u{2502} ", theme::code_chrome()),
                    Span::styled(line, theme::diff_line(line)),
                ]));
            }
            lines.push(Line::from(""));
        }
        DisplayBlock::Splash => {
            lines.push(Line::from(Span::styled("termide", theme::app_title())));
            lines.push(Line::from(Span::styled(
                "Ask anything, or type /help for commands.",
                theme::system_message(),
            )));
            lines.push(Line::from(Span::styled(
                "/open <path> to load a file, /search <query> to find one.",
                theme::system_message(),
            )));
            lines.push(Line::from(""));
        }
    }
}

fn draw_input(frame: &mut Frame, app: &App, area: Rect) {
    let mut lines = Vec::new();

    let max_msg_w = area.width.saturating_sub(6) as usize;
    for (i, msg) in app.message_queue.iter().enumerate() {
        lines.push(Line::from(vec![
            Span::styled(format!("  {}. ", i + 1), Style::default().fg(theme::ASH_MID)),
            Span::styled(truncate(msg, max_msg_w), Style::default().fg(theme::CHALK_DIM)),
        ]));
    }

    for (i, line) in app.input.split('\n').enumerate() {
        let prefix = if i == 0 {
            Span::styled(format!("{} ", theme::PROMPT_CHAR), theme::prompt())
        } else {
            Span::raw("  ")
        };
        lines.push(Line::from(vec![prefix, Span::styled(line, theme::user_input())]));
    }

    let input = Paragraph::new(lines).wrap(Wrap { trim: false }).block(
        Block::default()
            .borders(Borders::TOP | Borders::BOTTOM)
            .border_style(theme::input_border()),
    );
    frame.render_widget(input, area);

    if app.review.is_none() {
        let (vis_row, vis_col) = input_cursor_position(&app.input, app.cursor_pos, area.width as usize);
        let content_h = area.height.saturating_sub(2) as usize;
        let row = (vis_row + app.message_queue.len()).min(content_h.saturating_sub(1));
        frame.set_cursor_position((area.x + vis_col as u16, area.y + 1 + row as u16));
    }
}

fn draw_help_bar(frame: &mut Frame, app: &App, area: Rect) {
    let pairs: &[(&str, &str)] = if app.review.is_some() {
        &[(" y", " apply  "), ("n", " discard  "), ("\u{2191}/\u{2193}", " scroll")]
    } else if app.running {
        &[(" Enter", " queue  "), ("Bksp", " unqueue  "), ("^C", " quit")]
    } else {
        &[
            (" Enter", " send  "),
            ("PgUp/PgDn", " scroll  "),
            ("\u{2191}/\u{2193}", " history  "),
            ("^C", " quit"),
        ]
    };
    let spans: Vec<Span> = pairs
        .iter()
        .flat_map(|(key, desc)| {
            [
                Span::styled(*key, theme::help_key()),
                Span::styled(*desc, theme::help_desc()),
            ]
        })
        .collect();
    frame.render_widget(Paragraph::new(Line::from(spans)).style(theme::bar_bg()), area);
}

/// Colored diff of the proposed change, centered over the history.
fn draw_review(frame: &mut Frame, app: &App, history_area: Rect) {
    let Some(review) = &app.review else {
        return;
    };
    let change = &review.change;

    let width = (history_area.width * 9 / 10).max(20).min(history_area.width);
    let height = (history_area.height * 9 / 10).max(6).min(history_area.height);
    let x = history_area.x + (history_area.width - width) / 2;
    let y = history_area.y + (history_area.height - height) / 2;
    let popup = Rect::new(x, y, width, height);
    frame.render_widget(Clear, popup);

    let (removed, added) = change.line_counts();
    let title = format!(
        " {} {} (-{removed} +{added}) ",
        change.command.token(),
        crate::app::display_name(&change.path)
    );

    let mut lines: Vec<Line> = change
        .diff_text
        .lines()
        .skip(review.scroll)
        .map(|line| Line::from(Span::styled(line, theme::diff_line(line))))
        .collect();
    if !change.explanation.is_empty() {
        lines.push(Line::from(""));
        for line in change.explanation.lines() {
            lines.push(Line::from(Span::styled(line, theme::system_message())));
        }
    }

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(theme::modal_border())
        .title(Span::styled(title, theme::app_title()))
        .title_bottom(Line::from(vec![
            Span::styled(" y", theme::help_key()),
            Span::styled(" apply  ", theme::help_desc()),
            Span::styled("n", theme::help_key()),
            Span::styled(" discard ", theme::help_desc()),
        ]))
        .style(theme::history_bg());
    frame.render_widget(Paragraph::new(lines).block(block), popup);
}

/// Count total visual lines the input text occupies, accounting for wrapping.
fn input_visual_lines(input: &str, width: usize) -> usize {
    if width == 0 {
        return 1;
    }
    input
        .split('\n')
        .map(|line| line.width().max(1).div_ceil(width))
        .sum::<usize>()
        .max(1)
}

/// Visual (row, col) of the cursor in the input, including the 2-column prompt prefix.
fn input_cursor_position(input: &str, cursor_pos: usize, full_width: usize) -> (usize, usize) {
    let prefix = 2usize;
    let before_cursor = &input[..cursor_pos];
    let mut vis_row = 0;

    let last_newline = before_cursor.rfind('\n').map(|i| i + 1).unwrap_or(0);
    if last_newline > 0 {
        for line in input[..last_newline - 1].split('\n') {
            let total = line.width() + prefix;
            vis_row += if full_width > 0 { total.div_ceil(full_width) } else { 1 };
        }
    }

    let abs_pos = prefix + input[last_newline..cursor_pos].width();
    if full_width > 0 {
        (vis_row + abs_pos / full_width, abs_pos % full_width)
    } else {
        (vis_row, abs_pos)
    }
}
