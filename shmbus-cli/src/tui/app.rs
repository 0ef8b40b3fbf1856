// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! TUI Dashboard using ratatui.
//!
//! Shows the roster of a bus and the fill level of every pipe, refreshed
//! from an inspector snapshot on each tick.

use std::io::stdout;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
};
use shmbus_core::{BusInspector, BusKey, BusSnapshot, PipeStats};

/// Dashboard state.
struct App {
    key: BusKey,
    /// Whether to quit the application.
    should_quit: bool,
    /// Refreshes since start.
    tick: u64,
    inspector: Option<BusInspector>,
    /// Latest snapshot, if the bus exists.
    snapshot: Option<BusSnapshot>,
    /// Last failure to attach or snapshot.
    error: Option<String>,
}

impl App {
    fn new(key: BusKey) -> Self {
        Self {
            key,
            should_quit: false,
            tick: 0,
            inspector: None,
            snapshot: None,
            error: None,
        }
    }

    /// Attach if needed and take a fresh snapshot.
    fn refresh(&mut self) {
        self.tick = self.tick.wrapping_add(1);

        if self.inspector.is_none() {
            match BusInspector::open(self.key) {
                Ok(inspector) => self.inspector = Some(inspector),
                Err(e) => {
                    self.snapshot = None;
                    self.error = Some(e.to_string());
                    return;
                }
            }
        }

        if let Some(inspector) = &self.inspector {
            match inspector.snapshot() {
                Ok(snapshot) => {
                    self.snapshot = Some(snapshot);
                    self.error = None;
                }
                Err(e) => {
                    // The bus may have been destroyed; re-attach next tick.
                    self.inspector = None;
                    self.error = Some(e.to_string());
                }
            }
        }
    }
}

/// Run the TUI dashboard.
pub async fn run_dashboard(
    key: BusKey,
    tick: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let mut app = App::new(key);

    loop {
        app.refresh();
        terminal.draw(|frame| render(frame, &app))?;

        if event::poll(tick)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
                        _ => {}
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(())
}

/// Text bar of `width` cells filled to `ratio`.
fn fill_bar(ratio: f64, width: usize) -> String {
    let filled = ((ratio.clamp(0.0, 1.0) * width as f64).round() as usize).min(width);
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

fn fill_color(ratio: f64) -> Color {
    if ratio >= 0.9 {
        Color::Red
    } else if ratio >= 0.5 {
        Color::Yellow
    } else {
        Color::Green
    }
}

fn pipe_row(pipe: &PipeStats) -> Row<'static> {
    let ratio = pipe.fill_ratio();
    Row::new(vec![
        Cell::from(pipe.from.to_string()),
        Cell::from(pipe.to.to_string()),
        Cell::from(pipe.capacity.to_string()),
        Cell::from(pipe.write_bytes.to_string()),
        Cell::from(pipe.read_bytes.to_string()),
        Cell::from(format!("{} {:>5.1}%", fill_bar(ratio, 10), ratio * 100.0))
            .style(Style::default().fg(fill_color(ratio))),
    ])
}

fn placeholder_row(text: String, columns: usize) -> Row<'static> {
    let mut cells = vec![Cell::from(text)];
    cells.extend((1..columns).map(|_| Cell::from("-")));
    Row::new(cells).style(Style::default().fg(Color::DarkGray))
}

fn render(frame: &mut Frame, app: &App) {
    let main_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title
            Constraint::Min(10),   // Main content
            Constraint::Length(3), // Footer
        ])
        .split(frame.area());

    // Title
    let title = Paragraph::new(format!(" SHMBUS {} ", app.key))
        .style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        );
    frame.render_widget(title, main_layout[0]);

    let content_layout = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(main_layout[1]);

    // Pipe table
    let header = Row::new(vec![
        Cell::from("From"),
        Cell::from("To"),
        Cell::from("Capacity"),
        Cell::from("Written"),
        Cell::from("Read"),
        Cell::from("Fill"),
    ])
    .style(
        Style::default()
            .add_modifier(Modifier::BOLD)
            .fg(Color::Yellow),
    );

    let rows: Vec<Row> = match (&app.snapshot, &app.error) {
        (Some(snapshot), _) if snapshot.pipes.is_empty() => {
            vec![placeholder_row("(no pipes yet)".to_string(), 6)]
        }
        (Some(snapshot), _) => snapshot.pipes.iter().map(pipe_row).collect(),
        (None, Some(error)) => vec![placeholder_row(error.clone(), 6)],
        (None, None) => vec![placeholder_row("Waiting for bus...".to_string(), 6)],
    };

    let table = Table::new(
        rows,
        [
            Constraint::Percentage(12),
            Constraint::Percentage(12),
            Constraint::Percentage(14),
            Constraint::Percentage(14),
            Constraint::Percentage(14),
            Constraint::Percentage(34),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .title(" Pipes ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Green)),
    );
    frame.render_widget(table, content_layout[0]);

    // Right column - roster and versions
    let right_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6), // Versions
            Constraint::Min(5),    // Terminals
        ])
        .split(content_layout[1]);

    let (terminal_version, pipe_version) = app
        .snapshot
        .as_ref()
        .map(|s| (s.terminal_version, s.pipe_version))
        .unwrap_or((0, 0));

    let stats_text = vec![
        Line::from(vec![
            Span::raw("Terminal version: "),
            Span::styled(
                terminal_version.to_string(),
                Style::default()
                    .fg(Color::Green)
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::raw("Pipe version:     "),
            Span::styled(
                pipe_version.to_string(),
                Style::default()
                    .fg(Color::Green)
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::raw("Refreshes:        "),
            Span::styled(app.tick.to_string(), Style::default().fg(Color::DarkGray)),
        ]),
    ];

    let stats_block = Paragraph::new(stats_text).block(
        Block::default()
            .title(" Registry ")
            .borders(Borders::ALL),
    );
    frame.render_widget(stats_block, right_layout[0]);

    let terminals: Vec<Line> = app
        .snapshot
        .as_ref()
        .map(|s| {
            s.terminals
                .iter()
                .map(|t| Line::from(format!("{:<10} raw {}", t.to_string(), t.raw())))
                .collect()
        })
        .unwrap_or_default();
    let count = terminals.len();
    let roster = Paragraph::new(terminals).block(
        Block::default()
            .title(format!(" Terminals ({}) ", count))
            .borders(Borders::ALL),
    );
    frame.render_widget(roster, right_layout[1]);

    // Footer
    let footer = Paragraph::new(" Press 'q' to quit ")
        .style(Style::default().fg(Color::DarkGray))
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(footer, main_layout[2]);
}
