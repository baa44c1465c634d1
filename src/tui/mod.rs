use std::io::{self, Stdout};
use std::time::Duration;

use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::{ExecutableCommand, execute};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use tracing::{info, warn};
use unicode_width::UnicodeWidthChar;

use crate::archive::{Archive, ArchiveUpdate, HistoryRepository};
use crate::diff::SegmentKind;
use crate::model::{HistoryItem, ScenarioResult, SessionConfig};
use crate::session::{LogLine, SessionController, SessionStatus};
use crate::store::{self, CycleGroup};
use crate::transcript;
use crate::transport::Transport;
use crate::util;

const TICK: Duration = Duration::from_millis(100);
const LIVE_HINT: &str = "s start  •  x stop  •  ↑/↓ select  •  Tab switch pane  •  h history  •  q quit";
const HISTORY_HINT: &str = "↑/↓ select  •  d delete  •  r refresh  •  Esc back  •  q quit";
const LOG_TAIL: usize = 200;
const NAME_WIDTH: usize = 18;

/// Source of terminal input; swapped out in tests.
pub(crate) trait EventSource {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<Event>>;
}

struct CrosstermEvents;

impl EventSource for CrosstermEvents {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if event::poll(timeout)? {
            Ok(Some(event::read()?))
        } else {
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Live,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Transcript,
    Diff,
    Log,
}

impl Pane {
    fn next(self) -> Self {
        match self {
            Pane::Transcript => Pane::Diff,
            Pane::Diff => Pane::Log,
            Pane::Log => Pane::Transcript,
        }
    }
}

/// Everything the dashboard shows: the live session, the run archive, and
/// the configuration used for the next start.
pub struct Dashboard<T: Transport, A: Archive> {
    session: SessionController<T>,
    history: HistoryRepository<A>,
    config: SessionConfig,
    view: View,
    pane: Pane,
    selected_result: usize,
    selected_run: usize,
    message: Option<String>,
}

impl<T: Transport, A: Archive + Send + 'static> Dashboard<T, A> {
    pub fn new(
        session: SessionController<T>,
        history: HistoryRepository<A>,
        config: SessionConfig,
    ) -> Self {
        let message = config
            .api_key
            .is_empty()
            .then(|| "No API key configured; the server will reject the run.".to_string());
        Self {
            session,
            history,
            config,
            view: View::Live,
            pane: Pane::Transcript,
            selected_result: 0,
            selected_run: 0,
            message,
        }
    }

    fn start(&mut self) {
        self.selected_result = 0;
        self.pane = Pane::Transcript;
        match self.session.start(self.config.clone()) {
            Ok(()) => self.message = Some("Connecting…".to_string()),
            Err(err) => {
                warn!(error = %err, "failed to start session");
                self.message = Some(format!("Could not start: {err}"));
            }
        }
    }

    fn stop(&mut self) {
        if self.session.is_running() {
            self.session.stop();
            self.message = Some("Simulation stopped.".to_string());
        }
    }

    fn refresh_history(&mut self) {
        match self.history.request_refresh() {
            Ok(()) => self.message = Some("Loading history…".to_string()),
            Err(err) => self.message = Some(format!("Could not load history: {err}")),
        }
    }

    fn delete_selected_run(&mut self) {
        let Some(id) = self
            .history
            .items()
            .get(self.selected_run)
            .map(|item| item.id.clone())
        else {
            return;
        };
        match self.history.request_delete(id.clone()) {
            Ok(()) => self.message = Some(format!("Deleting {id}…")),
            Err(err) => self.message = Some(format!("Could not delete {id}: {err}")),
        }
    }

    fn apply_history_update(&mut self, update: ArchiveUpdate) {
        self.message = Some(match update {
            ArchiveUpdate::Refreshed { count } => format!("Loaded {count} runs."),
            ArchiveUpdate::RefreshFailed(err) => format!("Could not load history: {err}"),
            ArchiveUpdate::Deleted { id } => {
                info!(id = %id, "deleted run from dashboard");
                format!("Deleted run {id}.")
            }
            ArchiveUpdate::DeleteFailed { id, error } => {
                format!("Could not delete {id}: {error}")
            }
        });
        self.selected_run = self
            .selected_run
            .min(self.history.items().len().saturating_sub(1));
    }

    /// Results in the order the cycle list shows them.
    fn ordered_results(&self) -> Vec<&ScenarioResult> {
        self.session
            .results()
            .grouped_by_cycle()
            .into_iter()
            .flat_map(|group| group.results)
            .collect()
    }

    fn selected(&self) -> Option<&ScenarioResult> {
        self.ordered_results().get(self.selected_result).copied()
    }

    fn move_selection(&mut self, delta: isize) {
        let len = match self.view {
            View::Live => self.session.results().len(),
            View::History => self.history.items().len(),
        };
        let current = match self.view {
            View::Live => &mut self.selected_result,
            View::History => &mut self.selected_run,
        };
        if len == 0 {
            *current = 0;
            return;
        }
        *current = current.saturating_add_signed(delta).min(len - 1);
    }

    /// Apply one key press. Returns `true` when the dashboard should exit.
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind == KeyEventKind::Release {
            return false;
        }
        match (self.view, key.code) {
            (_, KeyCode::Char('q')) | (View::Live, KeyCode::Esc) => return true,
            (_, KeyCode::Down) => self.move_selection(1),
            (_, KeyCode::Up) => self.move_selection(-1),
            (_, KeyCode::PageDown) => self.move_selection(10),
            (_, KeyCode::PageUp) => self.move_selection(-10),
            (View::Live, KeyCode::Char('s')) => self.start(),
            (View::Live, KeyCode::Char('x')) => self.stop(),
            (View::Live, KeyCode::Tab) => self.pane = self.pane.next(),
            (View::Live, KeyCode::Char('h')) => {
                self.view = View::History;
                self.refresh_history();
            }
            (View::History, KeyCode::Esc | KeyCode::Char('h')) => {
                self.view = View::Live;
                self.message = None;
            }
            (View::History, KeyCode::Char('r')) => self.refresh_history(),
            (View::History, KeyCode::Char('d') | KeyCode::Delete) => self.delete_selected_run(),
            _ => {}
        }
        false
    }

    /// Apply whatever the session and the archive worker reported since the
    /// last tick. Never blocks.
    fn tick(&mut self) {
        for update in self.history.pump() {
            self.apply_history_update(update);
        }
        if self.session.pump() > 0 {
            match self.session.status() {
                SessionStatus::Streaming => self.message = None,
                SessionStatus::Completed => {
                    self.message = Some("Optimization complete.".to_string());
                }
                SessionStatus::Errored { reason } => self.message = Some(reason.to_string()),
                SessionStatus::Idle => {
                    self.message = Some("Connection closed by server.".to_string());
                }
                SessionStatus::Connecting | SessionStatus::Stopped => {}
            }
        }
    }
}

/// Run the dashboard until the user quits.
///
/// # Errors
///
/// Returns an error if terminal IO fails.
pub fn run<T: Transport, A: Archive + Send + 'static>(
    dashboard: &mut Dashboard<T, A>,
) -> Result<()> {
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let result = run_with_terminal(dashboard, &mut terminal, &mut CrosstermEvents);

    disable_raw_mode()?;
    restore(&mut terminal)?;
    dashboard.stop();
    result
}

fn restore(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    terminal
        .backend_mut()
        .execute(crossterm::terminal::LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

pub(crate) fn run_with_terminal<T: Transport, A: Archive + Send + 'static, B: Backend>(
    dashboard: &mut Dashboard<T, A>,
    terminal: &mut Terminal<B>,
    events: &mut impl EventSource,
) -> Result<()> {
    loop {
        dashboard.tick();
        terminal.draw(|frame| draw(frame, dashboard))?;

        if let Some(Event::Key(key)) = events.next_event(TICK)?
            && dashboard.handle_key(key)
        {
            return Ok(());
        }
    }
}

fn draw<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    dashboard: &Dashboard<T, A>,
) {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(frame.area());

    match dashboard.view {
        View::Live => {
            draw_stats(frame, vertical[0], dashboard);
            let columns = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
                .split(vertical[1]);
            draw_cycles(frame, columns[0], dashboard);
            match dashboard.pane {
                Pane::Transcript => draw_transcript(frame, columns[1], dashboard.selected()),
                Pane::Diff => draw_diff(frame, columns[1], dashboard),
                Pane::Log => draw_log(frame, columns[1], dashboard),
            }
        }
        View::History => {
            draw_history_header(frame, vertical[0], dashboard);
            let columns = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
                .split(vertical[1]);
            draw_runs(frame, columns[0], dashboard);
            draw_run_detail(
                frame,
                columns[1],
                dashboard.history.items().get(dashboard.selected_run),
            );
        }
    }
    draw_status(frame, vertical[2], dashboard);
}

fn status_color(status: &SessionStatus) -> Color {
    match status {
        SessionStatus::Idle | SessionStatus::Stopped => Color::Gray,
        SessionStatus::Connecting => Color::Yellow,
        SessionStatus::Streaming => Color::Cyan,
        SessionStatus::Completed => Color::Green,
        SessionStatus::Errored { .. } => Color::Red,
    }
}

fn draw_stats<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    dashboard: &Dashboard<T, A>,
) {
    let session = &dashboard.session;
    let results = session.results();
    let max_cycles = session
        .config()
        .map_or(dashboard.config.max_cycles, |config| config.max_cycles);
    let cycle = results
        .latest_cycle()
        .map_or_else(|| "-".to_string(), |cycle| cycle.to_string());

    let label = Style::default().fg(Color::DarkGray);
    let line = Line::from(vec![
        Span::styled(
            format!(" {} ", session.status().label().to_uppercase()),
            Style::default()
                .fg(Color::Black)
                .bg(status_color(session.status()))
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled("  Runs ", label),
        Span::raw(results.len().to_string()),
        Span::styled("  Cycle ", label),
        Span::raw(format!("{cycle}/{max_cycles}")),
        Span::styled("  Pass rate ", label),
        Span::raw(util::format_percent(results.pass_rate())),
        Span::styled("  Avg ", label),
        Span::raw(format!("{:.1}", results.average_score())),
        Span::styled("  Model ", label),
        Span::raw(dashboard.config.model_name.clone()),
    ]);
    let paragraph =
        Paragraph::new(line).block(Block::default().borders(Borders::ALL).title("Simulation"));
    frame.render_widget(paragraph, area);
}

fn group_header(group: &CycleGroup<'_>) -> Line<'static> {
    Line::from(vec![
        Span::styled(
            format!("Cycle {}", group.cycle),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!(
                "  {}/{} passed  avg {:.1}",
                group.passed(),
                group.results.len(),
                group.average_score()
            ),
            Style::default().fg(Color::DarkGray),
        ),
    ])
}

fn result_row(result: &ScenarioResult) -> Line<'static> {
    let (mark, color) = if result.passed {
        ("✓", Color::Green)
    } else {
        ("✗", Color::Red)
    };
    Line::from(vec![
        Span::styled(format!("  {mark} "), Style::default().fg(color)),
        Span::raw(pad(&result.persona.name, NAME_WIDTH)),
        Span::styled(
            format!(" {:>4.1}", result.score),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!("  {}", result.persona.primary_trait()),
            Style::default().fg(Color::DarkGray),
        ),
    ])
}

fn draw_cycles<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    dashboard: &Dashboard<T, A>,
) {
    let mut items = Vec::new();
    let mut selected_row = None;
    let mut index = 0;
    for group in dashboard.session.results().grouped_by_cycle() {
        items.push(ListItem::new(group_header(&group)));
        for result in &group.results {
            if index == dashboard.selected_result {
                selected_row = Some(items.len());
            }
            items.push(ListItem::new(result_row(result)));
            index += 1;
        }
    }
    if items.is_empty() {
        let hint = match dashboard.session.status() {
            SessionStatus::Connecting | SessionStatus::Streaming => "Waiting for results…",
            _ => "Press s to start a simulation.",
        };
        items.push(ListItem::new(Span::styled(
            hint,
            Style::default().fg(Color::DarkGray),
        )));
    }

    let list = List::new(items)
        .block(Block::default().title("Cycles").borders(Borders::ALL))
        .highlight_style(Style::default().fg(Color::Black).bg(Color::Cyan))
        .highlight_symbol("▶");
    let mut state = ListState::default().with_selected(selected_row);
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_transcript(frame: &mut Frame<'_>, area: Rect, result: Option<&ScenarioResult>) {
    let Some(result) = result else {
        render_placeholder(frame, area, "Transcript", "Select a scenario to read it.");
        return;
    };

    let parsed = transcript::parse(&result.transcript);
    let mut lines = vec![
        Line::from(vec![
            Span::styled(
                result.persona.name.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("  {}", result.persona.financial_situation),
                Style::default().fg(Color::DarkGray),
            ),
        ]),
    ];
    let persona = &result.persona;
    for (label, value) in [
        ("Style: ", &persona.communication_style),
        ("Objection: ", &persona.objection_type),
    ] {
        if !value.is_empty() {
            lines.push(Line::from(vec![
                Span::styled(label, Style::default().fg(Color::DarkGray)),
                Span::raw(value.clone()),
            ]));
        }
    }
    lines.push(Line::default());
    for line in &parsed.lines {
        let color = if line.is_agent() {
            Color::Cyan
        } else {
            Color::Magenta
        };
        lines.push(Line::from(vec![
            Span::styled(
                format!("{}: ", line.speaker),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::raw(line.content.clone()),
        ]));
    }
    for raw in &parsed.unparseable {
        lines.push(Line::from(Span::styled(
            raw.clone(),
            Style::default().fg(Color::DarkGray),
        )));
    }
    if !result.feedback.is_empty() {
        lines.push(Line::default());
        lines.push(Line::from(vec![
            Span::styled("Feedback: ", Style::default().fg(Color::Yellow)),
            Span::raw(result.feedback.clone()),
        ]));
    }
    if let Some(metrics) = &result.metrics {
        let rendered = metrics
            .iter()
            .map(|(name, value)| format!("{name} {value:.1}"))
            .collect::<Vec<_>>()
            .join("  ");
        lines.push(Line::from(Span::styled(
            rendered,
            Style::default().fg(Color::DarkGray),
        )));
    }

    let title = format!("Transcript · cycle {} · score {:.1}", result.cycle, result.score);
    let paragraph = Paragraph::new(lines)
        .block(Block::default().title(title).borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn draw_diff<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    dashboard: &Dashboard<T, A>,
) {
    let prompts = dashboard.session.prompts();
    let (Some(latest), Some(segments)) = (prompts.latest(), prompts.latest_diff()) else {
        render_placeholder(frame, area, "Prompt diff", "No prompt revisions yet.");
        return;
    };

    let spans: Vec<Span<'static>> = segments
        .into_iter()
        .map(|segment| match segment.kind {
            SegmentKind::Unchanged => Span::raw(segment.text),
            SegmentKind::Added => Span::styled(
                segment.text,
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
            SegmentKind::Removed => Span::styled(
                segment.text,
                Style::default()
                    .fg(Color::Red)
                    .add_modifier(Modifier::CROSSED_OUT),
            ),
        })
        .collect();

    let lines = vec![
        Line::from(Span::styled(
            latest.reasoning.clone(),
            Style::default().fg(Color::Yellow),
        )),
        Line::default(),
        Line::from(spans),
    ];
    let title = format!(
        "Prompt diff · cycle {} · {} revisions",
        latest.cycle,
        prompts.len()
    );
    let paragraph = Paragraph::new(lines)
        .block(Block::default().title(title).borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn draw_log<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    dashboard: &Dashboard<T, A>,
) {
    let log = dashboard.session.log();
    let visible = usize::from(area.height.saturating_sub(2)).min(LOG_TAIL);
    let lines: Vec<Line<'_>> = log
        .since(log.len().saturating_sub(visible))
        .iter()
        .map(|line| match LogLine::classify(line) {
            LogLine::Error(text) => Line::from(Span::styled(text, Style::default().fg(Color::Red))),
            LogLine::Spoken { speaker, message } => Line::from(vec![
                Span::styled(
                    format!("{speaker}: "),
                    Style::default().fg(Color::Cyan),
                ),
                Span::raw(message),
            ]),
            LogLine::Plain(text) => Line::from(text),
        })
        .collect();
    let paragraph = Paragraph::new(lines)
        .block(Block::default().title("Log").borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn draw_history_header<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    dashboard: &Dashboard<T, A>,
) {
    let items = dashboard.history.items();
    let met = items.iter().filter(|item| item.met_target()).count();
    let text = format!(" {} runs  •  {met} met their target", items.len());
    let paragraph =
        Paragraph::new(text).block(Block::default().borders(Borders::ALL).title("History"));
    frame.render_widget(paragraph, area);
}

fn draw_runs<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    dashboard: &Dashboard<T, A>,
) {
    let runs = dashboard.history.items();
    let mut items: Vec<ListItem<'_>> = runs
        .iter()
        .map(|item| {
            let rate_color = if item.met_target() {
                Color::Green
            } else {
                Color::Red
            };
            ListItem::new(Line::from(vec![
                Span::styled(
                    util::format_timestamp(&item.timestamp),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(
                    format!("  {:>4}", util::format_percent(item.success_rate)),
                    Style::default().fg(rate_color),
                ),
                Span::raw(format!("  {} cycles", item.total_cycles)),
            ]))
        })
        .collect();
    if items.is_empty() {
        let text = if dashboard.history.is_pending() {
            "Loading…".to_string()
        } else {
            dashboard
                .history
                .last_error()
                .map_or_else(|| "No completed runs.".to_string(), ToString::to_string)
        };
        items.push(ListItem::new(Span::styled(
            text,
            Style::default().fg(Color::DarkGray),
        )));
    }

    let selected = (!runs.is_empty()).then_some(dashboard.selected_run);
    let list = List::new(items)
        .block(Block::default().title("Runs").borders(Borders::ALL))
        .highlight_style(Style::default().fg(Color::Black).bg(Color::Cyan))
        .highlight_symbol("▶");
    let mut state = ListState::default().with_selected(selected);
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_run_detail(frame: &mut Frame<'_>, area: Rect, item: Option<&HistoryItem>) {
    let Some(item) = item else {
        render_placeholder(frame, area, "Run", "Nothing selected.");
        return;
    };

    let label = Style::default().fg(Color::DarkGray);
    let mut lines = vec![
        Line::from(vec![
            Span::styled("Model ", label),
            Span::raw(item.config.model_name.clone()),
            Span::styled("  Batch ", label),
            Span::raw(item.config.batch_size.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Success ", label),
            Span::raw(util::format_percent(item.success_rate)),
            Span::styled("  Target ", label),
            Span::raw(util::format_percent(item.config.thresholds.pass_fraction())),
        ]),
        Line::default(),
    ];
    for group in store::group_by_cycle(&item.results) {
        lines.push(group_header(&group));
        lines.extend(group.results.iter().map(|result| result_row(result)));
    }
    if let Some(last) = item.optimization_history.last() {
        lines.push(Line::default());
        lines.push(Line::from(Span::styled(
            format!("Last revision (cycle {}): {}", last.cycle, last.reasoning),
            Style::default().fg(Color::Yellow),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(
            Block::default()
                .title(format!("Run {}", item.id))
                .borders(Borders::ALL),
        )
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

fn render_placeholder(frame: &mut Frame<'_>, area: Rect, title: &str, text: &str) {
    let paragraph = Paragraph::new(Span::styled(
        text.to_string(),
        Style::default().fg(Color::DarkGray),
    ))
    .block(Block::default().title(title.to_string()).borders(Borders::ALL));
    frame.render_widget(paragraph, area);
}

fn draw_status<T: Transport, A: Archive + Send + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    dashboard: &Dashboard<T, A>,
) {
    let hint = match dashboard.view {
        View::Live => LIVE_HINT,
        View::History => HISTORY_HINT,
    };
    let (content, style) = match &dashboard.message {
        Some(text) => (format!(" {text} "), Style::default()),
        None => (format!(" {hint} "), Style::default().fg(Color::DarkGray)),
    };

    let paragraph = Paragraph::new(content)
        .style(style)
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(paragraph, area);
}

/// Truncate or pad to exactly `width` terminal columns.
fn pad(input: &str, width: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for ch in input.chars() {
        let next = used + ch.width().unwrap_or(0);
        if next > width {
            break;
        }
        out.push(ch);
        used = next;
    }
    out.push_str(&" ".repeat(width.saturating_sub(used)));
    out
}
