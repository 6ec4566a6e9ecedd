mod app;
mod event;
mod theme;
mod ui;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossterm::cursor::SetCursorStyle;
use crossterm::event::{Event as TermEvent, KeyCode, KeyEventKind, KeyModifiers, MouseEventKind};
use ratatui::DefaultTerminal;
use termide_core::{
    Assistant, ChangeReviewer, ChannelReviewer, Config, Decision, FixedReviewer, GateOutcome,
    JsonlTraceSink, ModelBackend, NoopTraceSink, ScriptedBackend, StreamCallbacks, TraceSink,
    TurnOutcome, read_traces, summarize,
};
use tokio::sync::{mpsc, oneshot};

use app::{App, DisplayBlock};
use event::{AppEvent, TurnResult};

#[derive(Parser)]
#[command(name = "termide", version, about = "AI coding assistant for the terminal")]
#[command(args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Sub>,

    /// File to open on startup
    file: Option<PathBuf>,

    /// Project root for /search and relative paths (defaults to the current directory)
    #[arg(long)]
    project: Option<PathBuf>,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model name (overrides config)
    #[arg(long)]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long)]
    base_url: Option<String>,

    /// Requests allowed per rate-limit window
    #[arg(long)]
    max_requests: Option<usize>,

    /// Rate-limit window in seconds
    #[arg(long)]
    time_window: Option<u64>,

    /// Use the built-in echo backend instead of the network
    #[arg(long)]
    offline: bool,

    /// Do not offer project tools (read_file, list_directory, ...) to the model
    #[arg(long)]
    no_tools: bool,

    /// Run headlessly: handle one input, print the result to stdout, exit
    #[arg(short = 'p', long = "print")]
    print_prompt: Option<String>,

    /// Accept proposed changes without review (headless mode)
    #[arg(long)]
    yes: bool,
}

#[derive(Subcommand)]
enum Sub {
    /// Show recent trace entries and a per-workflow summary
    Traces {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn cleanup_terminal() {
    let _ = crossterm::execute!(
        std::io::stdout(),
        crossterm::event::DisableMouseCapture,
        SetCursorStyle::DefaultUserShape
    );
    ratatui::restore();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to ~/.termide/termide.log so the TUI is never written over
    if let Some(log_dir) = Config::home_dir() {
        std::fs::create_dir_all(&log_dir).ok();
        if let Ok(log_file) = std::fs::File::create(log_dir.join("termide.log")) {
            use tracing_subscriber::EnvFilter;
            let filter =
                EnvFilter::try_from_env("TERMIDE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(log_file)
                .with_ansi(false)
                .init();
        }
    }

    let args = Args::parse();
    let config = build_config(&args);

    if let Some(Sub::Traces { limit }) = args.command {
        return print_traces(&config, limit);
    }

    let project_root = match &args.project {
        Some(p) => p.clone(),
        None => std::env::current_dir()?,
    };
    let backend: Arc<dyn ModelBackend> = if args.offline {
        Arc::new(ScriptedBackend::offline())
    } else {
        Arc::new(config.openai_backend(&project_root))
    };
    let trace = open_trace_sink(&config);

    // ── Headless mode ──
    if let Some(input) = args.print_prompt.clone() {
        let decision = if args.yes {
            Decision::Accept
        } else {
            Decision::Cancel
        };
        let reviewer: Arc<dyn ChangeReviewer> = Arc::new(FixedReviewer(decision));
        let mut assistant = Assistant::new(
            &config,
            backend,
            reviewer,
            trace,
            Some(project_root.clone()),
        );
        if let Some(file) = &args.file {
            let outcome = assistant
                .open_file(&app::resolve_path(&project_root, file.clone()), None)
                .await;
            if let TurnOutcome::OpenFailed { message } = outcome {
                anyhow::bail!(message);
            }
        }
        return run_headless(assistant, input).await;
    }

    let (app_tx, app_rx) = mpsc::unbounded_channel::<AppEvent>();

    // Reviews arrive on their own channel and join the main loop as events
    let (review_tx, mut review_rx) = mpsc::unbounded_channel();
    let review_fwd = app_tx.clone();
    tokio::spawn(async move {
        while let Some(request) = review_rx.recv().await {
            if review_fwd.send(AppEvent::Review(request)).is_err() {
                break;
            }
        }
    });

    let mut assistant = Assistant::new(
        &config,
        backend,
        Arc::new(ChannelReviewer::new(review_tx)),
        trace,
        Some(project_root.clone()),
    );

    let mut app = App::new(
        config.model.clone(),
        config.rate_limit.max_requests,
        args.offline,
    );
    if !args.offline && config.api_key.is_none() {
        app.blocks.push(DisplayBlock::Error(
            "No API key set. Pass --api-key, set OPENAI_API_KEY, or run with --offline.".into(),
        ));
    }
    if let Some(file) = &args.file {
        let outcome = assistant
            .open_file(&app::resolve_path(&project_root, file.clone()), None)
            .await;
        app.finish_turn(&outcome, open_file_name(&assistant), requests_in_window(&assistant));
    }

    // Restore the terminal before the panic message prints
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        cleanup_terminal();
        default_hook(info);
    }));

    let terminal = ratatui::init();
    crossterm::execute!(
        std::io::stdout(),
        SetCursorStyle::SteadyBar,
        crossterm::event::EnableMouseCapture
    )?;

    let result = run_app(terminal, app, assistant, app_tx, app_rx).await;

    cleanup_terminal();
    result
}

/// Config file values overridden by flags and environment.
fn build_config(args: &Args) -> Config {
    let mut config = Config::load();
    config.api_key = args
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty());
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(max) = args.max_requests {
        config.rate_limit.max_requests = max;
    }
    if let Some(window) = args.time_window {
        config.rate_limit.time_window_secs = window;
    }
    if args.no_tools {
        config.tools = false;
    }
    config
}

fn open_trace_sink(config: &Config) -> Arc<dyn TraceSink> {
    let Some(path) = config.trace_log_path() else {
        return Arc::new(NoopTraceSink);
    };
    match JsonlTraceSink::open(path) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            tracing::warn!("tracing disabled: {e}");
            Arc::new(NoopTraceSink)
        }
    }
}

fn print_traces(config: &Config, limit: usize) -> anyhow::Result<()> {
    let Some(path) = config.trace_log_path() else {
        anyhow::bail!("no home directory; pass a trace_log path in the config");
    };
    let records = read_traces(&path, limit)?;
    if records.is_empty() {
        println!("No traces in {}", path.display());
        return Ok(());
    }
    for record in &records {
        println!("{record}");
    }
    println!();
    println!("{:<24} {:>6} {:>6} {:>10}", "workflow", "count", "errors", "mean ms");
    for s in summarize(&records) {
        println!(
            "{:<24} {:>6} {:>6} {:>10.1}",
            s.workflow, s.count, s.errors, s.mean_duration_ms
        );
    }
    Ok(())
}

/// Outcomes that make a headless run exit non-zero.
fn is_failure(outcome: &TurnOutcome) -> bool {
    matches!(
        outcome,
        TurnOutcome::OpenFailed { .. }
            | TurnOutcome::Code(GateOutcome::ModelUnavailable { .. })
            | TurnOutcome::Code(GateOutcome::NoFileOpen)
            | TurnOutcome::Code(GateOutcome::ExtractionFailed { .. })
    )
}

/// Handle one input, streaming text to stdout as it arrives.
async fn run_headless(mut assistant: Assistant, input: String) -> anyhow::Result<()> {
    let streamed = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&streamed);
    let mut callbacks = StreamCallbacks::new()
        .on_text_delta(move |text| {
            print!("{text}");
            let _ = std::io::stdout().flush();
            if let Ok(mut s) = sink.lock() {
                s.push_str(text);
            }
        })
        .on_tool_call(|info| eprintln!("tool: {}({})", info.name, info.arguments))
        .on_error(|message| eprintln!("warning: {message}"));

    let outcome = assistant.handle_input(&input, &mut callbacks).await;
    let streamed = streamed.lock().map(|s| s.clone()).unwrap_or_default();
    if !streamed.is_empty() {
        println!();
    }

    match &outcome {
        TurnOutcome::Ignored => {}
        TurnOutcome::Reply(text) | TurnOutcome::Code(GateOutcome::Explained { text })
            if *text == streamed => {}
        TurnOutcome::Code(GateOutcome::Applied { diff_text, .. }) => {
            print!("{diff_text}");
            println!("{outcome}");
        }
        _ => println!("{outcome}"),
    }

    if is_failure(&outcome) {
        std::process::exit(1);
    }
    Ok(())
}

fn open_file_name(assistant: &Assistant) -> Option<String> {
    assistant
        .context()
        .current_file
        .as_ref()
        .map(|f| f.filename())
}

fn requests_in_window(assistant: &Assistant) -> usize {
    let limiter = assistant.orchestrator().rate_limiter();
    limiter.max_requests().saturating_sub(limiter.remaining())
}

async fn run_app(
    mut terminal: DefaultTerminal,
    mut app: App,
    assistant: Assistant,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    mut app_rx: mpsc::UnboundedReceiver<AppEvent>,
) -> anyhow::Result<()> {
    // Present while idle. Moved into the spawned turn and handed back on TurnDone.
    let mut assistant = Some(assistant);

    let stop = Arc::new(AtomicBool::new(false));

    // Terminal reader polls with a timeout so it can see the stop flag
    let term_tx = app_tx.clone();
    let stop_reader = Arc::clone(&stop);
    tokio::task::spawn_blocking(move || {
        while !stop_reader.load(Ordering::Relaxed) {
            if crossterm::event::poll(Duration::from_millis(50)).unwrap_or(false) {
                match crossterm::event::read() {
                    Ok(ev) => {
                        if term_tx.send(AppEvent::Terminal(ev)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    });

    // Spinner
    let tick_tx = app_tx.clone();
    let stop_tick = Arc::clone(&stop);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            if stop_tick.load(Ordering::Relaxed) || tick_tx.send(AppEvent::Tick).is_err() {
                break;
            }
        }
    });

    #[cfg(unix)]
    {
        let sigterm_tx = app_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                let _ = sigterm_tx.send(AppEvent::Quit);
            }
        });
    }

    loop {
        if app.dirty {
            let size = terminal.size()?;
            let vh = ui::history_viewport_height(&app, size.width, size.height);
            app.clamp_scroll(vh, size.width as usize);
            terminal.draw(|frame| ui::draw(frame, &app))?;
            app.dirty = false;
        }

        let Some(event) = app_rx.recv().await else {
            break;
        };

        match event {
            AppEvent::Tick => {
                if app.running {
                    app.tick = app.tick.wrapping_add(1);
                    app.dirty = true;
                }
            }
            AppEvent::Quit => break,
            AppEvent::Stream(ev) => {
                app.handle_stream_event(ev);
                app.dirty = true;
            }
            AppEvent::Review(request) => {
                app.open_review(request);
                app.dirty = true;
            }
            AppEvent::TurnDone(done) => {
                let TurnResult {
                    assistant: returned,
                    outcome,
                } = *done;
                app.finish_turn(&outcome, open_file_name(&returned), requests_in_window(&returned));
                assistant = Some(returned);
                if let Some(queued) = app.take_queued_message() {
                    start_turn(queued, &mut app, &mut assistant, &app_tx);
                }
                app.dirty = true;
            }
            AppEvent::Terminal(TermEvent::Resize(..)) => app.dirty = true,
            AppEvent::Terminal(TermEvent::Mouse(mouse)) => match mouse.kind {
                MouseEventKind::ScrollUp => {
                    if app.has_review() {
                        app.review_scroll(-3);
                    } else {
                        app.scroll_up(3);
                    }
                    app.dirty = true;
                }
                MouseEventKind::ScrollDown => {
                    if app.has_review() {
                        app.review_scroll(3);
                    } else {
                        let size = terminal.size()?;
                        let vh = ui::history_viewport_height(&app, size.width, size.height);
                        app.scroll_down(3, vh, size.width as usize);
                    }
                    app.dirty = true;
                }
                _ => {}
            },
            AppEvent::Terminal(TermEvent::Key(key)) => {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                app.dirty = true;

                // CTRL+C: discard the open review, else quit
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    if app.has_review() {
                        app.answer_review(Decision::Cancel);
                        continue;
                    }
                    break;
                }

                if app.has_review() {
                    match key.code {
                        KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
                            app.answer_review(Decision::Accept)
                        }
                        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                            app.answer_review(Decision::Cancel)
                        }
                        KeyCode::Up => app.review_scroll(-1),
                        KeyCode::Down => app.review_scroll(1),
                        KeyCode::PageUp => app.review_scroll(-10),
                        KeyCode::PageDown => app.review_scroll(10),
                        _ => {}
                    }
                    continue;
                }

                let size = terminal.size()?;
                let vh = ui::history_viewport_height(&app, size.width, size.height);
                match key.code {
                    KeyCode::Enter => {
                        let input = app.take_input();
                        if input.trim().is_empty() {
                            continue;
                        }
                        if app.running {
                            app.queue_message(input);
                        } else {
                            start_turn(input, &mut app, &mut assistant, &app_tx);
                        }
                    }
                    KeyCode::Backspace if app.running && app.input.is_empty() => {
                        if let Some(msg) = app.unqueue_last() {
                            app.cursor_pos = msg.len();
                            app.input = msg;
                        }
                    }
                    KeyCode::Backspace => app.backspace(),
                    KeyCode::Delete => app.delete(),
                    KeyCode::Left => app.move_cursor_left(),
                    KeyCode::Right => app.move_cursor_right(),
                    KeyCode::Home => app.move_cursor_home(),
                    KeyCode::End => app.move_cursor_end(),
                    KeyCode::Up => app.history_up(),
                    KeyCode::Down => app.history_down(),
                    KeyCode::PageUp => app.scroll_up(vh),
                    KeyCode::PageDown => app.scroll_down(vh, vh, size.width as usize),
                    KeyCode::Char(c) => app.insert_char(c),
                    _ => {}
                }
            }
            AppEvent::Terminal(_) => {}
        }
    }

    stop.store(true, Ordering::Relaxed);
    Ok(())
}

/// Move the assistant into a task that runs one turn.
///
/// Stream events and the final result travel through one forwarding task, so
/// `TurnDone` always arrives after the turn's last `Stream` event.
fn start_turn(
    input: String,
    app: &mut App,
    assistant: &mut Option<Assistant>,
    app_tx: &mpsc::UnboundedSender<AppEvent>,
) {
    let Some(mut owned) = assistant.take() else {
        app.queue_message(input);
        return;
    };
    app.begin_turn(&input);

    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let outcome = {
            let mut callbacks = StreamCallbacks::forward_to(stream_tx);
            owned.handle_input(&input, &mut callbacks).await
        };
        let _ = done_tx.send(TurnResult {
            assistant: owned,
            outcome,
        });
    });

    let fwd = app_tx.clone();
    tokio::spawn(async move {
        while let Some(ev) = stream_rx.recv().await {
            let _ = fwd.send(AppEvent::Stream(ev));
        }
        if let Ok(done) = done_rx.await {
            let _ = fwd.send(AppEvent::TurnDone(Box::new(done)));
        }
    });
}
