use anyhow::{Context, Result};
use clap::{Arg, Command};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, EventStream},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomchat::app::{App, Services};
use roomchat::config::Config;
use roomchat::remote::{PollingPushService, ReqwestTransport, RequestGateway, Session, SessionStore};
use roomchat::ui;

const TICK_RATE: Duration = Duration::from_millis(250);

fn init_tracing() -> Result<WorkerGuard> {
    let log_dir = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from(".local"))
        .join("roomchat");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Cannot create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(&log_dir, "roomchat.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "roomchat=info".into());

    // The terminal belongs to the TUI, so logs only go to the file
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let matches = Command::new("roomchat")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Terminal chat client with optimistic delivery and attachment uploads")
        .arg(
            Arg::new("base-url")
                .long("base-url")
                .value_name("URL")
                .help("API base URL, overriding the config file"),
        )
        .arg(
            Arg::new("room")
                .short('r')
                .long("room")
                .value_name("ROOM_ID")
                .help("Open a room on startup"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Config file (default: <config dir>/roomchat/config.toml)"),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .value_name("USER_ID")
                .requires("token")
                .help("Sign in as this user"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("ACCESS_TOKEN")
                .requires("user")
                .help("Access token for --user"),
        )
        .arg(
            Arg::new("refresh-token")
                .long("refresh-token")
                .value_name("REFRESH_TOKEN")
                .requires("token")
                .help("Refresh token used when the access token expires"),
        )
        .get_matches();

    let _log_guard = init_tracing()?;

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    if let Some(base_url) = matches.get_one::<String>("base-url") {
        config.api.base_url = base_url.clone();
    }

    let session = SessionStore::open(SessionStore::default_path()).await?;
    if let (Some(user_id), Some(token)) = (
        matches.get_one::<String>("user"),
        matches.get_one::<String>("token"),
    ) {
        session
            .set(Session {
                user_id: user_id.clone(),
                access_token: token.clone(),
                refresh_token: matches.get_one::<String>("refresh-token").cloned(),
            })
            .await;
    }

    let transport = ReqwestTransport::new().context("Failed to build HTTP client")?;
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(
        RequestGateway::new(Arc::new(transport), &config.api.base_url, session, notice_tx)
            .with_fallbacks(config.api.fallback_urls.clone())
            .with_policy(config.retry_policy()),
    );
    let push = PollingPushService::new(gateway.clone(), config.poll_interval());
    let services = Services::new(gateway, notice_rx, Arc::new(push), &config.storage.context);
    info!(base_url = %config.api.base_url, "Starting roomchat");

    let mut app = App::new(services);
    app.start(matches.get_one::<String>("room").map(|s| s.as_str()))
        .await?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<()> {
    let mut events = EventStream::new();
    let mut ticker = tokio::time::interval(TICK_RATE);

    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        tokio::select! {
            _ = ticker.tick() => app.on_tick().await?,
            event = events.next() => match event {
                Some(Ok(event)) => app.handle_input(event).await?,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
