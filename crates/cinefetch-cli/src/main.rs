//! Cinefetch CLI - command-line front end for the Cinefetch engine

use cinefetch_core::utils::parse_magnet;
use cinefetch_core::{
    format_bytes, format_eta, format_speed, init_database, AddTaskRequest, Backend, Database,
    DownloadService, DownloadTask, EngineCommand, ExternalIds, RankingRequest, Settings, SettingsDb,
    TaskKind, TransitionOutcome, UiMessage,
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "cinefetch")]
#[command(about = "Find, rank and download movie and TV sources")]
#[command(version)]
struct Cli {
    /// Daemon JSON-RPC endpoint
    #[arg(long, global = true)]
    daemon_url: Option<String>,

    /// Daemon RPC secret
    #[arg(long, global = true)]
    daemon_secret: Option<String>,

    /// Search provider URL
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Root directory for downloads
    #[arg(long, global = true)]
    download_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rank sources for a title
    Search {
        title: String,
        #[arg(long, value_enum, default_value_t = KindArg::Movie)]
        kind: KindArg,
        #[arg(long)]
        season: Option<u32>,
        #[arg(long)]
        episode: Option<u32>,
        /// IMDb id, used as an extra query for movies
        #[arg(long)]
        imdb: Option<String>,
        /// Preferred quality label, e.g. 1080p
        #[arg(long)]
        quality: Option<String>,
        /// Search packs across this many seasons instead
        #[arg(long, value_name = "SEASONS")]
        all_seasons: Option<u32>,
    },
    /// Start a download
    Add {
        /// Magnet link or URL
        source: String,
        #[arg(long)]
        title: String,
        #[arg(long, value_enum, default_value_t = KindArg::Movie)]
        kind: KindArg,
        #[arg(long)]
        season: Option<u32>,
        /// Defaults to swarm for magnet links, daemon otherwise
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        /// Output filename (daemon only)
        #[arg(long)]
        filename: Option<String>,
        /// Follow progress until the task finishes
        #[arg(long)]
        watch: bool,
    },
    /// List tasks known to this session
    Tasks,
    /// Pause a running task
    Pause { id: String },
    /// Resume a paused task
    Resume { id: String },
    /// Cancel a task
    Cancel { id: String },
    /// Drop a task, cancelling it first if it is still running
    Remove { id: String },
    /// Show or edit the download history
    History {
        #[arg(long, conflicts_with = "remove")]
        clear: bool,
        #[arg(long, value_name = "ID")]
        remove: Option<String>,
    },
    /// Show transfer statistics
    Stats,
    /// Reload daemon tasks and stream their progress
    Watch,
    /// Show or change stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting, or one stored value
    Show { key: Option<String> },
    /// Store one setting
    Set { key: String, value: String },
    /// Restore every setting to its default
    Reset,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Movie,
    TvEpisode,
    TvSeasonPack,
    Generic,
}

impl From<KindArg> for TaskKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Movie => TaskKind::Movie,
            KindArg::TvEpisode => TaskKind::TvEpisode,
            KindArg::TvSeasonPack => TaskKind::TvSeasonPack,
            KindArg::Generic => TaskKind::GenericFile,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Swarm,
    Daemon,
}

impl From<BackendArg> for Backend {
    fn from(backend: BackendArg) -> Self {
        match backend {
            BackendArg::Swarm => Backend::Swarm,
            BackendArg::Daemon => Backend::Daemon,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let db = match init_database() {
        Ok(db) => db,
        Err(e) => {
            log::warn!("Failed to open database, using a throwaway one: {}", e);
            Database::open_in_memory().map_err(|e| e.to_string())?
        }
    };
    if let Command::Config { action } = &cli.command {
        return configure(&db, action);
    }
    let settings = apply_overrides(SettingsDb::load(&db).unwrap_or_default(), &cli);

    // The embedded engine lives on this runtime for the whole process
    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to create tokio runtime: {}", e))?;
    let service = rt
        .block_on(DownloadService::new_async(&settings, db))
        .map_err(|e| format!("Failed to create download service: {}", e))?;

    let (ui_sender, ui_receiver) = async_channel::bounded::<UiMessage>(100);
    let (cmd_sender, cmd_receiver) = async_channel::bounded::<EngineCommand>(100);
    let service_thread = service.spawn(ui_sender, cmd_receiver);
    let session = Session {
        commands: cmd_sender,
        messages: ui_receiver,
    };
    session.wait(|m| matches!(m, UiMessage::EngineReady).then_some(()))?;

    let result = dispatch(&session, cli.command);

    let _ = session.commands.send_blocking(EngineCommand::Shutdown);
    let _ = service_thread.join();
    drop(rt);
    result
}

fn configure(db: &Database, action: &ConfigAction) -> Result<(), String> {
    match action {
        ConfigAction::Show { key: Some(key) } => {
            match SettingsDb::get(db, key).map_err(|e| e.to_string())? {
                Some(value) => println!("{}", value),
                None => println!("{} is not set", key),
            }
        }
        ConfigAction::Show { key: None } => {
            let settings = SettingsDb::load(db).map_err(|e| e.to_string())?;
            for (key, value) in SettingsDb::entries(&settings) {
                let value = if key == "daemon_secret" && !value.is_empty() {
                    "********".to_string()
                } else {
                    value
                };
                println!("{:<26} {}", key, value);
            }
        }
        ConfigAction::Set { key, value } => {
            SettingsDb::update(db, key, value).map_err(|e| e.to_string())?;
            println!("{} = {}", key, value);
        }
        ConfigAction::Reset => {
            SettingsDb::save(db, &Settings::default()).map_err(|e| e.to_string())?;
            println!("Settings restored to defaults");
        }
    }
    Ok(())
}

fn apply_overrides(mut settings: Settings, cli: &Cli) -> Settings {
    if let Some(url) = &cli.daemon_url {
        settings.daemon_rpc_url = url.clone();
    }
    if let Some(secret) = &cli.daemon_secret {
        settings.daemon_secret = Some(secret.clone());
    }
    if let Some(provider) = &cli.provider {
        settings.search_provider_url = provider.clone();
    }
    if let Some(dir) = &cli.download_dir {
        settings.download_path = dir.clone();
    }
    settings
}

/// Blocking request/reply over the service channels
struct Session {
    commands: async_channel::Sender<EngineCommand>,
    messages: async_channel::Receiver<UiMessage>,
}

impl Session {
    fn send(&self, command: EngineCommand) -> Result<(), String> {
        self.commands
            .send_blocking(command)
            .map_err(|_| "download service stopped".to_string())
    }

    /// Block until `pick` accepts a message; an error message ends the wait
    fn wait<T>(&self, mut pick: impl FnMut(UiMessage) -> Option<T>) -> Result<T, String> {
        loop {
            match self.messages.recv_blocking() {
                Ok(UiMessage::Error(e)) => return Err(e),
                Ok(message) => {
                    if let Some(value) = pick(message) {
                        return Ok(value);
                    }
                }
                Err(_) => return Err("download service stopped".to_string()),
            }
        }
    }
}

fn dispatch(session: &Session, command: Command) -> Result<(), String> {
    match command {
        Command::Search {
            title,
            kind,
            season,
            episode,
            imdb,
            quality,
            all_seasons,
        } => {
            let request = RankingRequest {
                title,
                external_ids: imdb.map(|imdb| ExternalIds {
                    imdb: Some(imdb),
                    tmdb: None,
                }),
                kind: kind.into(),
                season,
                episode,
                quality_hint: quality,
            };
            session.send(match all_seasons {
                Some(season_count) => EngineCommand::SearchAllSeasons {
                    request,
                    season_count,
                },
                None => EngineCommand::Search(request),
            })?;

            let results = session.wait(|m| match m {
                UiMessage::SearchResults(results) => Some(results),
                _ => None,
            })?;
            if results.is_empty() {
                println!("No sources found");
            }
            for (i, c) in results.iter().enumerate() {
                println!(
                    "{:>2}. [{}{}] {}  {}  S:{} L:{}",
                    i + 1,
                    c.inferred_quality,
                    if c.is_likely_pack { ", pack" } else { "" },
                    c.file_name,
                    c.size_label,
                    c.seeders,
                    c.leechers
                );
                println!("    {}", c.source_uri);
            }
            Ok(())
        }

        Command::Add {
            source,
            title,
            kind,
            season,
            backend,
            filename,
            watch,
        } => {
            let backend = backend.map(Backend::from).unwrap_or_else(|| {
                if parse_magnet(&source).is_some() {
                    Backend::Swarm
                } else {
                    Backend::Daemon
                }
            });
            session.send(EngineCommand::AddTask(AddTaskRequest {
                source_uri: source,
                display_name: title,
                kind: kind.into(),
                backend,
                season,
                filename,
            }))?;

            let task = session.wait(|m| match m {
                UiMessage::TaskAdded(task) => Some(task),
                _ => None,
            })?;
            println!("Added {} -> {}", task.id, task.destination_path.display());
            if watch {
                follow(session, Some(&task.id))?;
            }
            Ok(())
        }

        Command::Pause { id } => transition(session, EngineCommand::Pause(id.clone()), &id),
        Command::Resume { id } => transition(session, EngineCommand::Resume(id.clone()), &id),
        Command::Cancel { id } => transition(session, EngineCommand::Cancel(id.clone()), &id),

        Command::Remove { id } => {
            session.send(EngineCommand::Remove(id))?;
            let id = session.wait(|m| match m {
                UiMessage::TaskRemoved { id } => Some(id),
                _ => None,
            })?;
            println!("Removed {}", id);
            Ok(())
        }

        Command::Tasks => {
            let tasks = list_tasks(session)?;
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in &tasks {
                print_task(task);
            }
            Ok(())
        }

        Command::History { clear, remove } => {
            if clear {
                session.send(EngineCommand::ClearHistory)?;
                let n = session.wait(|m| match m {
                    UiMessage::HistoryCleared(n) => Some(n),
                    _ => None,
                })?;
                println!("Removed {} history records", n);
                return Ok(());
            }
            if let Some(id) = remove {
                session.send(EngineCommand::RemoveHistory(id))?;
                let (id, removed) = session.wait(|m| match m {
                    UiMessage::HistoryRemoved { id, removed } => Some((id, removed)),
                    _ => None,
                })?;
                if removed {
                    println!("Removed {}", id);
                } else {
                    println!("No history record {}", id);
                }
                return Ok(());
            }

            session.send(EngineCommand::RefreshHistory)?;
            let records = session.wait(|m| match m {
                UiMessage::History(records) => Some(records),
                _ => None,
            })?;
            if records.is_empty() {
                println!("History is empty");
            }
            for r in records {
                println!(
                    "{:<11} {:>10}  {}  {}  ({})",
                    r.final_status.to_string(),
                    r.size_bytes.map(format_bytes).unwrap_or_else(|| "-".into()),
                    r.added_at,
                    r.display_name,
                    r.source_identifier
                );
            }
            Ok(())
        }

        Command::Stats => {
            session.send(EngineCommand::RefreshStats)?;
            let stats = session.wait(|m| match m {
                UiMessage::StatsUpdated(stats) => Some(stats),
                _ => None,
            })?;
            println!("Download: {}", format_speed(stats.download_speed));
            println!("Upload:   {}", format_speed(stats.upload_speed));
            println!(
                "Active: {}  Waiting: {}  Stopped: {}",
                stats.num_active, stats.num_waiting, stats.num_stopped
            );
            Ok(())
        }

        Command::Watch => {
            let tasks = list_tasks(session)?;
            let active = tasks.iter().filter(|t| !t.status.is_terminal()).count();
            for task in &tasks {
                print_task(task);
            }
            if active == 0 {
                println!("No active tasks");
                return Ok(());
            }
            follow(session, None)
        }

        Command::Config { .. } => Ok(()),
    }
}

/// Send a pause/resume/cancel and report the registry's verdict for `id`
fn transition(session: &Session, command: EngineCommand, id: &str) -> Result<(), String> {
    session.send(command)?;
    let outcome = session.wait(|m| match m {
        UiMessage::Transition { id: target, outcome } if target == id => Some(outcome),
        _ => None,
    })?;
    match outcome {
        TransitionOutcome::Applied(status) => {
            println!("{} is now {}", short_id(id), status);
            Ok(())
        }
        TransitionOutcome::InvalidTransition { from, requested } => Err(format!(
            "{} cannot move from {} to {}",
            short_id(id),
            from,
            requested
        )),
    }
}

fn list_tasks(session: &Session) -> Result<Vec<DownloadTask>, String> {
    session.send(EngineCommand::RefreshTasks)?;
    session.wait(|m| match m {
        UiMessage::TasksList(tasks) => Some(tasks),
        _ => None,
    })
}

/// Print updates until the followed task, or every task, is terminal
fn follow(session: &Session, only: Option<&str>) -> Result<(), String> {
    let mut open: Vec<String> = match only {
        Some(id) => vec![id.to_string()],
        None => list_tasks(session)?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect(),
    };

    while !open.is_empty() {
        let message = session.wait(|m| match m {
            UiMessage::TaskUpdated(task) => Some(Ok(task)),
            UiMessage::TaskStale { id, error } => Some(Err((id, error))),
            _ => None,
        })?;
        match message {
            Ok(task) if open.contains(&task.id) => {
                print_task(&task);
                if task.status.is_terminal() {
                    open.retain(|id| id != &task.id);
                }
            }
            Ok(_) => {}
            Err((id, error)) if open.contains(&id) => {
                println!("{}  (stale: {})", short_id(&id), error);
            }
            Err(_) => {}
        }
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..16).unwrap_or(id)
}

fn print_task(task: &DownloadTask) {
    let total = task.total_bytes.map(format_bytes).unwrap_or_else(|| "?".into());
    println!(
        "{:<16}  {:<11} {:>5.1}%  {} / {}  {}  ETA {}  {}{}",
        task.id,
        task.status.to_string(),
        task.progress * 100.0,
        format_bytes(task.downloaded_bytes),
        total,
        format_speed(task.speed_bytes_per_sec.unwrap_or(0)),
        format_eta(task.eta_seconds),
        task.title,
        if task.stale { " (stale)" } else { "" }
    );
}
