use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use resumo_client::{BoundSession, ResumoConfig, SessionClient, TurnEvent};
use resumo_core::{SessionId, SessionRecord};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "resumo", about = "Resumo: persistent, resumable conversation sessions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "resumo.toml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session, or resume one, and chat interactively
    Chat {
        /// Session to resume
        #[arg(short, long)]
        session: Option<String>,
        /// Metadata for a new session, as key=value (repeatable)
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },
    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List stored sessions
    List,
    /// Print a session's metadata and turns
    Show { id: String },
    /// Delete a session
    Delete { id: String },
    /// Close a session so it can no longer be resumed
    Close { id: String },
    /// Delete sessions idle for longer than the given number of days
    Expire {
        #[arg(long)]
        older_than_days: u32,
    },
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn parse_id(raw: &str) -> anyhow::Result<SessionId> {
    SessionId::parse(raw).with_context(|| format!("invalid session id '{raw}'"))
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let mut config = ResumoConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config.display()))?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    let client = SessionClient::from_config(&config).await?;
    info!(
        data_dir = %config.storage.data_dir.display(),
        channel = client.channel_name(),
        sessions = client.registry().len(),
        "Resumo ready"
    );

    match cli.command {
        Commands::Chat { session, tags } => {
            let id = session.as_deref().map(parse_id).transpose()?;
            let metadata: BTreeMap<String, String> = tags.into_iter().collect();
            let bound = client.start_or_resume_session_with(id, metadata).await?;
            chat(bound).await?;
        }
        Commands::Sessions { action } => sessions(&client, action).await?,
    }

    Ok(())
}

async fn chat(mut session: BoundSession) -> anyhow::Result<()> {
    let verb = if session.is_resumed() { "Resumed" } else { "Started" };
    let turns = session.record().map_or(0, SessionRecord::turn_count);
    println!(
        "{verb} session {} ({turns} turns). /close ends it, /exit or EOF leaves it resumable.",
        session.session_id()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/close" => {
                let id = session.session_id().clone();
                session.close().await?;
                println!("Closed session {id}.");
                return Ok(());
            }
            "/id" => {
                println!("{}", session.session_id());
                continue;
            }
            _ => {}
        }

        let mut chunks = session.submit_turn(line).await?;
        let mut at_line_start = true;
        while let Some(event) = chunks.next().await {
            match event {
                Ok(TurnEvent::Text(text)) => {
                    print!("{text}");
                    std::io::stdout().flush()?;
                    at_line_start = text.ends_with('\n');
                }
                Ok(TurnEvent::Block(block)) => {
                    println!("{block}");
                    at_line_start = true;
                }
                Ok(TurnEvent::Committed(_)) => {
                    if !at_line_start {
                        println!();
                    }
                }
                Err(e) => {
                    if !at_line_start {
                        println!();
                    }
                    eprintln!("error: {e}");
                }
            }
        }
    }

    let id = session.session_id().clone();
    session.suspend();
    println!("Session {id} saved. Resume with: resumo chat --session {id}");
    Ok(())
}

async fn sessions(client: &SessionClient, action: SessionAction) -> anyhow::Result<()> {
    match action {
        SessionAction::List => {
            let sessions = client.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for s in sessions {
                println!(
                    "{}  created {}  last active {}  {} turns{}",
                    s.id,
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                    s.last_active_at.format("%Y-%m-%d %H:%M:%S"),
                    s.turn_count,
                    if s.closed { "  (closed)" } else { "" }
                );
            }
        }
        SessionAction::Show { id } => {
            let record = client.load_session(&parse_id(&id)?).await?;
            println!("id: {}", record.id);
            println!("created: {}", record.created_at.to_rfc3339());
            println!("last active: {}", record.last_active_at.to_rfc3339());
            if let Some(closed_at) = record.closed_at {
                println!("closed: {}", closed_at.to_rfc3339());
            }
            for (key, value) in &record.metadata {
                println!("{key}: {value}");
            }
            for turn in &record.turns {
                let content = match turn.text() {
                    Some(text) => text.to_string(),
                    None => serde_json::to_string(&turn.content)?,
                };
                println!("[{}] {}: {}", turn.sequence, turn.role, content);
            }
        }
        SessionAction::Delete { id } => {
            let id = parse_id(&id)?;
            if client.delete_session(&id).await? {
                println!("Deleted session {id}.");
            } else {
                println!("No session {id}.");
            }
        }
        SessionAction::Close { id } => {
            let id = parse_id(&id)?;
            client.close_session(&id).await?;
            println!("Closed session {id}.");
        }
        SessionAction::Expire { older_than_days } => {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let expired = client.expire_sessions(cutoff).await?;
            println!("Expired {} session(s).", expired.len());
            for id in expired {
                println!("  {id}");
            }
        }
    }
    Ok(())
}
