use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use cloudtitan::client::{self, Client, RemoteSession, RemoteWorker, WatchEvent};
use cloudtitan::config::{ClientConfig, ConfigManager, EnvConfig, ServerConfig, WorkerConfig};
use cloudtitan::logger::init_tracing;
use cloudtitan::server::Server;
use cloudtitan::worker::WorkerRuntime;
use titan_comm::mux::CLOSE_NORMAL;
use titan_comm::Value;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "cloudtitan", about = "Remote hardware job orchestration", version)]
struct Cli {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// File with `KEY=value` settings; variables already in the environment win
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestration server
    Serve(ServeArgs),

    /// Connect this machine's device to a server and run sessions
    Worker(ServeArgs),

    /// Submit a session
    Submit(SubmitArgs),

    /// Follow a session's output until it finishes
    Watch(SessionArgs),

    /// List your sessions
    List(ListArgs),

    /// Show one session
    Status(StatusArgs),

    /// Delete a session
    Remove(SessionArgs),

    /// List connected workers and the session each one runs
    Workers(ListArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Directory for the rolling text and JSON logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct RemoteArgs {
    /// Server address, e.g. ws://localhost:8080 (falls back to CLOUDTITAN_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Client token (falls back to CLOUDTITAN_AUTH_TOKEN)
    #[arg(long)]
    token: Option<String>,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    remote: RemoteArgs,

    /// Binaries to upload, referenced by file name in commands
    files: Vec<PathBuf>,

    /// A command such as "load-bitstream top.bit"; repeat for more
    #[arg(short, long = "command")]
    commands: Vec<String>,

    /// Session timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Follow the session after submitting it
    #[arg(long)]
    watch: bool,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[command(flatten)]
    remote: RemoteArgs,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Print JSON instead of a line of text
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SessionArgs {
    #[command(flatten)]
    remote: RemoteArgs,

    /// Session id
    id: String,
}

/// Where and as whom a client command connects.
struct Target {
    host: String,
    token: String,
    timeout: Duration,
}

impl Target {
    async fn resolve(args: &RemoteArgs, config: &ConfigManager) -> Result<Self> {
        let defaults = ClientConfig::load(config).await?;
        let Some(host) = args.host.clone().or(defaults.host) else {
            bail!("no server given; pass --host or set CLOUDTITAN_HOST");
        };
        Ok(Self {
            host,
            token: args.token.clone().or(defaults.auth_token).unwrap_or_default(),
            timeout: defaults.timeout,
        })
    }

    async fn client(&self) -> Result<Client> {
        Client::connect(&self.host, &self.token, self.timeout).await
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let cli = Cli::parse();
    let config = ConfigManager(EnvConfig::load(&cli.env_file));

    let result = match cli.command {
        Commands::Serve(args) => serve(args, &cli.log_level, &config).await,
        Commands::Worker(args) => work(args, &cli.log_level, &config).await,
        Commands::Submit(args) => submit(args, &config).await,
        Commands::Watch(args) => follow(args, &config).await,
        Commands::List(args) => list(args, &config).await,
        Commands::Status(args) => status(args, &config).await,
        Commands::Remove(args) => remove(args, &config).await,
        Commands::Workers(args) => workers(args, &config).await,
    };

    if let Err(err) = result {
        error!("{err:#}");
        eprintln!("❌ {err:#}");
        process::exit(1);
    }
}

// -----------------------------------------------------------------------------
// Long running processes
// -----------------------------------------------------------------------------

async fn serve(args: ServeArgs, log_level: &str, config: &ConfigManager) -> Result<()> {
    let _logs = init_tracing(args.log_dir, "cloudtitan.log", "cloudtitan-events.json", log_level)?;
    let server_config = ServerConfig::load(config).await?;
    let server = Server::bootstrap(server_config).await?;

    info!("cloudtitan server running; press Ctrl-C to exit");
    tokio::select! {
        result = server.listen() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("shutting down");
        }
    }
    Ok(())
}

async fn work(args: ServeArgs, log_level: &str, config: &ConfigManager) -> Result<()> {
    let _logs = init_tracing(args.log_dir, "cloudtitan-worker.log", "cloudtitan-worker-events.json", log_level)?;
    let runtime = WorkerRuntime::from_config(WorkerConfig::load(config).await?);

    let reconnect = async {
        loop {
            match runtime.run().await {
                Ok(frame) if frame.code == CLOSE_NORMAL => info!("disconnected"),
                Ok(frame) => warn!(code = frame.code, reason = %frame.reason, "link closed"),
                Err(err) => warn!(error = %format!("{err:#}"), "link failed"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    };

    info!("cloudtitan worker running; press Ctrl-C to exit");
    tokio::select! {
        _ = reconnect => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("shutting down");
            Ok(())
        }
    }
}

// -----------------------------------------------------------------------------
// Client commands
// -----------------------------------------------------------------------------

async fn submit(args: SubmitArgs, config: &ConfigManager) -> Result<()> {
    let target = Target::resolve(&args.remote, config).await?;
    let binaries = client::read_binaries(&args.files).await?;
    let commands: Vec<_> = args
        .commands
        .iter()
        .map(|raw| client::parse_command(raw))
        .filter(|command| !command.is_empty())
        .collect();

    let client = target.client().await?;
    let id = client
        .submit(&binaries, &commands, args.timeout_secs.map(Duration::from_secs))
        .await;
    client.close().await;
    let id = id?;
    println!("{id}");

    if args.watch {
        watch(&target, &id).await?;
    }
    Ok(())
}

async fn list(args: ListArgs, config: &ConfigManager) -> Result<()> {
    let target = Target::resolve(&args.remote, config).await?;
    let client = target.client().await?;
    let sessions = client.list().await;
    client.close().await;
    let sessions = sessions?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        for session in &sessions {
            println!("{}", describe(session));
        }
    }
    Ok(())
}

async fn status(args: StatusArgs, config: &ConfigManager) -> Result<()> {
    let target = Target::resolve(&args.session.remote, config).await?;
    let client = target.client().await?;
    let session = client.status(&args.session.id).await;
    client.close().await;
    let session = session?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        println!("{}", describe(&session));
    }
    Ok(())
}

async fn remove(args: SessionArgs, config: &ConfigManager) -> Result<()> {
    let target = Target::resolve(&args.remote, config).await?;
    let client = target.client().await?;
    let removed = client.remove(&args.id).await;
    client.close().await;
    if !removed? {
        bail!("no session {}", args.id);
    }
    println!("removed {}", args.id);
    Ok(())
}

async fn workers(args: ListArgs, config: &ConfigManager) -> Result<()> {
    let target = Target::resolve(&args.remote, config).await?;
    let client = target.client().await?;
    let workers = client.workers().await;
    client.close().await;
    let workers = workers?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&workers)?);
    } else {
        for worker in &workers {
            println!("{}", describe_worker(worker));
        }
    }
    Ok(())
}

fn describe_worker(worker: &RemoteWorker) -> String {
    let doing = worker.session.as_deref().unwrap_or("idle");
    format!("{:<16} since {}  {doing}", worker.name, worker.connected)
}

fn describe(session: &RemoteSession) -> String {
    let place = match session.position {
        Some(0) => "running".to_string(),
        Some(position) => format!("#{position} of {} workers", session.workers),
        None => String::new(),
    };
    format!(
        "{}  {:<8} restarts={}  {}  {place}",
        session.id, session.status, session.restarts, session.created
    )
}

async fn follow(args: SessionArgs, config: &ConfigManager) -> Result<()> {
    let target = Target::resolve(&args.remote, config).await?;
    watch(&target, &args.id).await
}

async fn watch(target: &Target, id: &str) -> Result<()> {
    let conn = client::connect_watch(&target.host, &target.token, id, target.timeout).await?;
    let frame = client::watch(&conn, print_event).await?;
    if frame.code != CLOSE_NORMAL {
        bail!("stream closed: {} ({})", frame.reason, frame.code);
    }
    Ok(())
}

fn text(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match (arg.as_str(), arg.to_bytes()) {
            (Some(s), _) => s.to_string(),
            (None, Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            (None, None) => format!("{arg:?}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_event(event: WatchEvent) {
    match event {
        WatchEvent::Queued { position, workers } => {
            println!("queued at position {position} ({workers} workers online)")
        }
        WatchEvent::Pending => println!("waiting for a worker"),
        WatchEvent::Started => println!("started"),
        WatchEvent::Finished => println!("finished"),
        WatchEvent::Deleted => println!("deleted"),
        WatchEvent::Remote { event, args, .. } => match event.as_str() {
            "prompt" => println!("$ {}", text(&args)),
            "console" | "command" => {
                let mut stdout = std::io::stdout().lock();
                for bytes in args.iter().filter_map(Value::to_bytes) {
                    let _ = stdout.write_all(&bytes);
                }
                let _ = stdout.flush();
            }
            "error" => eprintln!("error: {}", text(&args)),
            "timeout" => eprintln!("session timed out"),
            "done" => {}
            other => println!("{other}: {}", text(&args)),
        },
    }
}
