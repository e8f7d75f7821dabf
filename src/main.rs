mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dialoguer::Password;
use tracing_subscriber::EnvFilter;

use huddle::api::ApiClient;
use huddle::config::Config;
use huddle::engine::Engine;
use huddle::output::{OutputFormat, StdoutOutput};
use huddle::realtime::RealtimeSource;

#[derive(Parser)]
#[command(
    name = "huddle",
    version,
    about = "Terminal team chat",
    after_help = "Examples:\n  huddle login\n  huddle\n  huddle tail --json\n  RUST_LOG=huddle=debug huddle --config ./work.json"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, global = true, help = "Configuration file (default ~/.huddle.json)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Store an API token")]
    Login,
    #[command(about = "Print every incoming event without reading input")]
    Tail {
        #[arg(long, help = "Output one JSON object per line")]
        json: bool,
    },
    #[command(about = "Interactive chat (default)")]
    Chat,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config)?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Login => handle_login(&mut config).await,
        Command::Tail { json } => {
            let format = if json { OutputFormat::Json } else { OutputFormat::Text };
            let (engine, _) = connect(&config, format).await?;
            engine.run().await?;
            Ok(())
        }
        Command::Chat => {
            let (engine, output) = connect(&config, OutputFormat::Text).await?;
            repl::run(engine, output).await
        }
    }
}

async fn handle_login(config: &mut Config) -> Result<(), Box<dyn std::error::Error>> {
    let token: String = Password::new().with_prompt("API token").interact()?;
    let token = token.trim();
    if token.is_empty() {
        return Err("token is empty".into());
    }

    let name = ApiClient::new(&config.api_base_url, token).auth_test().await?;
    config.store_token(token)?;
    println!("Logged in as {name}. Token saved to {}.", config.path.display());
    Ok(())
}

async fn connect(
    config: &Config,
    format: OutputFormat,
) -> Result<(Arc<Engine>, Arc<StdoutOutput>), Box<dyn std::error::Error>> {
    let token = config
        .token
        .clone()
        .ok_or("no token configured, run `huddle login` first")?;
    let api = ApiClient::new(&config.api_base_url, token);
    let output = Arc::new(StdoutOutput::new(format, &config.time_format));
    let engine = Engine::new(
        Arc::new(api.clone()),
        Arc::new(RealtimeSource::new(api)),
        output.clone(),
        config.settings(),
    );
    engine.init().await?;
    output.set_username(&engine.username());
    Ok((Arc::new(engine), output))
}
