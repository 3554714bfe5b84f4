use clap::{Parser, Subcommand};
use lib::runtime::{Event, Snapshot};
use lib::session::{BackendChoice, ModeState};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default config file.
    Init {
        /// Config file path (default: TANDEM_CONFIG_PATH or ~/.tandem/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat interactively. /local and /cloud switch backends, /help lists the rest.
    Chat {
        /// Config file path (default: TANDEM_CONFIG_PATH or ~/.tandem/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("tandem {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config }) => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!(
        "initialized configuration at {}",
        path.parent().unwrap_or(std::path::Path::new(".")).display()
    );
    Ok(())
}

fn print_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn render_turn(turn: &lib::history::Turn) {
    let marker = if turn.from_user { ">" } else { "<" };
    if turn.image.is_some() {
        println!("{} {} (image attached)", marker, turn.text);
    } else {
        println!("{} {}", marker, turn.text);
    }
}

fn status_line(state: &Snapshot) -> String {
    match state.mode {
        ModeState::Cloud => "Cloud".to_string(),
        ModeState::LocalLoading => "Local — loading".to_string(),
        ModeState::LocalReady => format!(
            "Local — {}",
            state.active_model.as_deref().unwrap_or("(unknown model)")
        ),
    }
}

fn print_help() {
    println!("commands:");
    println!("  /local          switch to the on-device model (loads it on first use)");
    println!("  /cloud          switch back to the cloud backend");
    println!("  /cancel         cancel an in-flight model load");
    println!("  /attach <path>  stage an image for the next message");
    println!("  /detach         drop the staged image");
    println!("  /status         show the active backend");
    println!("  /reset          clear the conversation (asks for confirmation)");
    println!("  /exit           leave");
}

async fn run_chat(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;

    let history_dir = lib::config::resolve_history_dir(&config, &path);
    let history = lib::history::HistoryStore::open(Box::new(lib::history::FileStore::new(history_dir)));
    let session = lib::session::ChatSession::new(history);

    let cloud = Arc::new(lib::llm::CloudClient::new(
        lib::config::resolve_cloud_endpoint(&config),
        std::time::Duration::from_secs(config.cloud.request_timeout_secs),
    ));
    let provider = Arc::new(lib::llm::OllamaProvider::new(config.local.base_url.clone()));
    let options = lib::runtime::RuntimeOptions::from_config(&config);
    let max_attachment_bytes = config.attachments.max_bytes;

    let (handle, mut events) = lib::runtime::spawn_session(session, cloud, provider, options);

    // Replay the persisted conversation; greet on a fresh one.
    let turns = handle.history().await;
    for turn in &turns {
        render_turn(turn);
    }
    if turns.is_empty() {
        println!("Welcome! You are chatting in cloud mode. /local switches to the on-device model, /help lists commands.");
    }

    let local_available = handle
        .state()
        .await
        .map(|s| s.local_available)
        .unwrap_or(false);
    if !local_available {
        println!("(no local engine detected; /local is disabled)");
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut pending_reset = false;
    print_prompt();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim().to_string();
                if input.is_empty() {
                    print_prompt();
                    continue;
                }

                if pending_reset {
                    pending_reset = false;
                    if input.eq_ignore_ascii_case("y") || input.eq_ignore_ascii_case("yes") {
                        handle.reset_history();
                    } else {
                        println!("reset aborted");
                        print_prompt();
                    }
                    continue;
                }

                match input.as_str() {
                    "/exit" | "/quit" => break,
                    "/help" => {
                        print_help();
                        print_prompt();
                    }
                    "/local" => {
                        if local_available {
                            handle.select_backend(BackendChoice::Local);
                        } else {
                            println!("! no local engine detected; staying in cloud mode");
                            print_prompt();
                        }
                    }
                    "/cloud" => {
                        handle.select_backend(BackendChoice::Cloud);
                        print_prompt();
                    }
                    "/cancel" => {
                        handle.cancel_load();
                        print_prompt();
                    }
                    "/detach" => {
                        handle.clear_attachment();
                        println!("(attachment dropped)");
                        print_prompt();
                    }
                    "/status" => {
                        match handle.state().await {
                            Some(state) => println!("mode: {}", status_line(&state)),
                            None => println!("! session is gone"),
                        }
                        print_prompt();
                    }
                    "/reset" => {
                        pending_reset = true;
                        println!("clear the conversation? (y/N)");
                    }
                    other if other.starts_with("/attach") => {
                        let arg = other.trim_start_matches("/attach").trim();
                        if arg.is_empty() {
                            println!("usage: /attach <path>");
                        } else {
                            match lib::attachment::read_image(std::path::Path::new(arg), max_attachment_bytes).await {
                                Ok(attachment) => {
                                    println!("(staged {} for the next message)", attachment.filename);
                                    handle.attach(attachment);
                                }
                                Err(e) => println!("! {}", e),
                            }
                        }
                        print_prompt();
                    }
                    other if other.starts_with('/') => {
                        println!("! unknown command {} (/help lists commands)", other);
                        print_prompt();
                    }
                    _ => {
                        handle.send(input);
                    }
                }
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    Event::UserTurn(_) => {}
                    Event::TurnStarted => {
                        println!("(thinking…)");
                    }
                    Event::BotTurn(turn) => {
                        println!("< {}", turn.text.trim());
                        print_prompt();
                    }
                    Event::ModeChanged { mode, model } => {
                        let state = match (mode, model) {
                            (ModeState::LocalReady, Some(model)) => format!("Local — {}", model),
                            (ModeState::LocalReady, None) => "Local".to_string(),
                            (ModeState::LocalLoading, _) => "Local — loading".to_string(),
                            (ModeState::Cloud, _) => "Cloud".to_string(),
                        };
                        println!("mode: {}", state);
                        if mode != ModeState::LocalLoading {
                            print_prompt();
                        }
                    }
                    Event::LoadProgress { phase, text, progress, .. } => {
                        let label = phase.map(|p| p.label()).unwrap_or("loading");
                        match progress {
                            Some(fraction) => {
                                println!("[{}] {} ({:.0}%)", label, text, fraction * 100.0);
                            }
                            None => println!("[{}] {}", label, text),
                        }
                    }
                    Event::Notice(text) => {
                        println!("! {}", text);
                        print_prompt();
                    }
                    Event::HistoryCleared => {
                        println!("(conversation cleared)");
                        print_prompt();
                    }
                }
            }
        }
    }

    handle.shutdown();
    Ok(())
}
