use clap::{Parser, Subcommand};
use ohtab::conversation::{ConversationService, CreateConversationRequest, HttpConversationService};
use ohtab::envelope::{Notification, PresentationMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "ohtab")]
#[command(about = "ohtab: chat with a remote agent conversation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: OHTAB_CONFIG_PATH or ~/.ohtab/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Chat with the agent (interactive). The first message creates the conversation; `/reset` starts over.
    Chat {
        /// Config file path (default: OHTAB_CONFIG_PATH or ~/.ohtab/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Service base URL (overrides OHTAB_BASE_URL and the config file)
        #[arg(long, value_name = "URL")]
        base_url: Option<String>,
    },

    /// Create a conversation with an initial message and print its id.
    Create {
        /// Config file path (default: OHTAB_CONFIG_PATH or ~/.ohtab/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Service base URL (overrides OHTAB_BASE_URL and the config file)
        #[arg(long, value_name = "URL")]
        base_url: Option<String>,

        /// Initial user message.
        message: String,
    },

    /// Print a conversation's details as JSON.
    Show {
        /// Config file path (default: OHTAB_CONFIG_PATH or ~/.ohtab/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Service base URL (overrides OHTAB_BASE_URL and the config file)
        #[arg(long, value_name = "URL")]
        base_url: Option<String>,

        /// Conversation id.
        id: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("ohtab {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, base_url }) => {
            if let Err(e) = run_chat(config, base_url).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Create {
            config,
            base_url,
            message,
        }) => {
            if let Err(e) = run_create(config, base_url, message).await {
                log::error!("create failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Show {
            config,
            base_url,
            id,
        }) => {
            if let Err(e) = run_show(config, base_url, id).await {
                log::error!("show failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(ohtab::config::default_config_path);
    let dir = ohtab::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Load config and pick the base URL: flag, then OHTAB_BASE_URL, then config file.
fn load_with_base_url(
    config_path: Option<std::path::PathBuf>,
    base_url: Option<String>,
) -> anyhow::Result<(ohtab::config::Config, String)> {
    let (config, _) = ohtab::config::load_config(config_path)?;
    let base_url = base_url
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| ohtab::config::resolve_base_url(&config));
    Ok((config, base_url))
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    base_url: Option<String>,
) -> anyhow::Result<()> {
    let (config, base_url) = load_with_base_url(config_path, base_url)?;
    log::info!("chatting via {}", base_url);

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let client = ohtab::conversation::client_from_config(&config, base_url.clone(), notify_tx);
    let client_task = tokio::spawn(client.run(msg_rx));

    println!("agent service: {} (type a message, /reset to start over, /exit to quit)", base_url);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                }
                let msg = if input.eq_ignore_ascii_case("/reset") {
                    PresentationMessage::ResetConversation
                } else {
                    PresentationMessage::UserPrompt {
                        text: input.to_string(),
                        attachments: Vec::new(),
                    }
                };
                msg_tx
                    .send(msg)
                    .map_err(|_| anyhow::anyhow!("conversation client stopped"))?;
            }
            Some(notification) = notify_rx.recv() => print_notification(&notification),
        }
    }

    drop(msg_tx);
    client_task.await?;
    while let Ok(notification) = notify_rx.try_recv() {
        print_notification(&notification);
    }
    Ok(())
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::Error(_) => eprintln!("{}", notification.display_line()),
        _ => println!("{}", notification.display_line()),
    }
}

async fn run_create(
    config_path: Option<std::path::PathBuf>,
    base_url: Option<String>,
    message: String,
) -> anyhow::Result<()> {
    let (config, base_url) = load_with_base_url(config_path, base_url)?;
    let service = HttpConversationService::new(base_url.clone());
    let request = CreateConversationRequest {
        initial_user_msg: message,
        repository: config.server.repository.clone(),
    };
    let created = service.create_conversation(&request).await?;
    println!("conversation {}", created.conversation_id);
    println!("status: {}", created.status.as_deref().unwrap_or("unknown"));
    println!("link: {}/conversations/{}", base_url, created.conversation_id);
    Ok(())
}

async fn run_show(
    config_path: Option<std::path::PathBuf>,
    base_url: Option<String>,
    id: String,
) -> anyhow::Result<()> {
    let (_, base_url) = load_with_base_url(config_path, base_url)?;
    let service = HttpConversationService::new(base_url);
    let details = service.get_conversation(&id).await?;
    println!("{}", serde_json::to_string_pretty(&details)?);
    Ok(())
}
