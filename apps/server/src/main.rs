use anyhow::Context;
use clap::{Parser, Subcommand};
use murmur_chats::ChatError;
use murmur_config::load as load_config;
use murmur_runtime::{telemetry, BackendServices};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "murmur-server")]
#[command(about = "Murmur chat backend (console by default)")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the publisher and expiry sweeper until Ctrl-C
    Serve,
    /// Start interactive console (default)
    Console,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Console) {
        Commands::Serve => run_server().await,
        Commands::Console => run_console().await,
    }
}

async fn initialise() -> anyhow::Result<BackendServices> {
    telemetry::init_tracing().context("failed to initialise tracing")?;

    let config = load_config().context("failed to load configuration")?;

    BackendServices::initialise(&config)
        .await
        .context("failed to initialise backend services")
}

async fn run_server() -> anyhow::Result<()> {
    let services = initialise().await?;
    info!(backend = ?services.backend, "starting Murmur backend");

    let tasks = services.start();
    murmur_runtime::shutdown_signal().await;
    tasks.shutdown().await;

    info!("backend shut down");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Help,
    Quit,
    NewChat { ttl_seconds: i64, readonly: bool },
    Post { chat_id: Uuid, body: String },
    Act { user_id: Uuid },
    History { chat_id: Uuid },
    Count,
    Pending,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self, String> {
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        match name {
            "/help" | "/h" => Ok(Self::Help),
            "/quit" | "/exit" | "/q" => Ok(Self::Quit),
            "/chat" => {
                let mut ttl_seconds = 0;
                let mut readonly = false;
                for arg in rest.split_whitespace() {
                    match arg {
                        "ro" | "readonly" => readonly = true,
                        ttl => {
                            ttl_seconds = ttl
                                .parse()
                                .map_err(|_| format!("invalid ttl '{ttl}'"))?;
                        }
                    }
                }
                Ok(Self::NewChat {
                    ttl_seconds,
                    readonly,
                })
            }
            "/post" => {
                let (chat, body) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| "usage: /post <chat> <text>".to_string())?;
                Ok(Self::Post {
                    chat_id: parse_id(chat)?,
                    body: body.trim().to_string(),
                })
            }
            "/as" => Ok(Self::Act {
                user_id: parse_id(rest)?,
            }),
            "/history" => Ok(Self::History {
                chat_id: parse_id(rest)?,
            }),
            "/count" => Ok(Self::Count),
            "/pending" => Ok(Self::Pending),
            other => Err(format!("unknown command '{other}', try /help")),
        }
    }
}

fn parse_id(value: &str) -> Result<Uuid, String> {
    Uuid::parse_str(value.trim()).map_err(|_| format!("invalid id '{value}'"))
}

async fn run_console() -> anyhow::Result<()> {
    let services = initialise().await?;
    info!("starting interactive console");
    let tasks = services.start();

    let mut user_id = Uuid::new_v4();

    println!("Murmur Interactive Console");
    println!("Acting as {user_id}");
    println!("Type commands like '/help', '/chat', '/post', '/history', '/quit'");
    println!("Use Ctrl+C or '/quit' to exit");
    println!("---");

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        print!("> ");
        std::io::Write::flush(&mut std::io::stdout())?;

        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break; // EOF
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(input) {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        let chats = &services.chat_service;
        match command {
            ConsoleCommand::Quit => {
                println!("Goodbye!");
                break;
            }
            ConsoleCommand::Help => {
                println!("Available commands:");
                println!("  /help, /h               - Show this help");
                println!("  /chat [ttl] [ro]        - Open a chat owned by the current user");
                println!("  /post <chat> <text>     - Post a message");
                println!("  /as <user>              - Switch the current user");
                println!("  /history <chat>         - Show retained messages");
                println!("  /count                  - Number of live chats");
                println!("  /pending                - Outbox records awaiting delivery");
                println!("  /quit, /exit, /q        - Exit console");
            }
            ConsoleCommand::NewChat {
                ttl_seconds,
                readonly,
            } => match chats.new_chat(user_id, readonly, ttl_seconds).await {
                Ok(chat) => println!("Chat {} open until {}", chat.id, chat.deadline),
                Err(error) => report(&error),
            },
            ConsoleCommand::Post { chat_id, body } => {
                match chats.new_message(chat_id, user_id, body).await {
                    Ok(message) => println!("Posted message {}", message.id),
                    Err(error) => report(&error),
                }
            }
            ConsoleCommand::Act { user_id: next } => {
                user_id = next;
                println!("Acting as {user_id}");
            }
            ConsoleCommand::History { chat_id } => match chats.chat_history(chat_id).await {
                Ok(messages) if messages.is_empty() => println!("No messages"),
                Ok(messages) => {
                    for message in messages {
                        println!(
                            "  [{}] {} {}: {}",
                            message.id, message.published_at, message.author_id, message.body
                        );
                    }
                }
                Err(error) => report(&error),
            },
            ConsoleCommand::Count => match services.store.chats_count().await {
                Ok(count) => println!("{count} live chats"),
                Err(error) => println!("Error: {error}"),
            },
            ConsoleCommand::Pending => match services.outbox.pending_count().await {
                Ok(count) => println!("{count} pending outbox records"),
                Err(error) => println!("Error: {error}"),
            },
        }
    }

    tasks.shutdown().await;
    Ok(())
}

fn report(error: &ChatError) {
    if let Some(chat) = error.stored_chat() {
        println!("Chat {} created, but its event was not queued", chat.id);
    } else if let Some(message) = error.stored_message() {
        println!("Message {} posted, but its event was not queued", message.id);
    } else {
        println!("Error: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_arguments_are_optional_and_unordered() {
        assert_eq!(
            ConsoleCommand::parse("/chat"),
            Ok(ConsoleCommand::NewChat {
                ttl_seconds: 0,
                readonly: false
            })
        );
        assert_eq!(
            ConsoleCommand::parse("/chat ro 30"),
            Ok(ConsoleCommand::NewChat {
                ttl_seconds: 30,
                readonly: true
            })
        );
        assert!(ConsoleCommand::parse("/chat soon").is_err());
    }

    #[test]
    fn post_keeps_the_whole_body() {
        let chat_id = Uuid::new_v4();
        assert_eq!(
            ConsoleCommand::parse(&format!("/post {chat_id} hello there  world")),
            Ok(ConsoleCommand::Post {
                chat_id,
                body: "hello there  world".to_string()
            })
        );
        assert!(ConsoleCommand::parse(&format!("/post {chat_id}")).is_err());
    }

    #[test]
    fn ids_must_be_uuids() {
        assert!(ConsoleCommand::parse("/history 42").is_err());
        assert!(ConsoleCommand::parse("/as").is_err());
        assert_eq!(ConsoleCommand::parse("/pending"), Ok(ConsoleCommand::Pending));
        assert!(ConsoleCommand::parse("/nope").is_err());
    }
}
