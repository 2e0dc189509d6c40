use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use client_core::{load_settings, ChatSession, ClientEvent, CredentialPair, SessionRedirect};
use shared::domain::{ChannelId, ConversationKey, UserId};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long)]
    user_id: String,
    /// Overrides `api_base_url` from client.toml and the environment.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long, default_value = "credentials.json")]
    credentials: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stores a token pair obtained from the login endpoint.
    Login {
        access_token: String,
        refresh_token: String,
        #[arg(long, default_value_t = 900)]
        expires_in: u64,
    },
    Refresh,
    Tail {
        channel_id: String,
    },
    Send {
        channel_id: String,
        message: String,
    },
    Dm {
        receiver_id: String,
        message: String,
    },
    Threads,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    settings.credentials_path = Some(cli.credentials);
    let session = ChatSession::new(settings, UserId::new(cli.user_id))?;

    match cli.command {
        Command::Login {
            access_token,
            refresh_token,
            expires_in,
        } => {
            let lifetime = chrono::Duration::try_seconds(i64::try_from(expires_in)?)
                .context("token lifetime out of range")?;
            session
                .login(CredentialPair::new(
                    access_token,
                    refresh_token,
                    Utc::now() + lifetime,
                ))
                .await;
            println!("credentials saved for user_id={}", session.user_id());
        }
        Command::Refresh => {
            let token = session.request_guard().refresh().refresh().await?;
            println!("refreshed; new access token ends in ...{}", tail(&token));
        }
        Command::Tail { channel_id } => {
            session.start().await?;
            let channel_id = ChannelId::new(channel_id);
            let key = ConversationKey::Channel(channel_id.clone());
            let mut events = session.subscribe_events();
            let mut printed = 0;
            for entry in session.open_channel(channel_id).await? {
                println!("[{}] {}: {}", entry.timestamp, entry.sender_id, entry.content);
                printed += 1;
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(ClientEvent::TimelineUpdated { conversation }) if conversation == key => {
                            let timeline = session.timeline(&key).await;
                            for entry in timeline.iter().skip(printed) {
                                println!("[{}] {}: {}", entry.timestamp, entry.sender_id, entry.content);
                            }
                            printed = timeline.len();
                        }
                        Ok(ClientEvent::ConnectionStateChanged(state)) => {
                            eprintln!("connection: {state:?}");
                        }
                        Ok(ClientEvent::SessionExpired { redirect }) => {
                            bail!("session expired; log in again ({})", redirect_hint(redirect));
                        }
                        Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                        Ok(_) => {}
                        Err(_) => break,
                    },
                }
            }
            session.shutdown().await;
        }
        Command::Send {
            channel_id,
            message,
        } => {
            session.start().await?;
            session.open_channel(ChannelId::new(channel_id)).await?;
            let envelope = session.send_message(&message).await?;
            println!(
                "{} {}",
                envelope.local_id,
                serde_json::to_string(&envelope.delivery_state)?
            );
            session.shutdown().await;
        }
        Command::Dm {
            receiver_id,
            message,
        } => {
            session.start().await?;
            let envelope = session
                .send_direct_message(UserId::new(receiver_id), &message)
                .await?;
            println!(
                "{} {}",
                envelope.local_id,
                serde_json::to_string(&envelope.delivery_state)?
            );
            session.shutdown().await;
        }
        Command::Threads => {
            for thread in session.load_direct_threads().await? {
                let partner = thread
                    .other_user
                    .map(|user| format!("{} ({})", user.username, user.id))
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{partner}: {} messages", thread.messages.len());
            }
        }
    }

    Ok(())
}

fn tail(token: &str) -> &str {
    let start = token
        .char_indices()
        .rev()
        .nth(5)
        .map(|(index, _)| index)
        .unwrap_or(0);
    &token[start..]
}

fn redirect_hint(redirect: SessionRedirect) -> &'static str {
    match redirect {
        SessionRedirect::Home => "/",
        SessionRedirect::Login => "/login",
    }
}
