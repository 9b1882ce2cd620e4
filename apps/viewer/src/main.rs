use std::{collections::HashSet, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{ConversationViewport, PollConfig, SyncClient, ViewportEvent};
use gateway::Gateway;
use shared::domain::{ConversationId, Message, MessageId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Terminal viewer for one conversation mirrored through a relay.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    server_url: String,
    /// Conversation to open. Defaults to the first one listed.
    #[arg(long)]
    group: Option<String>,
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let args = Args::parse();

    let client = SyncClient::for_relay(&args.server_url)?.with_poll_config(PollConfig {
        interval: Duration::from_secs(args.poll_secs.max(1)),
        ..PollConfig::default()
    });
    let gateway = client.gateway();
    let me = gateway
        .fetch_current_user()
        .await
        .with_context(|| format!("relay at {} is not reachable", args.server_url))?;
    println!("signed in as {} ({})", me.name, me.user_id);

    let groups = gateway.fetch_groups().await?;
    for group in &groups {
        println!("  {}  {}", group.id, group.name);
    }
    let conversation_id = match args.group {
        Some(id) => ConversationId::new(id),
        None => match groups.first() {
            Some(group) => group.id.clone(),
            None => bail!("relay lists no conversations"),
        },
    };
    if !groups.iter().any(|group| group.id == conversation_id) {
        bail!("conversation {conversation_id} is not listed by the relay");
    }

    let viewport = client.mount(conversation_id.clone()).await;
    println!("watching {conversation_id}; type to post, /older for history, /reconnect, /quit");
    let result = run(&viewport).await;
    viewport.unmount().await;
    result
}

async fn run(viewport: &ConversationViewport) -> Result<()> {
    let mut events = viewport.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = HashSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reconnect" => viewport.reconnect(),
                    "/older" => match viewport.load_older().await {
                        Ok(outcome) => {
                            println!("-- {} older message(s)", outcome.inserted);
                            print_new(viewport, &mut printed).await;
                        }
                        Err(err) => warn!(%err, "history fetch failed"),
                    },
                    text => {
                        if let Err(err) = viewport.send(text).await {
                            println!("!! not sent: {err}");
                        }
                    }
                }
            }
            event = events.recv() => match event {
                Ok(ViewportEvent::MessagesInserted { .. }) | Err(RecvError::Lagged(_)) => {
                    print_new(viewport, &mut printed).await;
                }
                Ok(ViewportEvent::ConnectionChanged(state)) => println!("-- push {state:?}"),
                Ok(ViewportEvent::GroupCreated(group)) => {
                    println!("-- new conversation {} ({})", group.name, group.id);
                }
                Ok(ViewportEvent::MemberJoined { member, .. }) => {
                    println!("-- {} joined", member.nickname);
                }
                Ok(ViewportEvent::MemberLeft { user_id, .. }) => println!("-- {user_id} left"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn print_new(viewport: &ConversationViewport, printed: &mut HashSet<MessageId>) {
    for message in viewport.messages().await {
        if printed.insert(message.id.clone()) {
            println!("{}", render(&message));
        }
    }
}

fn render(message: &Message) -> String {
    let body = message.text.as_deref().unwrap_or("<attachment>");
    if message.system {
        return format!("[{}] * {body}", message.created_at.format("%H:%M:%S"));
    }
    format!(
        "[{}] {}: {body}",
        message.created_at.format("%H:%M:%S"),
        message.name
    )
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
