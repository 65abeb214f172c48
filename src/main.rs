// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use fabric_domain::FabricStore;
use fabric_eventlog::EventLog;
use fabric_service::{AttachArtifactParams, FabricService, ReplyParams, SendMessageParams};
use fabric_session::{Session, SessionIndex, SessionIndexEntry, SessionMetadata};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let _config = fabric_config::load(cli.config.as_deref()).context("loading runtime config")?;

    match cli.command {
        Commands::Init { dir, id, creator } => init_session(&dir, &id, &creator).await,
        Commands::Post { dir, channel, content, creator, kind } => {
            post_message(&dir, &channel, &content, &creator, kind.into()).await
        }
        Commands::Reply { dir, message_id, content, creator, kind } => {
            post_reply(&dir, &message_id, &content, &creator, kind.into()).await
        }
        Commands::Attach { dir, target_id, path, name, creator } => {
            attach_artifact(&dir, &target_id, &path, name, &creator).await
        }
        Commands::Replay { dir } => replay_session(&dir),
        Commands::Close { dir, status } => close_session(&dir, &status),
    }
}

/// Opens the event log, restores a fresh domain store from it, and returns a
/// `FabricService` that appends every new event back to the same log. The
/// returned log must be `close().await`ed by the caller once done.
fn restore_service(dir: &Path) -> anyhow::Result<(FabricService, Arc<EventLog>)> {
    let events = fabric_eventlog::load(dir).context("loading fabric event log")?;
    let store = FabricStore::new();
    fabric_eventlog::restore(&events, &store).context("restoring fabric domain store")?;

    let log = Arc::new(EventLog::open(dir).context("opening fabric event log")?);
    let service = FabricService::new(Arc::new(store), log.clone().as_handler());
    Ok((service, log))
}

async fn init_session(dir: &Path, id: &str, creator: &str) -> anyhow::Result<()> {
    Session::new(id.to_string(), dir.to_path_buf())
        .await
        .context("creating session directory")?;

    let store = FabricStore::new();
    let log = Arc::new(EventLog::open(dir).context("opening fabric event log")?);
    let service = FabricService::new(Arc::new(store), log.clone().as_handler());
    service.init_session(creator).context("initializing fixed channels")?;
    log.close().await.context("closing fabric event log")?;

    println!("session {id} initialized at {}", dir.display());
    Ok(())
}

async fn post_message(dir: &Path, channel: &str, content: &str, creator: &str, kind: fabric_domain::MessageKind) -> anyhow::Result<()> {
    let (service, log) = restore_service(dir)?;
    let thread = service
        .send_message(SendMessageParams {
            channel_slug: channel.to_string(),
            content: content.to_string(),
            kind: Some(kind),
            creator: creator.to_string(),
            mentions: None,
            metadata: Default::default(),
        })
        .context("posting message")?;
    log.close().await.context("closing fabric event log")?;
    println!("{}", thread.id);
    Ok(())
}

async fn post_reply(dir: &Path, message_id: &str, content: &str, creator: &str, kind: fabric_domain::MessageKind) -> anyhow::Result<()> {
    let (service, log) = restore_service(dir)?;
    let thread = service
        .reply(ReplyParams {
            message_id: message_id.to_string(),
            content: content.to_string(),
            kind: Some(kind),
            creator: creator.to_string(),
            mentions: None,
            metadata: Default::default(),
        })
        .context("posting reply")?;
    log.close().await.context("closing fabric event log")?;
    println!("{}", thread.id);
    Ok(())
}

async fn attach_artifact(dir: &Path, target_id: &str, path: &Path, name: Option<String>, creator: &str) -> anyhow::Result<()> {
    let (service, log) = restore_service(dir)?;
    let thread = service
        .attach_artifact(AttachArtifactParams {
            target_id: target_id.to_string(),
            path: path.to_path_buf(),
            name,
            creator: creator.to_string(),
            metadata: Default::default(),
        })
        .context("attaching artifact")?;
    log.close().await.context("closing fabric event log")?;
    println!("{}", thread.id);
    Ok(())
}

fn replay_session(dir: &Path) -> anyhow::Result<()> {
    let events = fabric_eventlog::load(dir).context("loading fabric event log")?;
    let mut channels = 0u64;
    let mut messages = 0u64;
    let mut replies = 0u64;
    let mut artifacts = 0u64;
    for event in &events {
        match event.event_type {
            fabric_service::FabricEventType::ChannelCreated => channels += 1,
            fabric_service::FabricEventType::MessagePosted => messages += 1,
            fabric_service::FabricEventType::ReplyPosted => replies += 1,
            fabric_service::FabricEventType::ArtifactAdded => artifacts += 1,
            _ => {}
        }
    }
    println!("channels: {channels}");
    println!("messages: {messages}");
    println!("replies: {replies}");
    println!("artifacts: {artifacts}");
    Ok(())
}

fn close_session(dir: &Path, status: &str) -> anyhow::Result<()> {
    let metadata_path = dir.join("metadata.json");
    let mut metadata = SessionMetadata::load(&metadata_path).context("loading session metadata")?;
    metadata.status = status.to_string();
    metadata.end_time = Some(Utc::now());
    metadata.save(&metadata_path).context("saving session metadata")?;

    let summary = fabric_session::render_summary(&metadata);
    std::fs::write(dir.join("summary.md"), &summary).context("writing session summary")?;

    if let Some(sessions_root) = dir.parent() {
        SessionIndex::update(
            sessions_root,
            SessionIndexEntry {
                id: metadata.session_id.clone(),
                start_time: metadata.start_time,
                end_time: metadata.end_time,
                status: metadata.status.clone(),
                epic_id: None,
                work_dir: dir.to_path_buf(),
                accountability_summary_path: None,
                worker_count: metadata.workers.len(),
                tasks_completed: 0,
                total_commits: 0,
            },
        )
        .context("updating session index")?;
    }

    print!("{summary}");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
