// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fabric_domain::MessageKind;

/// Message kind as accepted on the command line; maps onto `fabric_domain::MessageKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MessageKindArg {
    #[default]
    Info,
    Request,
    Response,
    Status,
    Error,
}

impl From<MessageKindArg> for MessageKind {
    fn from(arg: MessageKindArg) -> Self {
        match arg {
            MessageKindArg::Info => MessageKind::Info,
            MessageKindArg::Request => MessageKind::Request,
            MessageKindArg::Response => MessageKind::Response,
            MessageKindArg::Status => MessageKind::Status,
            MessageKindArg::Error => MessageKind::Error,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "fabric-runtime",
    about = "Operate a fabric session end to end: init, post, reply, attach, replay, close",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a runtime config file (overrides the fixed search path)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a session directory: the six fixed channels, an empty event
    /// log, and seeded session metadata.
    Init {
        /// Session directory to create.
        #[arg(long)]
        dir: PathBuf,
        /// Session id (used in metadata.json and sessions.json).
        #[arg(long)]
        id: String,
        /// Agent id that owns channel creation and the initial subscription.
        #[arg(long, default_value = "operator")]
        creator: String,
    },

    /// Post a new top-level message to a channel.
    Post {
        /// Session directory created by `init`.
        #[arg(long)]
        dir: PathBuf,
        /// Channel slug, e.g. "general".
        #[arg(long)]
        channel: String,
        /// Message body.
        content: String,
        /// Agent id posting the message.
        #[arg(long, default_value = "operator")]
        creator: String,
        /// Message kind (defaults to "info").
        #[arg(long, value_enum, default_value = "info")]
        kind: MessageKindArg,
    },

    /// Reply to an existing message, attaching to its thread root.
    Reply {
        /// Session directory created by `init`.
        #[arg(long)]
        dir: PathBuf,
        /// Id of the message being replied to.
        message_id: String,
        /// Reply body.
        content: String,
        /// Agent id posting the reply.
        #[arg(long, default_value = "operator")]
        creator: String,
        /// Message kind (defaults to "response").
        #[arg(long, value_enum, default_value = "response")]
        kind: MessageKindArg,
    },

    /// Attach a file as an artifact referencing a message or channel.
    Attach {
        /// Session directory created by `init`.
        #[arg(long)]
        dir: PathBuf,
        /// Thread id the artifact references.
        target_id: String,
        /// Path to the file to attach.
        path: PathBuf,
        /// Display name (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
        /// Agent id attaching the artifact.
        #[arg(long, default_value = "operator")]
        creator: String,
    },

    /// Replay a session's event log and print the rebuilt thread counts.
    Replay {
        /// Session directory created by `init`.
        #[arg(long)]
        dir: PathBuf,
    },

    /// Mark a session closed, render its summary, and update the
    /// cross-session index.
    Close {
        /// Session directory created by `init`.
        #[arg(long)]
        dir: PathBuf,
        /// Final status to record (defaults to "completed").
        #[arg(long, default_value = "completed")]
        status: String,
    },
}
