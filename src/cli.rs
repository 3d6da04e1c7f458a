use crate::db::models::ConversationId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ai-chat", version, about = "Chat with OpenAI-compatible models")]
pub struct Cli {
    /// Verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory holding the database (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// API base address for this run
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// API key for this run
    #[arg(long, global = true, env = "AI_CHAT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Model for this run
    #[arg(short, long, global = true)]
    pub model: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message and print the reply
    Send {
        text: String,
        /// Conversation id (defaults to the most recent)
        #[arg(short, long)]
        conversation: Option<ConversationId>,
        /// Start a new conversation for this message
        #[arg(long, conflicts_with = "conversation")]
        new: bool,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Re-send the pending user turn of a conversation
    Retry {
        #[arg(short, long)]
        conversation: Option<ConversationId>,
    },
    /// Start an empty conversation
    New,
    /// List conversations
    List,
    /// Print a conversation
    Show { conversation: Option<ConversationId> },
    /// Delete every conversation
    Clear,
    /// List models offered by the endpoint
    Models,
    /// Read or change stored settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    Get,
    Set { key: String, value: String },
    Delete { key: String },
}
