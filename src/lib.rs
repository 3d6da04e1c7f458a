pub mod cli;
pub mod commands;
pub mod db;
pub mod llm;
pub mod session;

use anyhow::{Context, Result};
use cli::{Cli, Command, SettingsAction};
use commands::settings::EndpointOverrides;
use commands::{chat, settings};
use db::models::ConversationId;
use db::{ConversationStore, Database};
use llm::{ChatDelta, HttpTransport, OpenAiClient};
use session::{DispatchOutcome, SessionController};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn data_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => dirs::data_dir()
            .map(|dir| dir.join("ai-chat"))
            .context("could not determine a data directory; pass --data-dir"),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

fn print_outcome(outcome: DispatchOutcome) {
    match outcome {
        DispatchOutcome::Completed => println!(),
        DispatchOutcome::Cancelled => println!("\n[cancelled]"),
        DispatchOutcome::NothingPending => println!("Nothing to send: the last message already has a reply."),
        DispatchOutcome::AlreadyInFlight => println!("A reply is already being generated."),
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose);

    let app_dir = data_dir(&cli)?;
    let db = Arc::new(Database::new(&app_dir).context("failed to open database")?);
    let store = Arc::new(ConversationStore::load(db.clone())?);
    let config = settings::load_endpoint(
        &db,
        EndpointOverrides {
            base_url: cli.base_url.clone(),
            api_key: cli.api_key.clone(),
            model: cli.model.clone(),
        },
    )?;
    tracing::info!(model = %config.model, "starting ai-chat");

    let client = OpenAiClient::new(config, Arc::new(HttpTransport::new()));
    let controller = SessionController::new(store.clone(), client).with_observer(Box::new(
        |_: ConversationId, delta: &ChatDelta| {
            if let Some(text) = &delta.content {
                print!("{}", text);
                std::io::stdout().flush().ok();
            }
        },
    ));

    match cli.command {
        Command::Send {
            text,
            conversation,
            new,
            timeout,
        } => {
            let id = if new {
                chat::create_conversation(&store)?
            } else {
                chat::resolve_conversation(&store, conversation)?
            };
            let cancel = cancel_on_ctrl_c();
            let outcome = match timeout {
                Some(secs) => {
                    controller
                        .submit_with_deadline(id, &text, Duration::from_secs(secs), &cancel)
                        .await?
                }
                None => chat::send_message(&controller, id, &text, &cancel).await?,
            };
            // image replies arrive whole, so the delta observer never prints them
            if outcome == DispatchOutcome::Completed
                && controller.client().operation() == llm::Operation::ImageGeneration
            {
                if let Some(reply) = store.messages(id).and_then(|m| m.last().cloned()) {
                    print!("{}", reply.content);
                }
            }
            print_outcome(outcome);
        }
        Command::Retry { conversation } => {
            let id = chat::resolve_conversation(&store, conversation)?;
            let outcome = chat::retry(&controller, id, &cancel_on_ctrl_c()).await?;
            print_outcome(outcome);
        }
        Command::New => {
            let id = chat::create_conversation(&store)?;
            println!("{}", id);
        }
        Command::List => {
            for summary in chat::list_conversations(&store) {
                println!(
                    "{}  {}  {:>3}  {}",
                    summary.id, summary.created_at, summary.message_count, summary.preview
                );
            }
        }
        Command::Show { conversation } => {
            let id = chat::resolve_conversation(&store, conversation)?;
            for message in chat::get_messages(&store, id)? {
                if let Some(reasoning) = &message.reasoning {
                    println!("[{} reasoning] {}", message.role.as_str(), reasoning);
                }
                println!("[{}] {}", message.role.as_str(), message.content);
            }
        }
        Command::Clear => {
            chat::delete_all_conversations(&store)?;
            println!("All conversations deleted.");
        }
        Command::Models => {
            for model in settings::get_available_models(controller.client()).await? {
                println!("{}", model);
            }
        }
        Command::Settings { action } => match action {
            SettingsAction::Get => {
                for (key, value) in settings::get_settings(&db)? {
                    println!("{} = {}", key, value);
                }
            }
            SettingsAction::Set { key, value } => settings::set_setting(&db, &key, &value)?,
            SettingsAction::Delete { key } => settings::delete_setting(&db, &key)?,
        },
    }

    Ok(())
}
