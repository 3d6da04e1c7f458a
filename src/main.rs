use ai_chat_lib::cli::Cli;
use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    ai_chat_lib::run(Cli::parse()).await
}
