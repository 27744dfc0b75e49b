//! Dictionary command: search-grounded explanation of a term

use clap::Args;
use tracing::info;

use super::{client, failure_message, fallback, CommandResult};
use crate::config::Config;
use crate::gemini::prompts;

#[derive(Debug, Args)]
pub struct DictionaryArgs {
    /// Term or concept to look up
    pub term: String,
}

pub async fn run(config: &Config, args: DictionaryArgs) -> CommandResult {
    let term = args.term.trim();
    if term.is_empty() {
        return Err("Silakan masukkan istilah yang ingin dicari.".into());
    }

    let client = client(config)?;
    info!("Looking up {}", term);
    let answer = match client.generate_grounded(&prompts::dictionary(term)).await {
        Ok(answer) => answer,
        Err(e) => {
            println!("{}", failure_message(&e, fallback::SEARCH));
            return Ok(());
        }
    };
    println!("{}", answer.text);

    if !answer.sources.is_empty() {
        println!("\nSumber:");
        for source in &answer.sources {
            let title = if source.title.is_empty() { &source.uri } else { &source.title };
            println!("  - {} <{}>", title, source.uri);
        }
    }

    Ok(())
}
