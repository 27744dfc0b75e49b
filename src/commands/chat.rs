//! Chat command: streaming conversation with the study assistant

use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{client, failure_message, fallback, CommandResult};
use crate::config::Config;
use crate::gemini::prompts;

pub async fn run(config: &Config) -> CommandResult {
    let client = client(config)?;
    let mut chat = client.chat(prompts::CHAT_SYSTEM);

    println!("Asisten Virtual. Ketik pertanyaan lalu tekan Enter. /clear menghapus riwayat, /quit keluar.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("Anda> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                chat.clear();
                println!("Riwayat percakapan dihapus.");
                continue;
            }
            _ => {}
        }

        print!("Asisten> ");
        std::io::stdout().flush()?;
        let reply = chat
            .send_message(input, |chunk| {
                print!("{}", chunk);
                let _ = std::io::stdout().flush();
            })
            .await;
        match reply {
            Ok(_) => println!("\n"),
            Err(e) => println!("\n{}\n", failure_message(&e, fallback::CHAT)),
        }
    }

    Ok(())
}
