//! Practice command: live reading session with the voice coach
//!
//! Enter starts or stops the session, `q` quits. Transcripts stream to
//! stdout as the service produces them.

use clap::Args;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::CommandResult;
use crate::audio::CpalHost;
use crate::config::Config;
use crate::export;
use crate::gemini::prompts;
use crate::live::{GeminiLiveConnector, LiveConnector};
use crate::session::{LiveSessionManager, SessionOptions, SessionSnapshot, SessionState, Transcript};

#[derive(Debug, Args)]
pub struct PracticeArgs {
    /// Save the transcript to EXPORT_DIR when quitting
    #[arg(long)]
    pub save: bool,
}

/// Tracks what of a snapshot has already been printed
#[derive(Debug, Default)]
struct Printer {
    status: String,
    user_len: usize,
    feedback_len: usize,
}

impl Printer {
    /// Lines to print for the changes since the last call
    fn update(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
        let mut lines = Vec::new();
        if snapshot.status != self.status {
            self.status = snapshot.status.clone();
            lines.push(format!("[{}] {}", snapshot.state.as_str(), snapshot.status));
        }

        let transcript = &snapshot.transcript;
        // A fresh session clears the transcript.
        if transcript.user.len() < self.user_len || transcript.feedback.len() < self.feedback_len {
            self.user_len = 0;
            self.feedback_len = 0;
        }
        if let Some(new) = transcript.user.get(self.user_len..).filter(|s| !s.is_empty()) {
            lines.push(format!("Anda: {}", new.trim_end()));
            self.user_len = transcript.user.len();
        }
        if let Some(new) = transcript.feedback.get(self.feedback_len..).filter(|s| !s.trim().is_empty()) {
            lines.push(format!("Umpan Balik AI: {}", new.trim_end()));
            self.feedback_len = transcript.feedback.len();
        }
        lines
    }
}

fn transcript_markdown(transcript: &Transcript) -> String {
    format!(
        "## Transkripsi Anda\n{}\n\n## Umpan Balik AI\n{}\n",
        transcript.user.trim(),
        transcript.feedback.trim()
    )
}

pub async fn run(config: &Config, args: PracticeArgs) -> CommandResult {
    let connector: Option<Arc<dyn LiveConnector>> = config
        .gemini_api_key
        .as_deref()
        .map(|key| Arc::new(GeminiLiveConnector::new(config.live_url.clone(), key)) as Arc<dyn LiveConnector>);
    if connector.is_none() {
        warn!("No API key configured; live sessions will fail to connect");
    }

    let options = SessionOptions::from_config(config, prompts::LIVE_COACH);
    let manager = LiveSessionManager::new(Arc::new(CpalHost), connector, options);
    let (controller, task) = manager.spawn();
    let mut updates = controller.subscribe();

    println!("Latihan Qira'ah. Tekan Enter untuk mulai/berhenti, ketik q lalu Enter untuk keluar.");

    let mut printer = Printer::default();
    let mut last = controller.snapshot();
    for line in printer.update(&last) {
        println!("{}", line);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().eq_ignore_ascii_case("q") {
                    break;
                }
                match last.state {
                    SessionState::Idle => controller.start(),
                    _ => controller.stop(),
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                last = updates.borrow_and_update().clone();
                for line in printer.update(&last) {
                    println!("{}", line);
                }
            }
        }
    }

    controller.shutdown();
    drop(updates);
    drop(controller);
    if let Err(e) = task.await {
        warn!("Session task ended abnormally: {}", e);
    }
    info!("Practice ended");

    if args.save {
        let content = transcript_markdown(&last.transcript);
        if last.transcript.user.trim().is_empty() && last.transcript.feedback.trim().is_empty() {
            println!("Tidak ada transkrip untuk disimpan.");
        } else {
            let path = export::save(&config.export_dir, "latihan-qiraah", "txt", &export::to_plain_text(&content))?;
            println!("Transkrip disimpan ke {}", path.display());
        }
    }

    Ok(())
}
