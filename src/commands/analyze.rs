//! Analyze command: translation, i'rab and summaries of Arabic text

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{client, failure_message, fallback, CommandResult};
use crate::audio::codec;
use crate::audio::host::EndedSink;
use crate::audio::{AudioHost, CpalHost, PlaybackQueue};
use crate::config::Config;
use crate::export::{self, ExportFormat};
use crate::gemini::{prompts, GeminiClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Translate,
    Grammar,
    Summarize,
}

impl Mode {
    fn prompt(&self, text: &str) -> String {
        match self {
            Mode::Translate => prompts::translate(text),
            Mode::Grammar => prompts::grammar(text),
            Mode::Summarize => prompts::summarize(text),
        }
    }
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Arabic text to analyze
    pub text: Option<String>,
    /// Read the text from a file instead
    #[arg(long, conflicts_with = "text")]
    pub file: Option<PathBuf>,
    /// Generate a practice paragraph on this topic first
    #[arg(long, conflicts_with_all = ["text", "file"])]
    pub generate: Option<String>,
    #[arg(long, value_enum, default_value = "translate")]
    pub mode: Mode,
    /// Use the pro model with an extended reasoning budget
    #[arg(long)]
    pub deep: bool,
    /// Save the result to EXPORT_DIR
    #[arg(long, value_enum)]
    pub out: Option<ExportFormat>,
    /// Read the Arabic text aloud
    #[arg(long)]
    pub listen: bool,
}

pub async fn run(config: &Config, args: AnalyzeArgs) -> CommandResult {
    let client = client(config)?;

    let text = match (&args.generate, &args.file, &args.text) {
        (Some(topic), _, _) => {
            println!("Membuat paragraf latihan tentang {}...", topic);
            match client.generate_text(&prompts::practice_paragraph(topic)).await {
                Ok(paragraph) => {
                    println!("{}\n", paragraph.trim());
                    paragraph
                }
                Err(e) => {
                    println!("{}", failure_message(&e, fallback::ANALYZE));
                    return Ok(());
                }
            }
        }
        (None, Some(path), _) => std::fs::read_to_string(path)?,
        (None, None, Some(text)) => text.clone(),
        (None, None, None) => {
            return Err("Silakan masukkan teks Arab terlebih dahulu atau buat paragraf latihan.".into());
        }
    };
    if text.trim().is_empty() {
        return Err("Silakan masukkan teks Arab terlebih dahulu atau buat paragraf latihan.".into());
    }

    if args.listen {
        if let Err(e) = listen(config, &client, &text).await {
            warn!("Read-aloud failed: {}", e);
            println!("Gagal memutar audio.");
        }
    }

    let prompt = args.mode.prompt(&text);
    info!("Analyzing text ({:?}, deep: {})", args.mode, args.deep);
    let (result, fallback_text) = if args.deep {
        (client.generate_deep(&prompt).await, fallback::DEEP)
    } else {
        (client.generate_text(&prompt).await, fallback::ANALYZE)
    };
    let result = match result {
        Ok(result) => result,
        Err(e) => {
            println!("{}", failure_message(&e, fallback_text));
            return Ok(());
        }
    };
    println!("{}", result);

    if let Some(format) = args.out {
        let path = export::export(&config.export_dir, "analisis-teks", "Analisis Teks", &result, format)?;
        println!("\nDisimpan ke {}", path.display());
    }

    Ok(())
}

/// Synthesize `text` and play it on the default output device
async fn listen(config: &Config, client: &GeminiClient, text: &str) -> CommandResult {
    let Some(data) = client.generate_speech(text).await? else {
        println!("Gagal menghasilkan data audio.");
        return Ok(());
    };
    let buffer = codec::decode_from_transport(&data, config.output_sample_rate, 1)?;
    let deadline = Duration::from_secs_f64(buffer.duration()) + Duration::from_secs(2);

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let ended: EndedSink = Arc::new(move |id| {
        let _ = ended_tx.send(id);
    });
    let mut output = CpalHost.open_output(config.output_sample_rate, 1, ended)?;
    let mut queue = PlaybackQueue::new();
    queue.enqueue(output.as_mut(), buffer)?;

    let drained = tokio::time::timeout(deadline, async {
        while !queue.is_empty() {
            match ended_rx.recv().await {
                Some(id) => {
                    queue.finished(id);
                }
                None => break,
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Playback did not report completion in time");
        queue.clear(Some(output.as_mut()));
    }

    output.close()?;
    Ok(())
}
