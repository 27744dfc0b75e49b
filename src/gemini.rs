//! Gemini REST client
//!
//! Single request/response calls behind the text analysis, dictionary,
//! chat and listen features.

use crate::live::protocol::{Modality, SpeechConfig};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::models;

/// Reasoning budget for deep analysis
pub const DEEP_THINKING_BUDGET: i32 = 32768;

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
}

/// Prompts used by the learning features
pub mod prompts {
    pub const CHAT_SYSTEM: &str = "You are a helpful assistant specializing in 'Kitab Kuning' and Islamic studies. Answer in Bahasa Indonesia unless the user asks in another language. Use Markdown formatting to structure your answers clearly. Use headings for main topics, bold for important terms, and bullet points for lists to make the information easy to understand.";

    pub const LIVE_COACH: &str = "Anda adalah seorang pelatih membaca kitab (Qira'ah) yang ramah. Pengguna akan membaca dalam Bahasa Arab. Tugas Anda adalah memberikan semua instruksi dan umpan balik utama dalam **Bahasa Indonesia**. Dengarkan bacaan pengguna, lalu berikan komentar tentang kelancaran dan pengucapan (makhraj). Anda bisa memulai sesi dengan sapaan seperti \"Assalamualaikum, mari kita mulai.\" dan gunakan frasa Arab singkat untuk memberi semangat, seperti \"ممتاز\" (Mumtaz) atau \"أحسنت\" (Ahsant), tapi pastikan inti penjelasan tetap dalam Bahasa Indonesia.";

    const GRAMMAR: &str = r#"Lakukan analisis I'rab (tata bahasa Arab) yang sangat mendetail dan bergaya tradisional seperti di pesantren untuk teks berikut. Gunakan terminologi nahwu yang umum (misalnya, lafadz, kalimah, mabni, mu'rab, marfu', manshub, majrur) dan jelaskan dalam Bahasa Indonesia dengan format Markdown yang jelas.

Teks untuk dianalisis:
{text}

Struktur output yang WAJIB diikuti:

## 1. I'rab Lafdzy / Tafsili (Analisis per Kata)
Uraikan setiap kata (lafadz) satu per satu secara berurutan. Untuk setiap kata, berikan analisis dengan format sebagai berikut:

- **Lafadz [Kata Arabnya]:**
  - **Jenis Kalimah:** Isim / Fi'il / Harf.
  - **I'rab:** Mu'rab atau Mabni.
    - Jika Mu'rab, sebutkan keadaannya (Marfu'/Manshub/Majrur/Majzum).
    - Jika Mabni, sebutkan keadaannya (Mabni 'ala Fath/Dhamm/Kasr/Sukun).
  - **'Alamah (Tanda I'rab):** Sebutkan tandanya (misalnya: "Dhammah Zhahirah", "Fathah Muqaddarah", "Alif karena Isim Tatsniyah", "Membuang Nun").
  - **Kedudukan (Mahallul I'rab):** Jelaskan posisinya dalam kalimat (misalnya: "Mubtada", "Fa'il", "Maf'ul Bih", "Mudhaf Ilaih", "Fi'il Madhi").
  - **Keterangan Tambahan:** Jika ada, jelaskan (misalnya: "Fa'ilnya berupa dhamir mustatir takdirnya هو").

**Contoh Format untuk satu kata:**
- **Lafadz الْحَمْدُ:**
  - **Jenis Kalimah:** Isim Mufrad.
  - **I'rab:** Mu'rab, Marfu'.
  - **'Alamah (Tanda I'rab):** Dhammah Zhahirah (dhammah yang tampak di akhir).
  - **Kedudukan (Mahallul I'rab):** Mubtada'.

## 2. I'rab Jaliy / Ijmali (Analisis per Kalimat)
Setelah analisis per kata, identifikasi setiap jumlah (kalimat) dalam teks.
- Tentukan jenisnya (Jumlah Ismiyyah atau Jumlah Fi'liyyah).
- Jelaskan kedudukan i'rab dari keseluruhan jumlah tersebut jika ada (misalnya: "Jumlah Fi'liyyah menempati posisi rafa' sebagai Khabar dari Mubtada'").

Pastikan penjelasan akurat, sistematis, dan mudah dipahami seolah-olah sedang mengajar santri."#;

    pub fn translate(text: &str) -> String {
        format!("Translate the following Arabic text to Indonesian:\n\n{}", text)
    }

    pub fn grammar(text: &str) -> String {
        GRAMMAR.replace("{text}", text)
    }

    pub fn summarize(text: &str) -> String {
        format!(
            "Summarize the key points of the following Arabic text in Indonesian. Use a Markdown bulleted list for clarity.\n\n{}",
            text
        )
    }

    pub fn practice_paragraph(topic: &str) -> String {
        format!(
            "Generate a short, intermediate-level Arabic paragraph about the topic of {}. The paragraph should be suitable for language learning and analysis, consisting of 3-4 sentences. Do not provide any translation or explanation, only the Arabic text.",
            topic
        )
    }

    pub fn dictionary(term: &str) -> String {
        format!(
            "Provide a detailed explanation for the term/concept \"{}\" in the context of Islamic studies and Kitab Kuning. Format the output clearly in Indonesian using Markdown. Use headings for sections (e.g., ## Definisi), bold for key terms (e.g., **Istilah Penting**), and bullet points for examples or key points.",
            term
        )
    }
}

/// Conversation turn, used both ways
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }

    /// Concatenated text parts
    pub fn joined_text(&self) -> String {
        self.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

/// Request body for content generation
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<Modality>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

/// Response from Gemini content generation
#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<Source>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i32,
    message: String,
}

impl GenerateResponse {
    fn into_result(self) -> Result<Self, GeminiError> {
        match self.error {
            Some(e) => Err(GeminiError::Api(format!("{} ({})", e.message, e.code))),
            None => Ok(self),
        }
    }

    fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.as_ref().and_then(|c| c.first())
    }

    fn text(&self) -> String {
        self.first_candidate()
            .and_then(|c| c.content.as_ref())
            .map(Content::joined_text)
            .unwrap_or_default()
    }
}

/// A cited web page
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Source {
    pub uri: String,
    #[serde(default)]
    pub title: String,
}

/// Search-grounded answer with its citations
#[derive(Debug, Clone)]
pub struct GroundedAnswer {
    pub text: String,
    pub sources: Vec<Source>,
}

/// Gemini API client for single-shot generation
pub struct GeminiClient {
    client: Client,
    api_key: String,
    api_base: String,
    tts_voice: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, api_base: &str, tts_voice: &str) -> Result<Self, GeminiError> {
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            tts_voice: tts_voice.to_string(),
        })
    }

    fn url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}?key={}", self.api_base, model, method, self.api_key)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GeminiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || text.contains("Quota exceeded") {
            return Err(GeminiError::RateLimitExceeded);
        }
        error!("Gemini request failed: {}", status);
        Err(GeminiError::Api(format!("Generation failed: {} - {}", status, text)))
    }

    async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<GenerateResponse, GeminiError> {
        debug!("generateContent on {}", model);
        let response = self
            .client
            .post(self.url(model, "generateContent"))
            .json(request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let parsed: GenerateResponse = response.json().await?;
        parsed.into_result()
    }

    /// Plain text generation with the fast model
    pub async fn generate_text(&self, prompt: &str) -> Result<String, GeminiError> {
        let request = GenerateRequest {
            contents: vec![Content::text(Some("user"), prompt)],
            ..Default::default()
        };
        Ok(self.generate(models::GEMINI_FLASH, &request).await?.text())
    }

    /// Generation with the pro model and an extended reasoning budget
    pub async fn generate_deep(&self, prompt: &str) -> Result<String, GeminiError> {
        let request = GenerateRequest {
            contents: vec![Content::text(Some("user"), prompt)],
            generation_config: Some(GenerationConfig {
                thinking_config: Some(ThinkingConfig {
                    thinking_budget: DEEP_THINKING_BUDGET,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok(self.generate(models::GEMINI_PRO, &request).await?.text())
    }

    /// Web-grounded generation returning the cited sources
    pub async fn generate_grounded(&self, query: &str) -> Result<GroundedAnswer, GeminiError> {
        let request = GenerateRequest {
            contents: vec![Content::text(Some("user"), query)],
            tools: Some(vec![Tool {
                google_search: GoogleSearch {},
            }]),
            ..Default::default()
        };
        let response = self.generate(models::GEMINI_FLASH, &request).await?;
        Ok(grounded_answer(&response))
    }

    /// Synthesize speech. Returns base64 PCM (24kHz mono), or `None` when
    /// the model produced no audio.
    pub async fn generate_speech(&self, text: &str) -> Result<Option<String>, GeminiError> {
        let request = GenerateRequest {
            contents: vec![Content::text(None, text)],
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec![Modality::Audio]),
                speech_config: Some(SpeechConfig::prebuilt(&self.tts_voice)),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response = self.generate(models::GEMINI_TTS, &request).await?;
        let audio = response
            .first_candidate()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.iter().find_map(|p| p.inline_data.as_ref()))
            .map(|blob| blob.data.clone());
        info!("Speech generated: {}", audio.is_some());
        Ok(audio)
    }

    /// Start a multi-turn conversation
    pub fn chat(&self, system_instruction: &str) -> ChatSession<'_> {
        ChatSession {
            client: self,
            model: models::GEMINI_FLASH.to_string(),
            system_instruction: Content::text(None, system_instruction),
            history: Vec::new(),
        }
    }
}

fn grounded_answer(response: &GenerateResponse) -> GroundedAnswer {
    let mut sources: Vec<Source> = Vec::new();
    if let Some(metadata) = response.first_candidate().and_then(|c| c.grounding_metadata.as_ref()) {
        for chunk in &metadata.grounding_chunks {
            if let Some(web) = &chunk.web {
                if !sources.iter().any(|s| s.uri == web.uri) {
                    sources.push(web.clone());
                }
            }
        }
    }
    GroundedAnswer {
        text: response.text(),
        sources,
    }
}

/// Splits a server-sent-event byte stream into `data:` payloads.
/// Bytes are only decoded once a whole line has arrived, so characters
/// split across network chunks survive.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(data) = line.trim_end().strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// Multi-turn chat keeping its own history
pub struct ChatSession<'a> {
    client: &'a GeminiClient,
    model: String,
    system_instruction: Content,
    history: Vec<Content>,
}

impl ChatSession<'_> {
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Send one message, streaming reply fragments to `on_chunk`.
    /// History only grows when the reply completes.
    pub async fn send_message<F>(&mut self, text: &str, mut on_chunk: F) -> Result<String, GeminiError>
    where
        F: FnMut(&str),
    {
        let mut contents = self.history.clone();
        contents.push(Content::text(Some("user"), text));
        let request = GenerateRequest {
            contents,
            system_instruction: Some(self.system_instruction.clone()),
            ..Default::default()
        };

        let url = format!("{}&alt=sse", self.client.url(&self.model, "streamGenerateContent"));
        let response = self.client.client.post(url).json(&request).send().await?;
        let response = GeminiClient::check(response).await?;

        let mut decoder = SseDecoder::default();
        let mut reply = String::new();
        let mut stream = response.bytes_stream();
        while let Some(bytes) = stream.next().await {
            for payload in decoder.push(&bytes?) {
                let chunk: GenerateResponse = serde_json::from_str(&payload)?;
                let chunk_text = chunk.into_result()?.text();
                if !chunk_text.is_empty() {
                    on_chunk(&chunk_text);
                    reply.push_str(&chunk_text);
                }
            }
        }

        self.history.push(Content::text(Some("user"), text));
        self.history.push(Content::text(Some("model"), &reply));
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompts() {
        assert!(prompts::translate("كتاب").ends_with("كتاب"));
        assert!(prompts::grammar("الحمد لله").contains("Teks untuk dianalisis:\nالحمد لله"));
        assert!(prompts::practice_paragraph("fiqh").contains("topic of fiqh"));
        assert!(prompts::dictionary("ijma").contains("\"ijma\""));
    }

    #[test]
    fn test_deep_request_shape() {
        let request = GenerateRequest {
            contents: vec![Content::text(Some("user"), "hi")],
            generation_config: Some(GenerationConfig {
                thinking_config: Some(ThinkingConfig {
                    thinking_budget: DEEP_THINKING_BUDGET,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
                "generationConfig": { "thinkingConfig": { "thinkingBudget": 32768 } }
            })
        );
    }

    #[test]
    fn test_grounded_sources_are_deduplicated() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Ijma' adalah " }, { "text": "kesepakatan." }] },
                "groundingMetadata": { "groundingChunks": [
                    { "web": { "uri": "https://a.example", "title": "A" } },
                    { "web": { "uri": "https://a.example", "title": "A again" } },
                    { "retrievedContext": {} },
                    { "web": { "uri": "https://b.example", "title": "B" } }
                ]}
            }]
        }))
        .unwrap();

        let answer = grounded_answer(&response);
        assert_eq!(answer.text, "Ijma' adalah kesepakatan.");
        assert_eq!(answer.sources.len(), 2);
        assert_eq!(answer.sources[0].title, "A");
        assert_eq!(answer.sources[1].uri, "https://b.example");
    }

    #[test]
    fn test_api_error_body() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "error": { "code": 400, "message": "API key not valid" }
        }))
        .unwrap();
        assert!(matches!(response.into_result(), Err(GeminiError::Api(m)) if m.contains("API key not valid")));
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let payloads = decoder.push(b"1}\r\n\r\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[test]
    fn test_sse_decoder_keeps_split_arabic_intact() {
        let frame = "data: {\"t\":\"سلام\"}\n".as_bytes();
        // One byte into the two-byte "س"
        let split = frame.iter().position(|b| *b == 0xD8).unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&frame[..split]).is_empty());
        let payloads = decoder.push(&frame[split..]);
        assert_eq!(payloads, vec!["{\"t\":\"سلام\"}".to_string()]);
    }
}
