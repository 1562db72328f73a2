use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use palavra_contracts::cards::{VerseResult, VerseSuggestion};
use palavra_contracts::daily::{today_local, DailyVerseStore};
use palavra_contracts::events::{EventJournal, EventPayload};
use palavra_contracts::fallback;
use palavra_contracts::gallery::GalleryStore;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const TEXT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const STOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared search vocabulary for the stock fetchers, so every fallback tier
/// stays on theme with the generated artwork.
const NATURE_QUERIES: &[&str] = &[
    "nature landscape",
    "beautiful sky",
    "sunset over mountains",
    "peaceful forest",
    "ocean waves sunrise",
    "heavenly clouds",
    "spiritual nature light",
    "abstract nature textures",
];

const LIGHTING_STYLES: &[&str] = &[
    "luz dourada do amanhecer",
    "crepúsculo dramático",
    "luz suave e difusa",
    "raios de sol rompendo as nuvens",
    "iluminação etérea e celestial",
    "noite estrelada serena",
    "luz natural brilhante de meio-dia",
];

const VIEW_ANGLES: &[&str] = &[
    "vista aérea majestosa",
    "vista panorâmica de grande angular",
    "horizonte distante",
    "vista ampla do vale",
    "paisagem vasta e infinita",
];

const NATURE_ELEMENTS: &[&str] = &[
    "montanhas imponentes sob o céu",
    "oceano vasto e profundo",
    "floresta antiga vista do alto",
    "cachoeira grandiosa entre rochas",
    "deserto vasto e sereno",
    "vale verdejante entre colinas distantes",
    "céu dramático com nuvens e raios de sol",
    "lago cristalino refletindo montanhas",
];

/// The underlying model has no negative-prompt channel, so the exclusions
/// must be spelled out inside the prompt itself.
const NEGATIVE_CONSTRAINTS: &str = "ABSOLUTAMENTE SEM PESSOAS, SEM SERES HUMANOS, SEM ROSTOS, SEM MÃOS, \
     SEM FIGURAS HUMANAS. SEM INTERIORES, SEM MÓVEIS, SEM PRÉDIOS. \
     SEM TEXTO, SEM LETRAS, SEM MARCAS D'ÁGUA";

const SYSTEM_BIBLE_ASSISTANT: &str = "Você é um assistente especialista em estudos bíblicos. Sempre responda em \
     português do Brasil. Não use nenhum outro idioma.";

const SYSTEM_THEOLOGIAN: &str = "Você é um especialista em teologia que explica versículos bíblicos de forma \
     clara e inspiradora. Sempre responda em português do Brasil.";

#[derive(Debug, Clone, Copy)]
pub struct ImageStyle {
    pub id: &'static str,
    pub label: &'static str,
    pub prompt: &'static str,
}

pub const IMAGE_STYLES: &[ImageStyle] = &[
    ImageStyle {
        id: "cinematic",
        label: "Cinematográfico",
        prompt: "Uma imagem artística cristã cinematográfica, com alto realismo em 8k, \
             etérea e inspiradora. Estilo com iluminação dramática e profundidade de campo. \
             Foque em elementos da natureza, luz divina e paisagens.",
    },
    ImageStyle {
        id: "minimalist",
        label: "Minimalista",
        prompt: "Uma ilustração minimalista e elegante, com design limpo e traços \
             geométricos. Cores suaves, muito espaço negativo. Apenas simbolismos \
             abstratos e natureza.",
    },
    ImageStyle {
        id: "watercolor",
        label: "Aquarela",
        prompt: "Uma pintura em aquarela suave e delicada. Estilo artístico com manchas \
             de tinta sutis. Paisagens naturais e elementos simbólicos.",
    },
    ImageStyle {
        id: "photorealism",
        label: "Fotorrealismo",
        prompt: "Uma imagem fotorrealista de ultra-alta definição com texturas perfeitas. \
             Iluminação natural impressionante. Apenas natureza pura e cenários magníficos.",
    },
    ImageStyle {
        id: "photography",
        label: "Fotografia",
        prompt: "Uma fotografia profissional premiada, iluminação natural sublime. \
             Paisagens naturais, céus, montanhas ou detalhes da criação.",
    },
    ImageStyle {
        id: "realistic-digital",
        label: "Ilustração Realista",
        prompt: "Uma ilustração digital realista e polida, estilo concept art. Renderização \
             detalhada. Foco em arquitetura sagrada, natureza ou simbolismo etéreo.",
    },
];

pub fn style_by_id(id: &str) -> Option<&'static ImageStyle> {
    IMAGE_STYLES.iter().find(|style| style.id == id)
}

pub fn compose_image_prompt<R: Rng + ?Sized>(
    style: &ImageStyle,
    context: &str,
    rng: &mut R,
) -> String {
    let element = pick(NATURE_ELEMENTS, rng);
    let lighting = pick(LIGHTING_STYLES, rng);
    let angle = pick(VIEW_ANGLES, rng);
    format!(
        "{} Contexto: {}. Cenário: {}. Iluminação: {}. Ângulo: {}. {}. \
         Proporção 9:16 vertical.",
        style.prompt, context, element, lighting, angle, NEGATIVE_CONSTRAINTS
    )
}

fn pick<'a, R: Rng + ?Sized>(values: &'a [&'a str], rng: &mut R) -> &'a str {
    values.choose(rng).copied().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Retry wrapper

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: usize, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    pub const fn for_text() -> Self {
        Self::new(5, Duration::from_secs(4))
    }

    pub const fn for_image() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Only quota exhaustion and transient overload are worth retrying; anything
/// else (missing credentials, schema mismatch, 4xx) fails the same way twice.
pub fn is_retryable_api_error(err: &anyhow::Error) -> bool {
    const MARKERS: &[&str] = &["429", "quota", "resource exhausted", "limit", "503", "overloaded"];
    err.chain().any(|cause| {
        let text = cause.to_string().to_lowercase();
        MARKERS.iter().any(|marker| text.contains(marker))
    })
}

/// Bounded retry with doubling backoff. Non-retryable errors propagate
/// immediately; retryable ones are reattempted until the budget runs out.
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry_with_backoff_using(policy, operation, thread::sleep)
}

fn retry_with_backoff_using<T, F, S>(policy: &RetryPolicy, mut operation: F, mut sleep: S) -> Result<T>
where
    F: FnMut() -> Result<T>,
    S: FnMut(Duration),
{
    let mut delay = policy.initial_delay;
    let mut remaining = policy.max_retries;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if remaining == 0 || !is_retryable_api_error(&err) {
                    return Err(err);
                }
                sleep(delay);
                delay = delay.saturating_mul(2);
                remaining -= 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON extraction

/// Best-effort cleanup of a model response into a JSON-parseable substring:
/// fenced-block content when present, otherwise the outermost `{...}` or
/// `[...]` slice, otherwise the trimmed input. The caller still parses.
pub fn extract_json_payload(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(inner) = fenced_block(trimmed) {
        return inner.trim().to_string();
    }

    let first_brace = trimmed.find('{');
    let first_bracket = trimmed.find('[');
    let bounds = match (first_brace, first_bracket) {
        (Some(brace), Some(bracket)) if brace < bracket => Some((brace, trimmed.rfind('}'))),
        (Some(brace), None) => Some((brace, trimmed.rfind('}'))),
        (_, Some(bracket)) => Some((bracket, trimmed.rfind(']'))),
        (None, None) => None,
    };
    if let Some((start, Some(end))) = bounds {
        if end > start {
            return trimmed[start..=end].to_string();
        }
    }
    trimmed.to_string()
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let mut body = &text[open + 3..];
    body = body.strip_prefix("json").unwrap_or(body);
    let close = body.find("```")?;
    Some(&body[..close])
}

// ---------------------------------------------------------------------------
// Text provider

#[derive(Debug, Clone)]
pub struct TextGenerateRequest {
    pub prompt: String,
    pub system_instruction: String,
    pub response_schema: Value,
    pub temperature: f64,
}

pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate_json(&self, request: &TextGenerateRequest) -> Result<Value>;
}

pub struct GeminiTextProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiTextProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_base: gemini_api_base(),
            model: model.into(),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        gemini_endpoint(&self.api_base, &self.model)
    }
}

impl TextProvider for GeminiTextProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_json(&self, request: &TextGenerateRequest) -> Result<Value> {
        let Some(api_key) = gemini_api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint();
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": &request.prompt }],
            }],
            "systemInstruction": {
                "parts": [{ "text": &request.system_instruction }],
            },
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": &request.response_schema,
                "temperature": request.temperature,
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(TEXT_REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let body = response_json_or_error("Gemini", response)?;

        let text = extract_text_parts(&body);
        if text.trim().is_empty() {
            bail!("Gemini returned empty text");
        }
        let cleaned = extract_json_payload(&text);
        serde_json::from_str(&cleaned).context("Gemini returned invalid JSON payload")
    }
}

/// Offline stand-in that answers from the static verse pool, shaped by the
/// schema the caller asked for.
pub struct DryrunTextProvider;

impl TextProvider for DryrunTextProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_json(&self, request: &TextGenerateRequest) -> Result<Value> {
        let properties = request
            .response_schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut rng = rand::thread_rng();

        if properties.contains_key("verses") {
            let verses = fallback::pooled_suggestions(5, &mut rng);
            return Ok(json!({ "verses": verses }));
        }
        if properties.contains_key("explanation") {
            return Ok(json!({
                "explanation": "Uma reflexão serena sobre a mensagem deste versículo e o \
                     cuidado de Deus no dia a dia.",
            }));
        }
        let verse = fallback::pooled_suggestions(1, &mut rng)
            .into_iter()
            .next()
            .context("empty offline verse pool")?;
        Ok(serde_json::to_value(verse)?)
    }
}

fn extract_text_parts(body: &Value) -> String {
    let mut chunks: Vec<String> = Vec::new();
    let candidates = body
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    chunks.push(text.to_string());
                }
            }
        }
    }
    chunks.join("\n")
}

// ---------------------------------------------------------------------------
// Image providers

#[derive(Debug, Clone)]
pub struct ImageFetchRequest {
    pub prompt: String,
}

/// One capability shared by every tier of the image chain: produce a single
/// usable image URL (https or data URL) for the request.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn fetch(&self, request: &ImageFetchRequest) -> Result<String>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub struct GeminiImageProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiImageProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_base: gemini_api_base(),
            model: model.into(),
            http: HttpClient::new(),
        }
    }
}

impl ImageProvider for GeminiImageProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn fetch(&self, request: &ImageFetchRequest) -> Result<String> {
        let Some(api_key) = gemini_api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = gemini_endpoint(&self.api_base, &self.model);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": &request.prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": "9:16" },
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(IMAGE_REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let body = response_json_or_error("Gemini", response)?;

        let candidates = body
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/jpeg");
                return Ok(format!("data:{mime};base64,{data}"));
            }
        }
        bail!("Gemini returned no image");
    }
}

pub struct PexelsProvider {
    api_base: String,
    http: HttpClient,
}

impl PexelsProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("PEXELS_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.pexels.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for PexelsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for PexelsProvider {
    fn name(&self) -> &str {
        "pexels"
    }

    fn fetch(&self, _request: &ImageFetchRequest) -> Result<String> {
        let Some(api_key) = non_empty_env("PEXELS_API_KEY") else {
            bail!("PEXELS_API_KEY not set");
        };
        let mut rng = rand::thread_rng();
        let query = pick(NATURE_QUERIES, &mut rng);
        let page = rng.gen_range(1..=50);
        let endpoint = format!("{}/search", self.api_base);

        let response = self
            .http
            .get(&endpoint)
            .header(AUTHORIZATION, api_key.as_str())
            .query(&[
                ("query", query),
                ("orientation", "portrait"),
                ("per_page", "1"),
                ("page", page.to_string().as_str()),
            ])
            .timeout(STOCK_REQUEST_TIMEOUT)
            .send()
            .with_context(|| format!("Pexels request failed ({endpoint})"))?;
        let body = response_json_or_error("Pexels", response)?;

        body.get("photos")
            .and_then(Value::as_array)
            .and_then(|photos| photos.first())
            .and_then(|photo| photo.get("src"))
            .and_then(|src| src.get("portrait"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Pexels returned no photos")
    }
}

pub struct PixabayProvider {
    api_base: String,
    http: HttpClient,
}

impl PixabayProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("PIXABAY_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://pixabay.com/api".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for PixabayProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for PixabayProvider {
    fn name(&self) -> &str {
        "pixabay"
    }

    fn fetch(&self, _request: &ImageFetchRequest) -> Result<String> {
        let Some(api_key) = non_empty_env("PIXABAY_API_KEY") else {
            bail!("PIXABAY_API_KEY not set");
        };
        let mut rng = rand::thread_rng();
        let query = pick(NATURE_QUERIES, &mut rng);
        let page = rng.gen_range(1..=20);

        let response = self
            .http
            .get(&self.api_base)
            .query(&[
                ("key", api_key.as_str()),
                ("q", query),
                ("image_type", "photo"),
                ("orientation", "vertical"),
                ("safesearch", "true"),
                ("per_page", "3"),
                ("page", page.to_string().as_str()),
            ])
            .timeout(STOCK_REQUEST_TIMEOUT)
            .send()
            .with_context(|| format!("Pixabay request failed ({})", self.api_base))?;
        let body = response_json_or_error("Pixabay", response)?;

        let hits = body
            .get("hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let hit = hits.choose(&mut rng).context("Pixabay returned no photos")?;
        hit.get("largeImageURL")
            .or_else(|| hit.get("webformatURL"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Pixabay returned no photos")
    }
}

/// Offline stand-in: a solid-color 9:16 JPEG data URL derived from the
/// prompt, so downstream code exercises the same URL plumbing.
pub struct DryrunImageProvider;

impl ImageProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn fetch(&self, request: &ImageFetchRequest) -> Result<String> {
        let (r, g, b) = color_from_prompt(&request.prompt);
        let mut canvas = RgbImage::new(90, 160);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        encoder
            .encode_image(&DynamicImage::ImageRgb8(canvas))
            .context("dryrun image encode failed")?;
        Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(bytes)))
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Ordered strategy chain: the retried primary first, then each stock tier
/// once. When every tier fails the *primary's* error is re-raised so the
/// caller sees the root cause, not the last fallback's complaint.
pub fn fetch_with_fallback(
    primary: &dyn ImageProvider,
    fallbacks: &[&dyn ImageProvider],
    request: &ImageFetchRequest,
    policy: &RetryPolicy,
) -> Result<(String, String)> {
    let primary_err = match retry_with_backoff(policy, || primary.fetch(request)) {
        Ok(url) => return Ok((url, primary.name().to_string())),
        Err(err) => err,
    };
    for provider in fallbacks {
        if let Ok(url) = provider.fetch(request) {
            return Ok((url, provider.name().to_string()));
        }
    }
    Err(primary_err)
}

// ---------------------------------------------------------------------------
// Suggestion requests

#[derive(Debug, Clone, Default)]
pub struct SuggestionQuery {
    pub theme: String,
    pub book: Option<String>,
    pub chapter: Option<String>,
    pub verse: Option<String>,
}

impl SuggestionQuery {
    pub fn themed(theme: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            ..Self::default()
        }
    }

    fn trimmed(value: &Option<String>) -> Option<&str> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn suggestion_prompt(query: &SuggestionQuery) -> String {
    let book = SuggestionQuery::trimmed(&query.book);
    let chapter = SuggestionQuery::trimmed(&query.chapter);
    let verse = SuggestionQuery::trimmed(&query.verse);
    let theme = query.theme.trim();

    if let (Some(book), Some(chapter)) = (book, chapter) {
        let mut prompt = format!(
            "Liste todos os versículos do livro de {book}, capítulo {chapter} da \
             Bíblia Sagrada (versão ACF)."
        );
        if let Some(verse) = verse {
            prompt.push_str(&format!(
                " O usuário buscou especificamente pelo versículo {verse}."
            ));
        }
        return prompt;
    }

    if !theme.is_empty() {
        let mut prompt = format!(
            "Para o tema '{theme}', forneça uma lista de 5 versículos bíblicos \
             inspiradores da tradução Almeida Corrigida Fiel (ACF) em português do Brasil."
        );
        if let Some(book) = book {
            prompt.push_str(&format!(" Filtre apenas pelo livro de {book}."));
        }
        return prompt;
    }

    "Forneça 5 versículos bíblicos inspiradores aleatórios.".to_string()
}

fn verse_list_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "verses": {
                "type": "ARRAY",
                "description": "Uma lista de versículos bíblicos em português do Brasil.",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "verseText": {
                            "type": "STRING",
                            "description": "O texto completo do versículo bíblico.",
                        },
                        "verseReference": {
                            "type": "STRING",
                            "description": "A referência do versículo (ex: João 3:16).",
                        },
                    },
                    "required": ["verseText", "verseReference"],
                },
            },
        },
        "required": ["verses"],
    })
}

fn single_verse_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "verseText": {
                "type": "STRING",
                "description": "O texto completo do versículo bíblico.",
            },
            "verseReference": {
                "type": "STRING",
                "description": "A referência do versículo (ex: João 3:16).",
            },
        },
        "required": ["verseText", "verseReference"],
    })
}

fn explanation_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "explanation": {
                "type": "STRING",
                "description": "Uma explicação curta, inspiradora e de fácil entendimento \
                     do versículo, em português do Brasil.",
            },
        },
        "required": ["explanation"],
    })
}

fn parse_suggestion_list(payload: &Value) -> Result<Vec<VerseSuggestion>> {
    let rows = payload
        .get("verses")
        .and_then(Value::as_array)
        .cloned()
        .or_else(|| payload.as_array().cloned())
        .context("suggestion payload missing the verses list")?;
    let mut verses = Vec::new();
    for row in rows {
        if let Ok(parsed) = serde_json::from_value::<VerseSuggestion>(row) {
            if parsed.is_complete() {
                verses.push(parsed);
            }
        }
    }
    if verses.is_empty() {
        bail!("suggestion payload contained no usable verses");
    }
    Ok(verses)
}

fn parse_single_verse(payload: &Value) -> Result<VerseSuggestion> {
    let parsed = serde_json::from_value::<VerseSuggestion>(payload.clone())
        .context("single verse payload did not match the expected shape")?;
    if !parsed.is_complete() {
        bail!("single verse payload had empty fields");
    }
    Ok(parsed)
}

fn parse_explanation(payload: &Value) -> Result<String> {
    payload
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .context("explanation payload missing the explanation field")
}

// ---------------------------------------------------------------------------
// Engine

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Auto,
    Pexels,
    Pixabay,
}

impl ImageSource {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "pexels" => Ok(Self::Pexels),
            "pixabay" => Ok(Self::Pixabay),
            other => bail!("image source must be auto, pexels or pixabay (got '{other}')"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pexels => "pexels",
            Self::Pixabay => "pixabay",
        }
    }
}

impl Default for ImageSource {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub text_model: String,
    pub image_model: String,
    pub image_source: ImageSource,
    pub style_id: String,
    pub suggestion_fallback: bool,
    pub explanation_fallback: bool,
    pub text_retry: RetryPolicy,
    pub image_retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            text_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            image_source: ImageSource::Auto,
            style_id: "cinematic".to_string(),
            suggestion_fallback: true,
            explanation_fallback: true,
            text_retry: RetryPolicy::for_text(),
            image_retry: RetryPolicy::for_image(),
        }
    }
}

const STOCK_FALLBACK_ORDER: &[&str] = &["pexels", "pixabay"];

/// Orchestrates suggestion, explanation and image generation, and owns the
/// persisted gallery and verse-of-the-day stores.
pub struct CardEngine {
    gallery: GalleryStore,
    daily: DailyVerseStore,
    journal: EventJournal,
    text: Box<dyn TextProvider>,
    images: ImageProviderRegistry,
    generative: String,
    options: EngineOptions,
}

impl CardEngine {
    pub fn new(
        data_dir: impl AsRef<Path>,
        events_path: impl AsRef<Path>,
        options: EngineOptions,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let gallery = GalleryStore::load(data_dir.join("gallery.json"));
        let daily = DailyVerseStore::new(data_dir.join("daily.json"));
        let journal = EventJournal::new(events_path.as_ref(), Uuid::new_v4().to_string());

        let text: Box<dyn TextProvider> = if options.text_model.starts_with("dryrun") {
            Box::new(DryrunTextProvider)
        } else {
            Box::new(GeminiTextProvider::new(&options.text_model))
        };
        let mut images = ImageProviderRegistry::new();
        let generative = if options.image_model.starts_with("dryrun") {
            images.register(DryrunImageProvider);
            "dryrun".to_string()
        } else {
            images.register(GeminiImageProvider::new(&options.image_model));
            "gemini".to_string()
        };
        images.register(PexelsProvider::new());
        images.register(PixabayProvider::new());

        journal.record(
            "session_started",
            map_object(json!({
                "data_dir": data_dir.to_string_lossy(),
                "gallery_items": gallery.len(),
                "text_provider": text.name(),
                "image_provider": generative.as_str(),
            })),
        )?;

        Ok(Self {
            gallery,
            daily,
            journal,
            text,
            images,
            generative,
            options,
        })
    }

    pub fn gallery(&self) -> &GalleryStore {
        &self.gallery
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Themed / book-filtered verse suggestions, with the offline dictionary
    /// standing in when the live request fails.
    pub fn suggest_verses(&self, query: &SuggestionQuery) -> Result<Vec<VerseSuggestion>> {
        self.journal.record(
            "suggestions_requested",
            map_object(json!({
                "theme": &query.theme,
                "book": &query.book,
                "chapter": &query.chapter,
            })),
        )?;

        let request = TextGenerateRequest {
            prompt: suggestion_prompt(query),
            system_instruction: SYSTEM_BIBLE_ASSISTANT.to_string(),
            response_schema: verse_list_schema(),
            temperature: 1.0,
        };
        let outcome = retry_with_backoff(&self.options.text_retry, || {
            self.text.generate_json(&request)
        })
        .and_then(|payload| parse_suggestion_list(&payload));

        match outcome {
            Ok(verses) => {
                self.journal.record(
                    "suggestions_ready",
                    map_object(json!({ "count": verses.len() })),
                )?;
                Ok(verses)
            }
            Err(err) => {
                if !self.options.suggestion_fallback {
                    self.record_failure("suggestions", &err)?;
                    return Err(err).context("verse suggestion request failed");
                }
                let verses =
                    fallback::suggestions_for_theme(&query.theme, 5, &mut rand::thread_rng());
                self.journal.record(
                    "suggestions_fallback",
                    map_object(json!({
                        "theme": &query.theme,
                        "count": verses.len(),
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                Ok(verses)
            }
        }
    }

    /// One random verse, sampled hot and salted with a nonce so back-to-back
    /// calls do not repeat.
    pub fn random_verse(&self) -> Result<VerseSuggestion> {
        let request = TextGenerateRequest {
            prompt: format!(
                "Forneça um único versículo bíblico inspirador aleatório da tradução \
                 Almeida Corrigida Fiel (ACF) em português do Brasil. Tente variar os \
                 livros e capítulos. (Pedido: {})",
                Uuid::new_v4()
            ),
            system_instruction: SYSTEM_BIBLE_ASSISTANT.to_string(),
            response_schema: single_verse_schema(),
            temperature: 1.1,
        };
        retry_with_backoff(&self.options.text_retry, || {
            self.text.generate_json(&request)
        })
        .and_then(|payload| parse_single_verse(&payload))
        .context("random verse request failed")
    }

    pub fn explain_verse(&self, suggestion: &VerseSuggestion) -> Result<String> {
        let request = TextGenerateRequest {
            prompt: format!(
                "Forneça uma explicação breve e inspiradora para o seguinte versículo \
                 bíblico: \"{}\" ({}). A explicação deve ser em português do Brasil.",
                suggestion.verse_text, suggestion.verse_reference
            ),
            system_instruction: SYSTEM_THEOLOGIAN.to_string(),
            response_schema: explanation_schema(),
            temperature: 1.0,
        };
        let outcome = retry_with_backoff(&self.options.text_retry, || {
            self.text.generate_json(&request)
        })
        .and_then(|payload| parse_explanation(&payload));

        match outcome {
            Ok(explanation) => Ok(explanation),
            Err(err) => {
                if !self.options.explanation_fallback {
                    return Err(err).context("explanation request failed");
                }
                self.journal.record(
                    "explanation_fallback",
                    map_object(json!({
                        "reference": &suggestion.verse_reference,
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                Ok(format!(
                    "Este versículo nos convida a refletir sobre a profundidade da fé e o \
                     amor divino presente em nossas vidas através da palavra. ({})",
                    suggestion.verse_reference
                ))
            }
        }
    }

    /// Resolves one image URL for the configured source. `auto` runs the
    /// retried generative provider and degrades through the stock tiers,
    /// re-raising the generative error when everything fails.
    pub fn fetch_image(&self, prompt: &str, source: ImageSource) -> Result<String> {
        let request = ImageFetchRequest {
            prompt: prompt.to_string(),
        };
        match source {
            ImageSource::Pexels => self.stock_provider("pexels")?.fetch(&request),
            ImageSource::Pixabay => self.stock_provider("pixabay")?.fetch(&request),
            ImageSource::Auto => {
                let primary = self.images.get(&self.generative).with_context(|| {
                    format!("image provider '{}' not registered", self.generative)
                })?;
                let fallbacks: Vec<&dyn ImageProvider> = STOCK_FALLBACK_ORDER
                    .iter()
                    .filter_map(|name| self.images.get(name))
                    .collect();
                let (url, provider) =
                    fetch_with_fallback(primary, &fallbacks, &request, &self.options.image_retry)?;
                if provider != self.generative {
                    self.journal.record(
                        "image_fallback",
                        map_object(json!({ "provider": provider })),
                    )?;
                }
                Ok(url)
            }
        }
    }

    fn stock_provider(&self, name: &str) -> Result<&dyn ImageProvider> {
        self.images
            .get(name)
            .with_context(|| format!("image provider '{name}' not registered"))
    }

    /// Explanation and image resolved concurrently, joined into one card.
    fn resolve_card(&self, suggestion: &VerseSuggestion, source: ImageSource) -> Result<VerseResult> {
        let style = style_by_id(&self.options.style_id).unwrap_or(&IMAGE_STYLES[0]);
        let context = format!("Relacionada ao versículo \"{}\"", suggestion.verse_text);
        let image_prompt = compose_image_prompt(style, &context, &mut rand::thread_rng());

        let engine: &CardEngine = self;
        let (explanation, image_url) = thread::scope(|scope| {
            let explanation_worker = scope.spawn(|| engine.explain_verse(suggestion));
            let image_worker = scope.spawn(|| engine.fetch_image(&image_prompt, source));
            (explanation_worker.join(), image_worker.join())
        });
        let explanation = explanation.map_err(|_| anyhow!("explanation worker panicked"))??;
        let image_url = image_url.map_err(|_| anyhow!("image worker panicked"))??;

        Ok(VerseResult::from_parts(
            suggestion.clone(),
            explanation,
            image_url,
        ))
    }

    /// Full pipeline for a picked suggestion; the finished card is prepended
    /// to the gallery.
    pub fn generate_card(&mut self, suggestion: &VerseSuggestion) -> Result<VerseResult> {
        let result = match self.resolve_card(suggestion, self.options.image_source) {
            Ok(result) => result,
            Err(err) => {
                self.record_failure("card", &err)?;
                return Err(err).context("card generation failed");
            }
        };
        self.gallery.add_front(result.clone())?;
        self.journal.record(
            "card_created",
            map_object(json!({
                "id": &result.id,
                "reference": &result.verse_reference,
                "gallery_items": self.gallery.len(),
            })),
        )?;
        Ok(result)
    }

    /// Verse of the day: a fresh same-day cache entry short-circuits the
    /// whole pipeline; anything else regenerates and overwrites the cache.
    pub fn verse_of_the_day(&mut self, force_refresh: bool) -> Result<VerseResult> {
        let today = today_local();
        if force_refresh {
            self.daily.clear()?;
            self.journal
                .record("daily_cache_cleared", EventPayload::new())?;
        } else if let Some(verse) = self.daily.fresh(&today) {
            self.journal.record(
                "daily_cache_hit",
                map_object(json!({ "date": &today, "id": &verse.id })),
            )?;
            return Ok(verse);
        }

        self.journal
            .record("daily_refresh_started", map_object(json!({ "date": &today })))?;
        let verse = match self.daily_pipeline() {
            Ok(verse) => verse,
            Err(err) => {
                self.journal.record(
                    "daily_fallback",
                    map_object(json!({ "error": error_chain_text(&err, 512) })),
                )?;
                fallback::seed_card(&mut rand::thread_rng())
            }
        };
        self.daily.store(&verse, &today)?;
        self.journal.record(
            "daily_ready",
            map_object(json!({ "id": &verse.id, "reference": &verse.verse_reference })),
        )?;
        Ok(verse)
    }

    fn daily_pipeline(&self) -> Result<VerseResult> {
        let suggestion = self.random_verse()?;
        self.resolve_card(&suggestion, ImageSource::Auto)
    }

    /// Swaps the image of a gallery card (or of the cached daily verse) using
    /// the configured style and source.
    pub fn regenerate_image(&mut self, id: &str) -> Result<VerseResult> {
        let target = self
            .gallery
            .get(id)
            .cloned()
            .map(|item| (item, false))
            .or_else(|| {
                self.daily
                    .load()
                    .filter(|entry| entry.verse.id == id)
                    .map(|entry| (entry.verse, true))
            });
        let Some((item, is_daily)) = target else {
            bail!("no card with id '{id}'");
        };

        let style = style_by_id(&self.options.style_id).unwrap_or(&IMAGE_STYLES[0]);
        let context = format!("Relacionada ao versículo \"{}\"", item.verse_text);
        let prompt = compose_image_prompt(style, &context, &mut rand::thread_rng());
        let image_url = self.fetch_image(&prompt, self.options.image_source)?;

        let updated = if is_daily {
            let mut updated = item;
            updated.image_url = image_url;
            self.daily.store(&updated, &today_local())?;
            updated
        } else {
            self.gallery
                .replace_image(id, &image_url)?
                .with_context(|| format!("no card with id '{id}'"))?
        };
        self.journal.record(
            "image_replaced",
            map_object(json!({ "id": id, "daily": is_daily })),
        )?;
        Ok(updated)
    }

    pub fn toggle_favorite(&mut self, id: &str) -> Result<bool> {
        let state = self
            .gallery
            .toggle_favorite(id)?
            .with_context(|| format!("no card with id '{id}'"))?;
        self.journal.record(
            "favorite_toggled",
            map_object(json!({ "id": id, "favorite": state })),
        )?;
        Ok(state)
    }

    pub fn remove_card(&mut self, id: &str) -> Result<bool> {
        let removed = self.gallery.remove(id)?;
        if removed {
            self.journal
                .record("card_removed", map_object(json!({ "id": id })))?;
        }
        Ok(removed)
    }

    fn record_failure(&self, stage: &str, err: &anyhow::Error) -> Result<()> {
        self.journal.record(
            "generation_failed",
            map_object(json!({
                "stage": stage,
                "error": error_chain_text(err, 2048),
            })),
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared helpers

fn gemini_api_base() -> String {
    env::var("GEMINI_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
}

fn gemini_api_key() -> Option<String> {
    non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
}

fn gemini_endpoint(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{api_base}/{model_path}:generateContent")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
