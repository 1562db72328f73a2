use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use palavra_contracts::cards::{VerseResult, VerseSuggestion};
use palavra_engine::{
    style_by_id, CardEngine, EngineOptions, ImageSource, SuggestionQuery, IMAGE_STYLES,
};
use reqwest::blocking::Client as HttpClient;

#[derive(Debug, Parser)]
#[command(name = "palavra-rs", version, about = "Verse-card generator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List verse suggestions for a theme or a book/chapter.
    Suggest(SuggestArgs),
    /// Print one random verse.
    Random(EngineArgs),
    /// Generate a full card (explanation + image) and add it to the gallery.
    Card(CardArgs),
    /// Show the verse of the day, regenerating when the cache is stale.
    Daily(DailyArgs),
    /// Inspect or mutate the stored gallery.
    Gallery(GalleryArgs),
    /// Write a card's image as a JPEG and print its share caption.
    Export(ExportArgs),
}

#[derive(Debug, Parser)]
struct EngineArgs {
    #[arg(long, default_value = ".palavra")]
    data_dir: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini-2.5-flash")]
    text_model: String,
    #[arg(long, default_value = "gemini-2.5-flash-image")]
    image_model: String,
    #[arg(long, default_value = "auto")]
    source: String,
    #[arg(long, default_value = "cinematic")]
    style: String,
}

impl EngineArgs {
    fn build_engine(&self) -> Result<CardEngine> {
        if style_by_id(&self.style).is_none() {
            let known = IMAGE_STYLES
                .iter()
                .map(|style| style.id)
                .collect::<Vec<&str>>()
                .join(", ");
            bail!("unknown style '{}' (available: {known})", self.style);
        }
        let options = EngineOptions {
            text_model: self.text_model.clone(),
            image_model: self.image_model.clone(),
            image_source: ImageSource::parse(&self.source)?,
            style_id: self.style.clone(),
            ..EngineOptions::default()
        };
        let events_path = self
            .events
            .clone()
            .unwrap_or_else(|| self.data_dir.join("events.jsonl"));
        CardEngine::new(&self.data_dir, &events_path, options)
    }
}

#[derive(Debug, Parser)]
struct SuggestArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long, default_value = "")]
    theme: String,
    #[arg(long)]
    book: Option<String>,
    #[arg(long)]
    chapter: Option<String>,
    #[arg(long)]
    verse: Option<String>,
}

#[derive(Debug, Parser)]
struct CardArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long, default_value = "")]
    theme: String,
    #[arg(long)]
    book: Option<String>,
    #[arg(long)]
    chapter: Option<String>,
    #[arg(long)]
    verse: Option<String>,
    /// 1-based index into the suggestion list.
    #[arg(long, default_value_t = 1)]
    pick: usize,
    /// Skip the suggestion step and use this verse text directly.
    #[arg(long)]
    text: Option<String>,
    /// Reference for --text (e.g. "João 3:16").
    #[arg(long)]
    reference: Option<String>,
}

#[derive(Debug, Parser)]
struct DailyArgs {
    #[command(flatten)]
    engine: EngineArgs,
    /// Discard the cached verse and regenerate unconditionally.
    #[arg(long)]
    refresh: bool,
}

#[derive(Debug, Parser)]
struct GalleryArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[command(subcommand)]
    action: GalleryAction,
}

#[derive(Debug, Subcommand)]
enum GalleryAction {
    /// List stored cards, newest first.
    List,
    /// Toggle the favorite flag of a card.
    Favorite {
        #[arg(long)]
        id: String,
    },
    /// Remove a card after confirmation.
    Remove {
        #[arg(long)]
        id: String,
        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Fetch a new image for a card using the configured style and source.
    Regenerate {
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    id: String,
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("palavra-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Suggest(args) => run_suggest(args),
        Command::Random(args) => run_random(args),
        Command::Card(args) => run_card(args),
        Command::Daily(args) => run_daily(args),
        Command::Gallery(args) => run_gallery(args),
        Command::Export(args) => run_export(args),
    }
}

fn run_suggest(args: SuggestArgs) -> Result<i32> {
    let engine = args.engine.build_engine()?;
    let query = SuggestionQuery {
        theme: args.theme,
        book: args.book,
        chapter: args.chapter,
        verse: args.verse,
    };
    let suggestions = engine.suggest_verses(&query)?;
    print_suggestions(&suggestions);
    Ok(0)
}

fn run_random(args: EngineArgs) -> Result<i32> {
    let engine = args.build_engine()?;
    let verse = engine.random_verse()?;
    println!("\"{}\"", verse.verse_text);
    println!("— {}", verse.verse_reference);
    Ok(0)
}

fn run_card(args: CardArgs) -> Result<i32> {
    let mut engine = args.engine.build_engine()?;

    let suggestion = match (&args.text, &args.reference) {
        (Some(text), Some(reference)) => VerseSuggestion::new(text.clone(), reference.clone()),
        (Some(_), None) | (None, Some(_)) => {
            bail!("--text and --reference must be provided together");
        }
        (None, None) => {
            let query = SuggestionQuery {
                theme: args.theme,
                book: args.book,
                chapter: args.chapter,
                verse: args.verse,
            };
            let suggestions = engine.suggest_verses(&query)?;
            print_suggestions(&suggestions);
            let index = args
                .pick
                .checked_sub(1)
                .filter(|index| *index < suggestions.len())
                .with_context(|| {
                    format!(
                        "--pick must be between 1 and {} (got {})",
                        suggestions.len(),
                        args.pick
                    )
                })?;
            suggestions[index].clone()
        }
    };

    let card = engine.generate_card(&suggestion)?;
    print_card(&card);
    Ok(0)
}

fn run_daily(args: DailyArgs) -> Result<i32> {
    let mut engine = args.engine.build_engine()?;
    let card = engine.verse_of_the_day(args.refresh)?;
    println!("Versículo do dia");
    print_card(&card);
    Ok(0)
}

fn run_gallery(args: GalleryArgs) -> Result<i32> {
    let mut engine = args.engine.build_engine()?;
    match args.action {
        GalleryAction::List => {
            if engine.gallery().is_empty() {
                println!("Galeria vazia.");
                return Ok(0);
            }
            for item in engine.gallery().items() {
                let marker = if item.is_favorite { "★" } else { " " };
                println!("{marker} {}  {}  {}", item.id, item.verse_reference, short(&item.verse_text, 48));
            }
            println!("{} itens.", engine.gallery().len());
            Ok(0)
        }
        GalleryAction::Favorite { id } => {
            let state = engine.toggle_favorite(&id)?;
            println!(
                "{} {}",
                id,
                if state { "marcado como favorito" } else { "desmarcado" }
            );
            Ok(0)
        }
        GalleryAction::Remove { id, yes } => {
            let Some(item) = engine.gallery().get(&id).cloned() else {
                bail!("no card with id '{id}'");
            };
            if !yes {
                let stdin = io::stdin();
                if !confirm_removal(&item.verse_reference, &mut stdin.lock())? {
                    println!("Cancelado.");
                    return Ok(0);
                }
            }
            engine.remove_card(&id)?;
            println!("Removido {id}.");
            Ok(0)
        }
        GalleryAction::Regenerate { id } => {
            let updated = engine.regenerate_image(&id)?;
            println!("Nova imagem para {}:", updated.verse_reference);
            println!("{}", short(&updated.image_url, 96));
            Ok(0)
        }
    }
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let engine = args.engine.build_engine()?;
    let item = engine
        .gallery()
        .get(&args.id)
        .cloned()
        .with_context(|| format!("no card with id '{}'", args.id))?;

    let bytes = image_bytes_from_url(&item.image_url)?;
    let decoded = image::load_from_memory(&bytes).context("unsupported image payload")?;
    let mut out_bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out_bytes, 90);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(decoded.to_rgb8()))
        .context("JPEG encode failed")?;
    if let Some(parent) = args.out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, out_bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    println!("{}", item.caption());
    println!("Imagem salva em {}", args.out.display());
    Ok(0)
}

fn confirm_removal(reference: &str, input: &mut impl BufRead) -> Result<bool> {
    print!("Excluir \"{reference}\"? [y/N] ");
    io::stdout().flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(is_affirmative(&line))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "s" | "sim"
    )
}

fn print_suggestions(suggestions: &[VerseSuggestion]) {
    for (index, suggestion) in suggestions.iter().enumerate() {
        println!("{}. \"{}\"", index + 1, suggestion.verse_text);
        println!("   — {}", suggestion.verse_reference);
    }
}

fn print_card(card: &VerseResult) {
    println!("\"{}\"", card.verse_text);
    println!("— {}", card.verse_reference);
    println!();
    println!("{}", card.explanation);
    println!();
    println!("imagem: {}", short(&card.image_url, 96));
    println!("id: {}", card.id);
}

fn short(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn image_bytes_from_url(url: &str) -> Result<Vec<u8>> {
    if url.starts_with("data:") {
        let payload = url
            .split_once("base64,")
            .map(|(_, data)| data)
            .context("data URL without a base64 payload")?;
        return BASE64
            .decode(payload.as_bytes())
            .context("data URL base64 decode failed");
    }
    let response = HttpClient::new()
        .get(url)
        .timeout(Duration::from_secs(60))
        .send()
        .with_context(|| format!("image download failed ({url})"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("image download failed ({})", status.as_u16());
    }
    Ok(response.bytes()?.to_vec())
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    use super::{confirm_removal, image_bytes_from_url, is_affirmative, short};

    #[test]
    fn affirmative_answers_in_both_languages() {
        for answer in ["y", "Y", "yes", "s", "Sim", " sim \n"] {
            assert!(is_affirmative(answer), "{answer}");
        }
        for answer in ["", "n", "no", "não", "talvez"] {
            assert!(!is_affirmative(answer), "{answer}");
        }
    }

    #[test]
    fn confirm_removal_reads_one_line() -> anyhow::Result<()> {
        let mut input = std::io::Cursor::new(b"sim\n".to_vec());
        assert!(confirm_removal("Salmos 23:1", &mut input)?);

        let mut input = std::io::Cursor::new(b"\n".to_vec());
        assert!(!confirm_removal("Salmos 23:1", &mut input)?);
        Ok(())
    }

    #[test]
    fn data_url_decoding_roundtrips() -> anyhow::Result<()> {
        let bytes = vec![1u8, 2, 3, 4];
        let url = format!("data:image/jpeg;base64,{}", BASE64.encode(&bytes));
        assert_eq!(image_bytes_from_url(&url)?, bytes);

        assert!(image_bytes_from_url("data:image/jpeg;nope").is_err());
        Ok(())
    }

    #[test]
    fn short_truncates_on_char_boundaries() {
        assert_eq!(short("céu azul", 48), "céu azul");
        assert_eq!(short("céu azul", 3), "céu…");
    }
}
