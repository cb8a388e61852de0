//! libhub-cli: command-line client for the Library Hub HTTP API
//!
//! # Subcommands
//! - `search <query> [-n <limit>] [--json] [filters]`: semantic catalog search
//! - `chat <message> [--session <id>]`: ask the library assistant
//! - `reindex`: re-embed the whole catalog
//! - `status`: show server health

use std::io::{Read, Write};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";
const DEFAULT_LIMIT: usize = 5;

/// Separates the streamed reply text from the JSON array of book cards.
const CARDS_MARKER: &str = "\n\n__JSON_START__\n";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "libhub-cli", version, about = "Library Hub catalog search and assistant CLI")]
struct Cli {
    /// Library Hub HTTP server URL (overrides LIBHUB_HTTP_URL env var)
    #[arg(long, env = "LIBHUB_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search the catalog semantically
    Search {
        /// Query text to search for
        query: String,

        /// Maximum number of results to return
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,

        /// Print the raw results as JSON
        #[arg(long)]
        json: bool,

        /// Only books of this genre (substring match)
        #[arg(long)]
        genre: Option<String>,

        /// Only books with at most this many pages
        #[arg(long)]
        max_pages: Option<i32>,

        /// Only books published in or after this year
        #[arg(long)]
        since: Option<i32>,
    },

    /// Ask the library assistant; the reply is printed as it streams
    Chat {
        /// Your message
        message: String,

        /// Session id from a previous reply, to keep follow-ups on the same books
        #[arg(long)]
        session: Option<String>,
    },

    /// Re-embed the whole catalog
    Reindex,

    /// Show Library Hub server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultMetadata {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub genres: Option<String>,
    #[serde(default)]
    pub pages: Option<i32>,
    #[serde(default)]
    pub year: Option<i32>,
}

/// One hit from POST /search
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub score: f64,
    pub metadata: ResultMetadata,
}

/// The full search response from POST /search
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
    pub count: usize,
    pub took_ms: Option<u64>,
}

/// Book card sent after the reply text of POST /chat
#[derive(Debug, Clone, Deserialize)]
pub struct BookCard {
    pub id: i64,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub cover: String,
    pub availability: String,
}

// ============================================================================
// Formatting
// ============================================================================

/// One search hit as a single line: `[id] Title by Author (genre, pages, year) 87%`.
pub fn format_result(r: &SearchResult) -> String {
    let m = &r.metadata;
    let details: Vec<String> = [
        m.genres.clone(),
        m.pages.map(|p| format!("{p} pages")),
        m.year.map(|y| y.to_string()),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut line = format!("[{}] {} by {}", r.id, m.title, m.author);
    if !details.is_empty() {
        line.push_str(&format!(" ({})", details.join(", ")));
    }
    line.push_str(&format!("  {:.0}%", r.score * 100.0));
    line
}

pub fn format_card(card: &BookCard) -> String {
    format!(
        "  • {} by {} [{}] (#{})",
        card.title, card.author, card.availability, card.id
    )
}

/// Splits a streamed chat body into printable text and the card trailer.
///
/// Text that could be the start of the marker is held back until the next
/// chunk decides it.
#[derive(Debug, Default)]
pub struct ReplySplitter {
    held: String,
    trailer: Option<String>,
}

impl ReplySplitter {
    /// Feed a chunk; returns the text that is safe to print now.
    pub fn push(&mut self, chunk: &str) -> String {
        if let Some(trailer) = &mut self.trailer {
            trailer.push_str(chunk);
            return String::new();
        }

        self.held.push_str(chunk);
        if let Some(pos) = self.held.find(CARDS_MARKER) {
            let text = self.held[..pos].to_string();
            self.trailer = Some(self.held[pos + CARDS_MARKER.len()..].to_string());
            self.held.clear();
            return text;
        }

        let keep = marker_prefix_len(&self.held);
        let split = self.held.len() - keep;
        let text = self.held[..split].to_string();
        self.held.drain(..split);
        text
    }

    /// Remaining text and the parsed cards, if a trailer arrived.
    pub fn finish(self) -> (String, Vec<BookCard>) {
        let cards = self
            .trailer
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        (self.held, cards)
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the marker.
fn marker_prefix_len(text: &str) -> usize {
    (1..CARDS_MARKER.len())
        .rev()
        .find(|&n| text.ends_with(&CARDS_MARKER[..n]))
        .unwrap_or(0)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

fn check_status(url: &str, resp: reqwest::blocking::Response) -> reqwest::blocking::Response {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("libhub-cli: {} returned {}: {}", url, status, body);
        std::process::exit(1);
    }
    resp
}

fn do_search(
    server: &str,
    query: &str,
    limit: usize,
    json_output: bool,
    filters: serde_json::Value,
) -> anyhow::Result<()> {
    let url = format!("{}/search", server);
    let body = serde_json::json!({
        "query": query,
        "limit": limit,
        "filters": filters,
    });

    let resp = match client(30)?.post(&url).json(&body).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("libhub-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let search_resp: SearchResponse = check_status(&url, resp).json()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&search_resp.results)?);
        return Ok(());
    }

    if search_resp.results.is_empty() {
        eprintln!("No books found for: {}", search_resp.query);
        return Ok(());
    }
    for r in &search_resp.results {
        println!("{}", format_result(r));
    }
    if let Some(ms) = search_resp.took_ms {
        eprintln!("\n{} results in {} ms", search_resp.count, ms);
    }
    Ok(())
}

fn do_chat(server: &str, message: &str, session: Option<&str>) -> anyhow::Result<()> {
    let url = format!("{}/chat", server);
    let body = serde_json::json!({
        "messages": [{"role": "user", "content": message}],
        "session_id": session,
    });

    let resp = match client(300)?.post(&url).json(&body).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("libhub-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let mut resp = check_status(&url, resp);
    let session_id = resp
        .headers()
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut splitter = ReplySplitter::default();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    let mut stdout = std::io::stdout();

    loop {
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);

        // Only decode complete UTF-8 sequences
        let valid = match std::str::from_utf8(&pending) {
            Ok(s) => s.len(),
            Err(e) => e.valid_up_to(),
        };
        let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
        pending.drain(..valid);

        print!("{}", splitter.push(&text));
        stdout.flush()?;
    }

    let (rest, cards) = splitter.finish();
    println!("{}", rest);
    if !cards.is_empty() {
        println!("\nBooks mentioned:");
        for card in &cards {
            println!("{}", format_card(card));
        }
    }
    if let Some(id) = session_id {
        eprintln!("\nsession: {}", id);
    }
    Ok(())
}

fn do_reindex(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/reindex", server);
    let resp = match client(3600)?.post(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("libhub-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let body: serde_json::Value = check_status(&url, resp).json()?;
    println!(
        "Embedded: {}  Skipped: {}  Removed: {}",
        body["embedded"], body["skipped"], body["removed"]
    );
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Library Hub: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:     {}", body["version"].as_str().unwrap_or("?"));
            println!(
                "Catalog:     {} ({})",
                body["catalog"]["source"].as_str().unwrap_or("?"),
                body["catalog"]["status"].as_str().unwrap_or("?")
            );
            println!(
                "Index:       {} with {} books, {} dims",
                body["index"]["backend"].as_str().unwrap_or("?"),
                body["index"]["documents"],
                body["index"]["dimensions"]
            );
            println!("Embedder:    {}", body["embedder"].as_str().unwrap_or("?"));
            println!("Generator:   {}", body["generator"].as_str().unwrap_or("?"));
            println!("PostgreSQL:  {}", body["postgresql"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("libhub-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("libhub-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Search {
            query,
            limit,
            json,
            genre,
            max_pages,
            since,
        } => {
            let filters = serde_json::json!({
                "genre": genre,
                "max_pages": max_pages,
                "year_start": since,
            });
            do_search(&server, &query, limit, json, filters)
        }
        Commands::Chat { message, session } => do_chat(&server, &message, session.as_deref()),
        Commands::Reindex => do_reindex(&server),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("libhub-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
