// src/normalize.rs
//! Content normalizer: text cleaning, URL extraction, language detection,
//! and the dedup fingerprint.
//!
//! Two posts with equal fingerprints are treated as the same story no
//! matter which channel carried them or how they were cased/punctuated.

use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::lang::detect_language;
use crate::types::{Fingerprint, NormalizedPost, RawItem};

/// Cleaned text shorter than this is considered non-content (bare emoji,
/// "ok", a lone link) and discarded.
const MIN_MEANINGFUL_CHARS: usize = 10;

/// Hard cap so a pathological post cannot blow up prompts downstream.
const MAX_TEXT_CHARS: usize = 1500;

fn url_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)https?://[-\w.]+(?::\d+)?(?:/[\w/_.%-]*(?:\?[\w&=%.-]*)?(?:#[\w.-]*)?)?")
            .unwrap()
    })
}

fn ws_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn punct_run_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"([.!?]){3,}").unwrap())
}

/// Extract all URLs in order of appearance, deduplicated within the post.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    url_re()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Clean raw post text: drop URLs, control and zero-width characters,
/// squeeze punctuation runs, collapse whitespace, trim, cap length.
pub fn clean_text(text: &str) -> String {
    // Control chars (newlines included) become separators; zero-width
    // characters vanish outright.
    let mut out: String = url_re()
        .replace_all(text, "")
        .chars()
        .filter(|c| !matches!(c, '\u{200b}'..='\u{200f}' | '\u{feff}'))
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    out = punct_run_re().replace_all(&out, "$1").into_owned();
    out = ws_re().replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

/// True when the cleaned text carries enough alphabetic signal to be worth
/// storing; bare links, emoji walls and stray digits fail this gate.
pub fn is_meaningful(cleaned: &str) -> bool {
    if cleaned.chars().count() < MIN_MEANINGFUL_CHARS {
        return false;
    }
    let alpha = cleaned.chars().filter(|c| c.is_alphabetic()).count();
    alpha * 2 >= MIN_MEANINGFUL_CHARS
}

/// Fold a char for fingerprinting: lowercase plus a small diacritic table
/// covering Latin-1/Latin-Extended accents, so "café" and "Cafe" collide.
fn fold_char(c: char) -> Option<char> {
    let c = c.to_lowercase().next().unwrap_or(c);
    let folded = match c {
        'à'..='å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'è'..='ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'ì'..='ï' | 'ī' | 'į' | 'ı' => 'i',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò'..='ö' | 'ø' | 'ō' | 'ő' => 'o',
        'ù'..='ü' | 'ū' | 'ů' | 'ű' => 'u',
        'ý' | 'ÿ' => 'y',
        'š' | 'ś' => 's',
        'ž' | 'ź' | 'ż' => 'z',
        'ď' => 'd',
        'ť' => 't',
        'ř' => 'r',
        'ł' => 'l',
        other => other,
    };
    if folded.is_alphanumeric() {
        Some(folded)
    } else if folded.is_whitespace() {
        Some(' ')
    } else {
        // Punctuation does not participate in identity.
        None
    }
}

/// Deterministic content hash over case-folded, diacritic-folded,
/// whitespace-normalized, URL- and punctuation-stripped text.
pub fn fingerprint(text: &str) -> Fingerprint {
    let stripped = url_re().replace_all(text, " ");
    let folded: String = stripped.chars().filter_map(fold_char).collect();
    let canonical = folded.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut hex, "{:02x}", b);
    }
    Fingerprint(hex)
}

/// Normalize one raw item. `None` is the discard signal for empty or
/// non-text content — expected filtering, not an error.
pub fn normalize(raw: &RawItem) -> Option<NormalizedPost> {
    let urls = extract_urls(&raw.text);
    let cleaned = clean_text(&raw.text);
    if !is_meaningful(&cleaned) {
        return None;
    }

    Some(NormalizedPost {
        channel_id: raw.channel_id,
        source_id: raw.source_id,
        fingerprint: fingerprint(&cleaned),
        lang: detect_language(&cleaned),
        text: cleaned,
        urls,
        published_at: raw.published_at,
    })
}
