// src/lang.rs
//! Heuristic language detection: script-range counting plus stop-word hits
//! for Latin-script languages. Always returns a code; short or mostly
//! non-alphabetic text degrades to `"und"` rather than failing.

/// Code returned when detection cannot commit to a language.
pub const UNKNOWN_LANG: &str = "und";

const MIN_DETECT_CHARS: usize = 3;

/// Normalize a language tag to a bare 2-letter lowercase code.
/// `en_US` and `en-GB` become `en`; the odd `ua` mislabel maps to `uk`.
pub fn normalize_lang_code(code: &str) -> String {
    let code = code.trim().to_ascii_lowercase();
    if code.is_empty() {
        return UNKNOWN_LANG.to_string();
    }
    let base = code
        .split(['_', '-'])
        .next()
        .unwrap_or(code.as_str())
        .chars()
        .take(2)
        .collect::<String>();
    match base.as_str() {
        "ua" => "uk".to_string(),
        _ => base,
    }
}

/// Detect the language of `text`. Best-effort: counts characters per
/// Unicode script, then disambiguates within a script family.
pub fn detect_language(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_DETECT_CHARS {
        return UNKNOWN_LANG.to_string();
    }

    let total = trimmed.chars().count();
    let alphabetic = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    // Mostly digits/punctuation/URLs left over: nothing to classify.
    if (alphabetic as f32) < (total as f32) * 0.3 {
        return UNKNOWN_LANG.to_string();
    }

    let mut cyrillic = 0usize;
    let mut greek = 0usize;
    let mut arabic = 0usize;
    let mut hebrew = 0usize;
    let mut cjk = 0usize;
    let mut hangul = 0usize;
    let mut kana = 0usize;
    let mut devanagari = 0usize;
    let mut thai = 0usize;
    let mut latin = 0usize;

    for c in trimmed.chars() {
        match c {
            '\u{0400}'..='\u{04FF}' => cyrillic += 1,
            '\u{0370}'..='\u{03FF}' => greek += 1,
            '\u{0600}'..='\u{06FF}' => arabic += 1,
            '\u{0590}'..='\u{05FF}' => hebrew += 1,
            '\u{4E00}'..='\u{9FFF}' => cjk += 1,
            '\u{AC00}'..='\u{D7AF}' => hangul += 1,
            '\u{3040}'..='\u{30FF}' => kana += 1,
            '\u{0900}'..='\u{097F}' => devanagari += 1,
            '\u{0E00}'..='\u{0E7F}' => thai += 1,
            c if c.is_ascii_alphabetic() || ('\u{00C0}'..='\u{024F}').contains(&c) => latin += 1,
            _ => {}
        }
    }

    let scripts = [
        (cyrillic, "cyr"),
        (greek, "el"),
        (arabic, "ar"),
        (hebrew, "he"),
        (cjk, "zh"),
        (hangul, "ko"),
        (kana, "ja"),
        (devanagari, "hi"),
        (thai, "th"),
        (latin, "lat"),
    ];
    let (count, tag) = scripts
        .iter()
        .max_by_key(|(n, _)| *n)
        .copied()
        .unwrap_or((0, "lat"));
    if count == 0 {
        return UNKNOWN_LANG.to_string();
    }

    match tag {
        "cyr" => disambiguate_cyrillic(trimmed),
        "lat" => disambiguate_latin(trimmed),
        other => other.to_string(),
    }
}

/// Ukrainian carries letters Russian never uses; the reverse holds for `ы`/`э`.
fn disambiguate_cyrillic(text: &str) -> String {
    let lower = text.to_lowercase();
    let uk_hits = lower.chars().filter(|c| "їєіґ".contains(*c)).count();
    let ru_hits = lower.chars().filter(|c| "ыэъё".contains(*c)).count();
    if uk_hits > ru_hits {
        "uk".to_string()
    } else {
        "ru".to_string()
    }
}

/// Stop-word scoring across common Latin-script languages. The lists are
/// tiny on purpose: short function words are frequent enough that a few
/// hits decide the winner on any real post.
fn disambiguate_latin(text: &str) -> String {
    const TABLES: &[(&str, &[&str])] = &[
        ("en", &["the", "and", "of", "to", "is", "in", "that", "for", "on", "with"]),
        ("de", &["der", "die", "und", "das", "ist", "nicht", "ein", "mit", "auf", "für"]),
        ("fr", &["le", "la", "les", "et", "des", "est", "une", "dans", "pour", "que"]),
        ("es", &["el", "la", "los", "las", "y", "es", "una", "por", "para", "con"]),
        ("it", &["il", "la", "di", "che", "è", "per", "una", "sono", "con", "del"]),
        ("pt", &["o", "a", "os", "as", "é", "um", "uma", "para", "com", "não"]),
        ("pl", &["i", "w", "na", "się", "nie", "jest", "że", "do", "z", "to"]),
    ];

    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphabetic())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return UNKNOWN_LANG.to_string();
    }

    let mut best = ("en", 0usize);
    for (code, words) in TABLES {
        let hits = tokens.iter().filter(|t| words.contains(*t)).count();
        if hits > best.1 {
            best = (code, hits);
        }
    }
    // No stop-word hit at all: Latin script but unknown language.
    if best.1 == 0 {
        return UNKNOWN_LANG.to_string();
    }
    best.0.to_string()
}
