//! ============================================================================
//! Canonical Facts - Normalization and shape checks
//! ============================================================================
//! A canonical fact is one third-person declarative sentence about the user:
//! "User prefers Python language", "User's name is Alice".
//! ============================================================================

/// Longest sentence accepted as a fact
pub const MAX_FACT_LEN: usize = 200;

const FIRST_PERSON: &[&str] = &[
    "i", "i'm", "i've", "i'd", "i'll", "me", "my", "mine", "myself", "we", "our",
];

/// Quote pairs that may wrap a whole fact
const QUOTE_PAIRS: &[(char, char)] = &[
    ('"', '"'),
    ('\'', '\''),
    ('`', '`'),
    ('“', '”'),
    ('‘', '’'),
];

/// Tokens that end with a period without ending the sentence
const ABBREVIATIONS: &[&str] = &[
    "dr", "mr", "mrs", "ms", "prof", "st", "jr", "sr", "mt", "vs", "etc", "e.g", "i.e", "approx",
    "inc", "ltd", "co", "no",
];

/// Trim, unwrap quotes, collapse whitespace and drop trailing punctuation
pub fn normalize(text: &str) -> String {
    let trimmed = unwrap_quotes(text.trim());

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | ';' | ','))
        .trim_end()
        .to_string()
}

/// Strip quotes only when one matching pair wraps the whole text.
/// `'Yesterday'` inside a sentence keeps its quotes.
fn unwrap_quotes(mut text: &str) -> &str {
    loop {
        let mut chars = text.chars();
        let (Some(first), Some(last)) = (chars.next(), chars.next_back()) else {
            return text;
        };
        let Some(&(open, close)) = QUOTE_PAIRS
            .iter()
            .find(|(open, close)| *open == first && *close == last)
        else {
            return text;
        };

        let inner = &text[first.len_utf8()..text.len() - last.len_utf8()];
        if has_loose_quote(inner, open, close) {
            return text;
        }
        text = inner.trim();
    }
}

/// Whether `inner` holds `open`/`close` other than as an apostrophe between letters
fn has_loose_quote(inner: &str, open: char, close: char) -> bool {
    let chars: Vec<char> = inner.chars().collect();
    chars.iter().enumerate().any(|(i, &c)| {
        if c != open && c != close {
            return false;
        }
        let before = i.checked_sub(1).and_then(|j| chars.get(j));
        let after = chars.get(i + 1);
        !(before.is_some_and(|b| b.is_alphanumeric()) && after.is_some_and(|a| a.is_alphanumeric()))
    })
}

/// Split `text` into trimmed sentences.
///
/// A period ends a sentence only when the next word is capitalized and the
/// token before it is not an abbreviation or an initial ("Dr. Smith",
/// "e.g. Rust", "J. Smith").
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for (i, c) in text.char_indices() {
        let end = i + c.len_utf8();
        let boundary = match c {
            '\n' | '?' => true,
            '!' => next_starts_sentence(&text[end..]),
            '.' => next_starts_sentence(&text[end..]) && !ends_with_abbreviation(&text[start..i]),
            _ => false,
        };
        if boundary {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

fn next_starts_sentence(rest: &str) -> bool {
    rest.starts_with(char::is_whitespace)
        && rest.trim_start().chars().next().is_some_and(char::is_uppercase)
}

fn ends_with_abbreviation(before: &str) -> bool {
    let token = before
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    let is_initial = token.chars().count() == 1 && token.chars().all(char::is_alphabetic);
    is_initial || ABBREVIATIONS.contains(&token.as_str())
}

/// Whether `text` (already normalized) is a canonical fact sentence
pub fn is_canonical(text: &str) -> bool {
    if text.is_empty() || text.len() > MAX_FACT_LEN {
        return false;
    }
    if !(text.starts_with("User ") || text.starts_with("User's ")) {
        return false;
    }
    if text.contains('\n') || text.contains('?') {
        return false;
    }
    if split_sentences(text).len() != 1 {
        return false;
    }

    !text
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .any(|word| FIRST_PERSON.contains(&word.to_lowercase().as_str()))
}

/// Rewrite first-person words in an object phrase to third person
pub fn third_person(phrase: &str) -> String {
    phrase
        .split(' ')
        .map(|word| {
            let (core, tail) = split_trailing_punct(word);
            let replaced = match core.to_lowercase().as_str() {
                "my" => "their",
                "mine" => "theirs",
                "me" => "them",
                "myself" => "themselves",
                "i" => "they",
                "i'm" => "they are",
                _ => return word.to_string(),
            };
            format!("{}{}", replaced, tail)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

const NEGATIONS: &[&str] = &[
    "dislikes", "hates", "avoids", "allergic", "not", "never", "no", "doesn't", "isn't",
    "won't", "can't", "cannot",
];

/// Whether two facts agree in polarity.
///
/// "User likes seafood" and "User dislikes seafood" embed close together but
/// must never be collapsed into one fact.
pub fn same_polarity(a: &str, b: &str) -> bool {
    is_negative(a) == is_negative(b)
}

fn is_negative(text: &str) -> bool {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .any(|word| NEGATIONS.contains(&word.to_lowercase().as_str()))
}

fn split_trailing_punct(word: &str) -> (&str, &str) {
    let end = word
        .trim_end_matches(|c: char| c.is_ascii_punctuation() && c != '\'')
        .len();
    word.split_at(end)
}
