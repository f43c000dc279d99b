//! Splits long documents into bounded pieces for embedding.
//!
//! Paragraph boundaries are preferred, then sentence boundaries, then word
//! boundaries; a hard character cut is the last resort for a single
//! unbroken run longer than the limit. Delimiters stay attached to the
//! preceding piece, so concatenating the chunks reproduces the input.

fn char_count(text: &str) -> usize {
    text.chars().count()
}

fn split_keep_delimiter(text: &str, delimiter: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;

    while let Some(relative_pos) = text[start..].find(delimiter) {
        let end = start + relative_pos + delimiter.len();
        parts.push(text[start..end].to_string());
        start = end;
    }

    if start < text.len() {
        parts.push(text[start..].to_string());
    }

    parts
}

fn is_cjk_terminator(ch: char) -> bool {
    matches!(ch, '。' | '！' | '？' | '…')
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        if is_cjk_terminator(ch) {
            let end = index + ch.len_utf8();
            parts.push(text[start..end].to_string());
            start = end;
        } else if matches!(ch, '.' | '!' | '?')
            && let Some((next_index, next_char)) = chars.peek().copied()
            && next_char.is_whitespace()
        {
            let end = next_index + next_char.len_utf8();
            chars.next();
            parts.push(text[start..end].to_string());
            start = end;
        }
    }

    if start < text.len() {
        parts.push(text[start..].to_string());
    }

    parts
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for ch in text.chars() {
        if current_len == max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        current.push(ch);
        current_len += 1;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[derive(Clone, Copy)]
enum SplitLevel {
    Paragraph,
    Sentence,
    Word,
    Hard,
}

impl SplitLevel {
    fn next(self) -> Self {
        match self {
            Self::Paragraph => Self::Sentence,
            Self::Sentence => Self::Word,
            Self::Word | Self::Hard => Self::Hard,
        }
    }

    fn split(self, text: &str) -> Vec<String> {
        match self {
            Self::Paragraph => split_keep_delimiter(text, "\n\n"),
            Self::Sentence => split_sentences(text),
            Self::Word => split_keep_delimiter(text, " "),
            Self::Hard => hard_split(text, 1),
        }
    }
}

fn chunk_segment(text: &str, max_chars: usize, level: SplitLevel, out: &mut Vec<String>) {
    if text.is_empty() {
        return;
    }

    if char_count(text) <= max_chars {
        out.push(text.to_string());
        return;
    }

    if matches!(level, SplitLevel::Hard) {
        out.extend(hard_split(text, max_chars));
        return;
    }

    let parts = level.split(text);
    if parts.len() <= 1 {
        chunk_segment(text, max_chars, level.next(), out);
        return;
    }

    let mut current = String::new();

    for part in parts {
        if char_count(&part) > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            chunk_segment(&part, max_chars, level.next(), out);
            continue;
        }

        if current.is_empty() {
            current = part;
            continue;
        }

        if char_count(&current) + char_count(&part) <= max_chars {
            current.push_str(&part);
        } else {
            out.push(std::mem::take(&mut current));
            current = part;
        }
    }

    if !current.is_empty() {
        out.push(current);
    }
}

/// Split `content` into pieces of at most `max_chars` characters.
pub fn chunk_text(content: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    chunk_segment(content, max_chars.max(1), SplitLevel::Paragraph, &mut out);
    out
}
