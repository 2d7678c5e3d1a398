use crate::config::ChunkingConfig;
use crate::models::{ChunkDraft, RawContent, RawDocument, RawThread};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Separator between a message id and the number of a continuation piece.
pub const PIECE_SEPARATOR: char = '~';

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Id of the `number`-th piece of a split message. Piece 1 keeps the id.
pub fn piece_id(id: &str, number: usize) -> String {
    if number <= 1 {
        id.to_string()
    } else {
        format!("{id}{PIECE_SEPARATOR}{number}")
    }
}

fn sentence_end() -> Option<&'static Regex> {
    static SENTENCE_END: OnceLock<Option<Regex>> = OnceLock::new();
    SENTENCE_END
        .get_or_init(|| Regex::new(r#"[.!?]+["')\]]*\s+"#).ok())
        .as_ref()
}

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let boundaries = sentence_end()
        .map(|pattern| pattern.find_iter(text).collect::<Vec<_>>())
        .unwrap_or_default();
    for boundary in boundaries {
        let sentence = text[start..boundary.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = boundary.end();
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Packs whole words into pieces of at most `max_chars`. A single word longer
/// than the bound is kept intact.
fn split_at_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && char_len(&current) + 1 + char_len(word) > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Splits text into pieces bounded by `max_chars`, cutting at sentence
/// boundaries and falling back to word boundaries for overlong sentences.
pub fn split_bounded(text: &str, max_chars: usize) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }
    if char_len(&normalized) <= max_chars {
        return vec![normalized];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(&normalized) {
        if char_len(&sentence) > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            pieces.extend(split_at_words(&sentence, max_chars));
            continue;
        }
        if !current.is_empty() && char_len(&current) + 1 + char_len(&sentence) > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

pub fn chunk_by_paragraph(text: &str, config: ChunkingConfig) -> Vec<String> {
    let paragraphs = text
        .split("\n\n")
        .map(normalize_whitespace)
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>();

    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        if char_len(&paragraph) > config.max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.extend(split_bounded(&paragraph, config.max_chars));
            continue;
        }

        if current.is_empty() {
            current.push_str(&paragraph);
        } else if char_len(&current) + char_len(&paragraph) + 2 <= config.max_chars {
            current.push_str("\n\n");
            current.push_str(&paragraph);
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(&paragraph);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// A resolved thread-context message used to rebuild a reply's text.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub id: String,
    pub author: Option<String>,
    pub body: String,
}

fn message_line(author: Option<&str>, body: &str) -> String {
    match author {
        Some(author) if !author.trim().is_empty() => format!("{}: {}", author.trim(), body),
        _ => body.to_string(),
    }
}

fn truncate_at_word(text: &str, max_chars: usize) -> String {
    split_at_words(text, max_chars)
        .into_iter()
        .next()
        .unwrap_or_default()
}

/// Builds a reply's chunk text: the root, then as many of the most recent
/// prior replies as fit in `context_chars`, then the reply itself.
pub fn assemble_thread_text(
    context: &[ContextEntry],
    author: Option<&str>,
    body: &str,
    context_chars: usize,
) -> String {
    let own = message_line(author, body);
    let Some((root, replies)) = context.split_first() else {
        return own;
    };

    let mut root_line = message_line(root.author.as_deref(), &root.body);
    if char_len(&root_line) > context_chars {
        root_line = truncate_at_word(&root_line, context_chars);
    }
    let mut used = char_len(&root_line);

    let mut recent = Vec::new();
    for reply in replies.iter().rev() {
        let line = message_line(reply.author.as_deref(), &reply.body);
        let cost = char_len(&line) + 1;
        if used + cost > context_chars {
            break;
        }
        used += cost;
        recent.push(line);
    }
    recent.reverse();

    let mut lines = Vec::with_capacity(recent.len() + 2);
    if !root_line.is_empty() {
        lines.push(root_line);
    }
    lines.extend(recent);
    lines.push(own);
    lines.join("\n")
}

/// Drafts for one message, split into pieces when its body is oversized.
pub fn draft_message(
    template: &ChunkDraft,
    context: &[ContextEntry],
    body: &str,
    config: ChunkingConfig,
) -> Vec<ChunkDraft> {
    split_bounded(body, config.max_chars)
        .into_iter()
        .enumerate()
        .map(|(index, piece)| ChunkDraft {
            id: piece_id(&template.id, index + 1),
            text: assemble_thread_text(
                context,
                template.author.as_deref(),
                &piece,
                config.context_chars,
            ),
            body: piece,
            ..template.clone()
        })
        .collect()
}

pub fn chunk_thread(thread: &RawThread, config: ChunkingConfig) -> Vec<ChunkDraft> {
    let mut drafts = Vec::new();
    let mut context: Vec<ContextEntry> = Vec::new();

    for message in &thread.messages {
        let id = message.id.trim();
        let body = normalize_whitespace(&message.text);
        if id.is_empty() || body.is_empty() {
            debug!(message_id = %message.id, source = %thread.source, "skipping empty message");
            continue;
        }

        let template = ChunkDraft {
            id: id.to_string(),
            text: String::new(),
            body: String::new(),
            source: thread.source.clone(),
            identifier: Some(id.to_string()),
            author: message.author.clone(),
            public: thread.public,
            source_of_truth: thread.source_of_truth,
            thread_context: context.iter().map(|entry| entry.id.clone()).collect(),
            gated: true,
        };
        drafts.extend(draft_message(&template, &context, &body, config));

        context.push(ContextEntry {
            id: id.to_string(),
            author: message.author.clone(),
            body,
        });
    }

    drafts
}

pub fn chunk_document(document: &RawDocument, config: ChunkingConfig) -> Vec<ChunkDraft> {
    let id = document.id.trim();
    if id.is_empty() {
        debug!(source = %document.source, "skipping document without id");
        return Vec::new();
    }

    document
        .sections
        .iter()
        .flat_map(|section| chunk_by_paragraph(section, config))
        .enumerate()
        .map(|(index, text)| ChunkDraft {
            id: format!("{id}#{index}"),
            body: text.clone(),
            text,
            source: document.source.clone(),
            identifier: Some(
                document
                    .filename
                    .clone()
                    .unwrap_or_else(|| id.to_string()),
            ),
            author: None,
            public: document.public,
            source_of_truth: document.source_of_truth,
            thread_context: Vec::new(),
            gated: false,
        })
        .collect()
}

pub fn chunk_content(content: &RawContent, config: ChunkingConfig) -> Vec<ChunkDraft> {
    match content {
        RawContent::Thread(thread) => chunk_thread(thread, config),
        RawContent::Document(document) => chunk_document(document, config),
    }
}
