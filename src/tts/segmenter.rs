//! Splits a growing response into speakable sentences.
//!
//! The gateway delivers each response as a series of full-text snapshots.
//! [`SentenceSegmenter`] remembers how much of the response it has already
//! handed out and, on every new snapshot, returns only the sentences that
//! became complete since the last call. Fenced code blocks are skipped
//! entirely; everything else goes through [`speakable_text`] before it is
//! returned.

use tracing::debug;

/// Unterminated text longer than this is split at the last clause mark.
const CLAUSE_SPLIT_LEN: usize = 160;

const FENCE: &str = "```";

/// Incremental sentence splitter over replacing snapshots.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    /// Byte offset into the snapshot up to which text has been emitted.
    consumed: usize,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all progress; the next snapshot starts a new response.
    pub fn reset(&mut self) {
        self.consumed = 0;
    }

    /// Bytes of the current response already emitted.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Feed the full text accumulated so far and collect newly complete sentences.
    pub fn push_snapshot(&mut self, snapshot: &str) -> Vec<String> {
        self.advance(snapshot, false)
    }

    /// Feed the final text and flush whatever remains as the last sentence.
    pub fn finish(&mut self, snapshot: &str) -> Vec<String> {
        let out = self.advance(snapshot, true);
        self.consumed = snapshot.len();
        out
    }

    fn advance(&mut self, snapshot: &str, at_end: bool) -> Vec<String> {
        if self.consumed > snapshot.len() || !snapshot.is_char_boundary(self.consumed) {
            // Revised snapshot shorter than what was already spoken; nothing
            // new to say until it grows past that point again.
            debug!(
                consumed = self.consumed,
                len = snapshot.len(),
                "snapshot shrank below emitted offset"
            );
            return Vec::new();
        }

        let mut out = Vec::new();
        loop {
            let pending = &snapshot[self.consumed..];
            if pending.is_empty() {
                break;
            }

            if let Some(fence) = pending.find(FENCE) {
                if fence > 0 {
                    let before = &pending[..fence];
                    self.split_complete(before, true, &mut out);
                    continue;
                }
                let after_open = FENCE.len();
                match pending[after_open..].find(FENCE) {
                    Some(close) => {
                        let mut end = after_open + close + FENCE.len();
                        // Drop the rest of the closing fence line.
                        end += pending[end..].find('\n').map_or(pending.len() - end, |n| n + 1);
                        self.consumed += end;
                        continue;
                    }
                    None => {
                        if at_end {
                            self.consumed = snapshot.len();
                        }
                        break;
                    }
                }
            }

            let before = self.consumed;
            self.split_complete(pending, at_end, &mut out);
            if self.consumed == before {
                break;
            }
        }
        out
    }

    /// Emit complete sentences from `pending`, advancing `consumed`.
    /// With `flush_tail` the unterminated remainder is emitted too.
    fn split_complete(&mut self, pending: &str, flush_tail: bool, out: &mut Vec<String>) {
        let mut rest = pending;
        while let Some(pos) = find_boundary(rest) {
            let (unit, tail) = rest.split_at(pos);
            push_unit(unit, out);
            self.consumed += unit.len();
            rest = tail;
        }
        if flush_tail && !rest.is_empty() {
            push_unit(rest, out);
            self.consumed += rest.len();
        }
    }
}

fn push_unit(raw: &str, out: &mut Vec<String>) {
    let text = speakable_text(raw);
    if !text.is_empty() {
        out.push(text);
    }
}

/// Byte index just past the next boundary in `text`, or `None`.
///
/// Sentence punctuation (`. ! ?`) counts only when followed by whitespace,
/// so a trailing `3.` does not split before `3.5` arrives. A newline always
/// ends a unit. Long unterminated text falls back to the last clause mark.
fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            return Some(i + 1);
        }
        if matches!(c, '.' | '!' | '?') {
            // Absorb runs like "?!" or "..." and closing quotes.
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if matches!(next, '.' | '!' | '?' | '"' | '\'' | ')' | '\u{201D}') {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            if text[end..].starts_with(char::is_whitespace) {
                return Some(end);
            }
        }
    }

    if text.len() < CLAUSE_SPLIT_LEN {
        return None;
    }
    let mut last_clause = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}') {
            let end = i + c.len_utf8();
            if text[end..].starts_with(' ') {
                last_clause = Some(end);
            }
        }
    }
    last_clause
}

/// Strip markdown that should not be read aloud and collapse whitespace.
///
/// Removes heading markers, list bullets, emphasis markers and inline-code
/// backticks, and reduces `[label](target)` links to their label.
pub fn speakable_text(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for line in raw.lines() {
        let mut line = line.trim_start();
        line = line.trim_start_matches('#').trim_start();
        for bullet in ["- ", "* ", "+ ", "> "] {
            if let Some(stripped) = line.strip_prefix(bullet) {
                line = stripped;
                break;
            }
        }
        if !cleaned.is_empty() {
            cleaned.push(' ');
        }
        strip_inline(line, &mut cleaned);
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_inline(line: &str, out: &mut String) {
    let mut rest = line;
    while let Some(c) = rest.chars().next() {
        match c {
            '*' | '`' => {
                rest = &rest[1..];
            }
            '_' if rest.starts_with("__") => {
                rest = &rest[2..];
            }
            '[' => {
                if let Some((label, after)) = split_link(rest) {
                    out.push_str(label);
                    rest = after;
                } else {
                    out.push('[');
                    rest = &rest[1..];
                }
            }
            _ => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

/// Parse `[label](target)` at the start of `text`.
fn split_link(text: &str) -> Option<(&str, &str)> {
    let close = text.find("](")?;
    let label = &text[1..close];
    if label.contains('[') {
        return None;
    }
    let target_start = close + 2;
    let target_len = text[target_start..].find(')')?;
    Some((label, &text[target_start + target_len + 1..]))
}
