//! Deterministic whitespace tokenizer.
//!
//! A token is a maximal run of non-whitespace characters. The same
//! tokenizer counts chunk sizes, provider input limits, and the context
//! budget, so every token number in the system is comparable.

/// Byte span of one token in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn as_str<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// Split `text` into tokens, in order.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;

    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push(Token { start: s, end: i });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            start: s,
            end: text.len(),
        });
    }

    tokens
}

/// Number of tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    let mut count = 0;
    let mut in_token = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            in_token = false;
        } else if !in_token {
            in_token = true;
            count += 1;
        }
    }
    count
}

/// True if a natural breakpoint follows `tokens[index]`: the token closes a
/// sentence, or a blank line separates it from the next token.
pub(crate) fn is_breakpoint(text: &str, tokens: &[Token], index: usize) -> bool {
    let token = tokens[index].as_str(text);
    let trimmed = token.trim_end_matches(['"', '\'', ')', ']', '\u{201d}']);
    if trimmed.ends_with(['.', '!', '?']) {
        return true;
    }
    match tokens.get(index + 1) {
        Some(next) => text[tokens[index].end..next.start].matches('\n').count() >= 2,
        None => true,
    }
}
