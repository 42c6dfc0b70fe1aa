// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub content: String,
}

/// Collects every markdown-fenced block in `text`, keeping the fence tag when
/// one was given.
pub fn fenced_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if let Some(tag) = trimmed.strip_prefix("```") {
            let language = (!tag.trim().is_empty()).then(|| tag.trim().to_string());
            let mut content = String::new();
            for body_line in lines.by_ref() {
                if body_line.trim().starts_with("```") {
                    break;
                }
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(body_line);
            }
            blocks.push(CodeBlock { language, content });
        }
    }
    blocks
}

/// Strips a single fenced code block from a model reply. A language-tagged
/// fence wins over a bare one; text without fences passes through unchanged.
pub fn strip_code_fence(text: &str) -> String {
    let blocks = fenced_blocks(text);
    if blocks.is_empty() {
        return text.to_string();
    }
    let chosen = blocks
        .iter()
        .find(|b| b.language.is_some())
        .or_else(|| blocks.first());
    match chosen {
        Some(block) => block.content.trim().to_string(),
        None => text.to_string(),
    }
}

/// Best-effort JSON recovery from free-form model output: whole-text parse,
/// then fenced blocks, then the first balanced object or array substring.
pub fn extract_json_from_text(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    for block in fenced_blocks(text) {
        if matches!(block.language.as_deref(), Some("json") | None) {
            if let Ok(value) = serde_json::from_str::<Value>(&block.content) {
                debug!("Recovered JSON from fenced block");
                return Some(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(candidate) = balanced_slice(text, open, close) {
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                debug!("Recovered JSON from balanced substring");
                return Some(value);
            }
        }
    }
    None
}

fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            c if c == open => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            c if c == close && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
