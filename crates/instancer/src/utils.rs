// SPDX-FileCopyrightText: 2026 Aaron Dewes
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;

/// Splits a shell-like command line into arguments.
///
/// Single and double quotes group whitespace into one argument and are
/// dropped; a quote of the other kind inside a quoted argument is kept
/// literally. A backslash makes the following character literal.
pub fn split_with_quotes(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match (c, quote) {
            ('\\', _) => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(open)) if c == open => quote = None,
            (c, None) if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// `KEY=VALUE` pairs as expected by the container engine.
pub fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}
