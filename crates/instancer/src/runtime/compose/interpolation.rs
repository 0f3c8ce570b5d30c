// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;

use crate::runtime::DriverError;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn lookup<'a>(vars: &'a BTreeMap<String, String>, name: &str) -> &'a str {
    match vars.get(name) {
        Some(value) => value,
        None => {
            tracing::warn!("Variable {} is not set, substituting an empty string", name);
            ""
        }
    }
}

/// Resolves the inside of a `${...}` reference.
fn resolve(expr: &str, vars: &BTreeMap<String, String>) -> Result<String, DriverError> {
    let split = expr.find(|c: char| !is_name_char(c)).unwrap_or(expr.len());
    let (name, modifier) = expr.split_at(split);
    if name.is_empty() {
        return Err(DriverError::SpecParseError(format!(
            "Invalid variable reference: ${{{}}}",
            expr
        )));
    }
    let value = vars.get(name);
    let set_and_non_empty = value.is_some_and(|value| !value.is_empty());

    if modifier.is_empty() {
        return Ok(lookup(vars, name).to_string());
    }
    if let Some(default) = modifier.strip_prefix(":-") {
        return Ok(match value {
            Some(value) if set_and_non_empty => value.clone(),
            _ => default.to_string(),
        });
    }
    if let Some(default) = modifier.strip_prefix('-') {
        return Ok(value.cloned().unwrap_or_else(|| default.to_string()));
    }
    let required = match modifier.strip_prefix(":?") {
        Some(message) => Some((message, set_and_non_empty)),
        None => modifier
            .strip_prefix('?')
            .map(|message| (message, value.is_some())),
    };
    match required {
        Some((_, true)) => Ok(lookup(vars, name).to_string()),
        Some((message, false)) => Err(DriverError::SpecParseError(format!(
            "Required variable {} is missing a value: {}",
            name, message
        ))),
        None => Err(DriverError::SpecParseError(format!(
            "Invalid variable reference: ${{{}}}",
            expr
        ))),
    }
}

/// Substitutes compose-style variable references: `$NAME`, `${NAME}`,
/// `${NAME:-default}`, `${NAME-default}`, `${NAME:?error}` and
/// `${NAME?error}`. `$$` is a literal `$`. Unset variables become empty.
pub fn interpolate(document: &str, vars: &BTreeMap<String, String>) -> Result<String, DriverError> {
    let mut out = String::with_capacity(document.len());
    let mut chars = document.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut expr = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => expr.push(c),
                        None => {
                            return Err(DriverError::SpecParseError(format!(
                                "Unterminated variable reference: ${{{}",
                                expr
                            )));
                        }
                    }
                }
                out.push_str(&resolve(&expr, vars)?);
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                out.push_str(lookup(vars, &name));
            }
            _ => out.push('$'),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("CONTAINER_NAME".to_string(), "chall_4_1".to_string()),
            ("INSTANCE_PORT".to_string(), "10007".to_string()),
            ("EMPTY".to_string(), String::new()),
        ])
    }

    #[test]
    fn test_braced_and_bare_references() {
        let rendered = interpolate(
            "container_name: ${CONTAINER_NAME}\nports:\n  - \"${INSTANCE_PORT}:1337\"\ncmd: echo $INSTANCE_PORT/x",
            &vars(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "container_name: chall_4_1\nports:\n  - \"10007:1337\"\ncmd: echo 10007/x"
        );
    }

    #[test]
    fn test_defaults_and_escapes() {
        let vars = vars();
        assert_eq!(interpolate("${MISSING:-a}", &vars).unwrap(), "a");
        assert_eq!(interpolate("${EMPTY:-a}", &vars).unwrap(), "a");
        assert_eq!(interpolate("${EMPTY-a}", &vars).unwrap(), "");
        assert_eq!(interpolate("${MISSING-a}", &vars).unwrap(), "a");
        assert_eq!(interpolate("${MISSING}", &vars).unwrap(), "");
        assert_eq!(interpolate("cost: $$5 $ 1", &vars).unwrap(), "cost: $5 $ 1");
    }

    #[test]
    fn test_required_and_malformed_references() {
        let vars = vars();
        assert_eq!(interpolate("${INSTANCE_PORT:?no port}", &vars).unwrap(), "10007");
        assert!(matches!(
            interpolate("${MISSING:?no port}", &vars),
            Err(DriverError::SpecParseError(msg)) if msg.contains("no port")
        ));
        assert!(interpolate("${EMPTY?x}", &vars).is_ok());
        assert!(interpolate("${EMPTY:?x}", &vars).is_err());
        assert!(interpolate("${INSTANCE_PORT", &vars).is_err());
        assert!(interpolate("${}", &vars).is_err());
        assert!(interpolate("${A+b}", &vars).is_err());
    }
}
