//! `FROM` and `COPY --from` extraction from Dockerfiles.

use std::{
    collections::{HashMap, HashSet},
    sync::LazyLock,
};

use regex::{Captures, Regex};

use super::{Occurrence, unquote};

/// `$NAME`, `${NAME}`, `${NAME:-default}` and `${NAME:+alternate}`.
static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)(?::([-+])([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
    )
    .unwrap()
});

pub(super) fn extract(contents: &str) -> Vec<Occurrence> {
    // Only `ARG`s declared before the first `FROM` are in scope for `FROM`.
    let mut args: HashMap<String, String> = HashMap::new();
    let mut stages: HashSet<String> = HashSet::new();
    let mut seen_from = false;
    let mut occurrences = vec![];

    for (line, instruction) in logical_lines(contents) {
        let mut tokens = instruction.split_whitespace();
        let Some(keyword) = tokens.next() else {
            continue;
        };

        match keyword.to_ascii_uppercase().as_str() {
            "ARG" if !seen_from => {
                for declaration in tokens {
                    match declaration.split_once('=') {
                        Some((name, value)) => {
                            // Defaults may refer to earlier arguments.
                            let value = unquote(value);
                            let value = substitute(value, &args).unwrap_or_else(|| value.into());
                            args.insert(name.into(), value);
                        }
                        None => {
                            args.remove(declaration);
                        }
                    }
                }
            }
            "FROM" => {
                seen_from = true;

                let mut operands = tokens.filter(|token| !token.starts_with("--"));
                let Some(image) = operands.next() else {
                    continue;
                };

                let alias = match (operands.next(), operands.next()) {
                    (Some(keyword), Some(alias)) if keyword.eq_ignore_ascii_case("as") => {
                        Some(alias.to_ascii_lowercase())
                    }
                    _ => None,
                };

                let resolved = substitute(image, &args);
                if is_stage(image, resolved.as_deref(), &stages) {
                    tracing::debug!("FROM {image} refers to an earlier stage");
                } else {
                    occurrences.push(Occurrence {
                        raw: image.into(),
                        resolved,
                        line,
                    });
                }

                if let Some(alias) = alias {
                    stages.insert(alias);
                }
            }
            "COPY" | "ADD" => {
                for source in tokens.filter_map(|token| token.strip_prefix("--from=")) {
                    let source = unquote(source);
                    let resolved = substitute(source, &args);

                    if source.parse::<usize>().is_ok()
                        || is_stage(source, resolved.as_deref(), &stages)
                    {
                        continue;
                    }

                    occurrences.push(Occurrence {
                        raw: source.into(),
                        resolved,
                        line,
                    });
                }
            }
            _ => {}
        }
    }

    occurrences
}

fn is_stage(raw: &str, resolved: Option<&str>, stages: &HashSet<String>) -> bool {
    stages.contains(&raw.to_ascii_lowercase())
        || resolved.is_some_and(|resolved| stages.contains(&resolved.to_ascii_lowercase()))
}

/// Joins backslash-continued lines and drops comments, yielding each
/// instruction with the 1-based line it starts on.
fn logical_lines(contents: &str) -> Vec<(usize, String)> {
    let mut lines = vec![];
    let mut current: Option<(usize, String)> = None;

    for (idx, line) in contents.lines().enumerate() {
        let trimmed = line.trim();

        // Comments may appear between continuation lines, too.
        if trimmed.starts_with('#') || (current.is_none() && trimmed.is_empty()) {
            continue;
        }

        let (start, mut buf) = current.take().unwrap_or((idx + 1, String::new()));
        match trimmed.strip_suffix('\\') {
            Some(head) => {
                buf.push_str(head);
                buf.push(' ');
                current = Some((start, buf));
            }
            None => {
                buf.push_str(trimmed);
                lines.push((start, buf));
            }
        }
    }

    if let Some(last) = current {
        lines.push(last);
    }

    lines
}

/// Substitutes build arguments into `text`, returning `None` if any
/// variable has no value to substitute.
fn substitute(text: &str, args: &HashMap<String, String>) -> Option<String> {
    if !text.contains('$') {
        return Some(text.into());
    }

    let mut unresolved = false;
    let substituted = VARIABLE.replace_all(text, |caps: &Captures| {
        let name = caps.get(1).or_else(|| caps.get(4)).map_or("", |m| m.as_str());
        let value = args.get(name).filter(|value| !value.is_empty());
        let word = caps.get(3).map_or("", |m| m.as_str());

        match (caps.get(2).map(|m| m.as_str()), value) {
            (Some("-"), Some(value)) => value.clone(),
            (Some("-"), None) => word.into(),
            (Some(_), Some(_)) => word.into(),
            (Some(_), None) => String::new(),
            (None, Some(value)) => value.clone(),
            (None, None) => {
                unresolved = true;
                String::new()
            }
        }
    });

    (!unresolved && !substituted.contains('$')).then(|| substituted.into_owned())
}
