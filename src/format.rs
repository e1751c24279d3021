//! Renders the clipboard text from a converted selection, the page
//! attribution and the user's template and rules.

use tracing::warn;

use crate::logging::{format_trace_enabled, record_format_trace, FormatStep, FormatTrace};
use crate::options::FormatOptions;
use crate::safety::{self, PatternError};

const TOKEN_OPEN: &str = "{{";
const TOKEN_CLOSE: &str = "}}";

struct TemplateValues<'a> {
    body: &'a str,
    title: &'a str,
    url: &'a str,
}

impl TemplateValues<'_> {
    fn lookup(&self, token: &str) -> Option<String> {
        match token {
            "text" => Some(self.body.to_string()),
            "quote" => Some(quote_lines(self.body)),
            "title" => Some(self.title.to_string()),
            "url" => Some(self.url.to_string()),
            _ => None,
        }
    }
}

/// Applies the enabled rules to `markdown_body` in order, then fills the
/// template. Title and URL are substituted after the rules ran and never pass
/// through them. Rules that fail the safety gate are skipped; this function
/// always returns a string.
pub fn format(markdown_body: &str, title: &str, url: &str, options: &FormatOptions) -> String {
    format_with_report(markdown_body, title, url, options).0
}

/// Same as [`format`], also returning why each skipped rule was refused, in
/// rule order.
pub fn format_with_report(
    markdown_body: &str,
    title: &str,
    url: &str,
    options: &FormatOptions,
) -> (String, Vec<PatternError>) {
    let mut steps = format_trace_enabled().then(Vec::new);
    let mut rejected = Vec::new();

    let body = apply_rules(markdown_body, options, &mut steps, &mut rejected);
    let output = render_template(
        &options.template,
        &TemplateValues {
            body: &body,
            title,
            url,
        },
    );

    if let Some(steps) = steps {
        record_format_trace(FormatTrace::new(
            markdown_body.to_string(),
            output.clone(),
            steps,
        ));
    }

    (output, rejected)
}

fn apply_rules(
    body: &str,
    options: &FormatOptions,
    steps: &mut Option<Vec<FormatStep>>,
    rejected: &mut Vec<PatternError>,
) -> String {
    let mut current = body.to_string();

    for (index, rule) in options.active_rules() {
        let name = format!("rule {} /{}/", index + 1, safety::preview(&rule.pattern));
        let mut rejection: Option<PatternError> = None;
        let Some(regex) = safety::compile(&rule.pattern, |err| rejection = Some(err)) else {
            let rejection = rejection.unwrap_or(PatternError::Empty);
            let reason = rejection.to_string();
            warn!("Skipping {}: {}", name, reason);
            if let Some(steps) = steps.as_mut() {
                steps.push(FormatStep::skipped(name, reason));
            }
            rejected.push(rejection);
            continue;
        };

        let replacement = translate_replacement(&rule.replacement, regex.captures_len() - 1);
        let matches = regex.find_iter(&current).count();
        if matches == 0 {
            continue;
        }

        let after = regex
            .replace_all(&current, replacement.as_str())
            .into_owned();
        if let Some(steps) = steps.as_mut() {
            steps.push(FormatStep::replaced(name, current.clone(), after.clone(), matches));
        }
        current = after;
    }

    current
}

/// Single left-to-right pass: substituted values are never rescanned, and
/// unrecognized tokens are copied through untouched.
fn render_template(template: &str, values: &TemplateValues<'_>) -> String {
    let mut output = String::with_capacity(template.len() + values.body.len());
    let mut rest = template;

    while let Some(start) = rest.find(TOKEN_OPEN) {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + TOKEN_OPEN.len()..];

        let Some(end) = after_open.find(TOKEN_CLOSE) else {
            output.push_str(&rest[start..]);
            return output;
        };

        match values.lookup(after_open[..end].trim()) {
            Some(value) => {
                output.push_str(&value);
                rest = &after_open[end + TOKEN_CLOSE.len()..];
            }
            None => {
                output.push_str(TOKEN_OPEN);
                rest = after_open;
            }
        }
    }

    output.push_str(rest);
    output
}

fn quote_lines(body: &str) -> String {
    body.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ">".to_string()
            } else {
                format!("> {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Converts the `$&`, `$n`, `$nn`, `$<name>` and `$$` replacement forms to
/// the regex crate's syntax. Anything else after `$` stays literal, as does a
/// group reference past `group_count`.
fn translate_replacement(replacement: &str, group_count: usize) -> String {
    let chars: Vec<char> = replacement.chars().collect();
    let mut output = String::with_capacity(replacement.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch != '$' {
            output.push(ch);
            i += 1;
            continue;
        }

        match chars.get(i + 1).copied() {
            Some('$') => {
                output.push_str("$$");
                i += 2;
            }
            Some('&') => {
                output.push_str("${0}");
                i += 2;
            }
            Some(d) if d.is_ascii_digit() => {
                let first = d.to_digit(10).unwrap_or(0) as usize;
                let second = chars
                    .get(i + 2)
                    .and_then(|c| c.to_digit(10))
                    .map(|n| first * 10 + n as usize);

                match second {
                    Some(group) if (1..=group_count).contains(&group) => {
                        output.push_str(&format!("${{{group}}}"));
                        i += 3;
                    }
                    _ if (1..=group_count).contains(&first) => {
                        output.push_str(&format!("${{{first}}}"));
                        i += 2;
                    }
                    _ => {
                        output.push_str("$$");
                        i += 1;
                    }
                }
            }
            Some('<') => {
                let close = chars[i + 2..].iter().position(|&c| c == '>');
                match close {
                    Some(offset) if offset > 0 => {
                        let name: String = chars[i + 2..i + 2 + offset].iter().collect();
                        output.push_str(&format!("${{{name}}}"));
                        i += offset + 3;
                    }
                    _ => {
                        output.push_str("$$");
                        i += 1;
                    }
                }
            }
            _ => {
                output.push_str("$$");
                i += 1;
            }
        }
    }

    output
}
