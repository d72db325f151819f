//! Typed parser for intent tags embedded in assistant-authored text.
//!
//! Tags look like `[TASK: <desc> | OUTPUT: <file> | PROMPT: <prompt>]`.
//! The parser is stateless: calling it twice on the same text yields the
//! same result, and multiple tags in one message are all returned in order.
//! A malformed tag fails the whole parse with a validation error so the
//! caller can leave the original text intact.

use std::ops::Range;

use crate::error::RelayError;

/// One recognized intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentTag {
    Remember(String),
    Goal {
        text: String,
        deadline: Option<String>,
    },
    Done(String),
    Todo(String),
    TodoDone(String),
    Task {
        description: String,
        output: Option<String>,
        prompt: String,
    },
    CodeTask {
        cwd: String,
        prompt: String,
    },
}

/// A parsed tag plus the byte range of its literal text, for replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIntent {
    pub tag: IntentTag,
    pub span: Range<usize>,
}

/// Tag openers, longest-prefix first so `[TODO_DONE:` wins over `[TODO`.
const OPENERS: &[&str] = &[
    "[CODE_TASK:",
    "[TODO_DONE:",
    "[REMEMBER:",
    "[GOAL:",
    "[TASK:",
    "[TODO:",
    "[DONE:",
];

/// Scan `text` for intent tags.
///
/// Returns every tag in document order, or a [`RelayError::Validation`] if
/// any tag body does not match its grammar.
pub fn parse_intents(text: &str) -> Result<Vec<ParsedIntent>, RelayError> {
    let mut intents = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find('[') {
        let start = cursor + rel;
        let rest = &text[start..];

        let Some(opener) = OPENERS.iter().find(|o| rest.starts_with(**o)) else {
            cursor = start + 1;
            continue;
        };

        let Some(close_rel) = rest.find(']') else {
            return Err(RelayError::Validation(format!(
                "unterminated intent tag at byte {start}: missing ']'"
            )));
        };

        let body = rest[opener.len()..close_rel].trim();
        let tag = parse_body(opener, body)?;
        intents.push(ParsedIntent {
            tag,
            span: start..start + close_rel + 1,
        });
        cursor = start + close_rel + 1;
    }

    Ok(intents)
}

fn parse_body(opener: &str, body: &str) -> Result<IntentTag, RelayError> {
    match opener {
        "[REMEMBER:" => Ok(IntentTag::Remember(body.to_owned())),
        "[DONE:" => Ok(IntentTag::Done(body.to_owned())),
        "[TODO:" => Ok(IntentTag::Todo(body.to_owned())),
        "[TODO_DONE:" => Ok(IntentTag::TodoDone(body.to_owned())),
        "[GOAL:" => {
            let (text, fields) = split_fields(body);
            if text.is_empty() {
                return Err(RelayError::Validation("GOAL tag has empty text".to_owned()));
            }
            let deadline = field(&fields, "DEADLINE").map(str::to_owned);
            Ok(IntentTag::Goal {
                text: text.to_owned(),
                deadline,
            })
        }
        "[TASK:" => {
            let (description, fields) = split_fields(body);
            if description.is_empty() {
                return Err(RelayError::Validation(
                    "TASK tag has empty description".to_owned(),
                ));
            }
            let prompt = field(&fields, "PROMPT").ok_or_else(|| {
                RelayError::Validation(format!("TASK tag {description:?} is missing PROMPT"))
            })?;
            let output = field(&fields, "OUTPUT").map(str::to_owned);
            Ok(IntentTag::Task {
                description: description.to_owned(),
                output,
                prompt: prompt.to_owned(),
            })
        }
        "[CODE_TASK:" => {
            let (head, fields) = split_fields(body);
            let cwd = head
                .strip_prefix("cwd=")
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    RelayError::Validation("CODE_TASK tag must start with cwd=<dir>".to_owned())
                })?;
            let prompt = field(&fields, "PROMPT").ok_or_else(|| {
                RelayError::Validation("CODE_TASK tag is missing PROMPT".to_owned())
            })?;
            Ok(IntentTag::CodeTask {
                cwd: cwd.to_owned(),
                prompt: prompt.to_owned(),
            })
        }
        other => Err(RelayError::Validation(format!(
            "unknown intent opener {other:?}"
        ))),
    }
}

/// Split a tag body into its head text and `NAME: value` fields on `|`.
fn split_fields(body: &str) -> (&str, Vec<(&str, &str)>) {
    let mut parts = body.split('|').map(str::trim);
    let head = parts.next().unwrap_or("");
    let fields = parts
        .filter_map(|part| {
            let (name, value) = part.split_once(':')?;
            Some((name.trim(), value.trim()))
        })
        .collect();
    (head, fields)
}

fn field<'a>(fields: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}
