//! Storage path templates
//!
//! A template mixes literal text with `{...}` tokens:
//!
//! - `{now,date,yyyy/MM/dd}` formats the store time
//! - `{StudyInstanceUID}` / `{0020000D}`, `{SeriesInstanceUID}` / `{0020000E}`
//!   and `{SOPInstanceUID}` / `{00080018}` insert a UID
//! - appending `,hash` to a UID token inserts an 8 hex digit hash instead,
//!   which keeps directory names short and evenly spread

use crate::error::{ArcError, ArcResult};
use chrono::{DateTime, Utc};

/// Values available to a template
#[derive(Debug, Clone)]
pub struct PathContext<'a> {
    pub study_iuid: &'a str,
    pub series_iuid: &'a str,
    pub sop_iuid: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Uid {
    Study,
    Series,
    Sop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// chrono format string converted from the date pattern
    Date(String),
    Uid { uid: Uid, hash: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFormat {
    segments: Vec<Segment>,
}

/// 32-bit string hash (`h = 31 * h + c` over UTF-16 code units)
fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

fn date_pattern(pattern: &str) -> String {
    let mut out = String::new();
    let mut rest = pattern;
    while !rest.is_empty() {
        let (token, replacement) = [
            ("yyyy", "%Y"),
            ("MM", "%m"),
            ("dd", "%d"),
            ("HH", "%H"),
            ("mm", "%M"),
            ("ss", "%S"),
        ]
        .into_iter()
        .find(|(token, _)| rest.starts_with(token))
        .unwrap_or(("", ""));

        if token.is_empty() {
            let c = rest.chars().next().unwrap_or_default();
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
            rest = &rest[c.len_utf8()..];
        } else {
            out.push_str(replacement);
            rest = &rest[token.len()..];
        }
    }
    out
}

fn parse_token(token: &str) -> ArcResult<Segment> {
    let parts: Vec<&str> = token.split(',').map(str::trim).collect();
    match parts.as_slice() {
        ["now", "date", pattern] => Ok(Segment::Date(date_pattern(pattern))),
        [name, rest @ ..] => {
            let uid = match *name {
                "StudyInstanceUID" | "0020000D" => Uid::Study,
                "SeriesInstanceUID" | "0020000E" => Uid::Series,
                "SOPInstanceUID" | "00080018" => Uid::Sop,
                _ => {
                    return Err(ArcError::Config(format!(
                        "Unknown path format token: {{{}}}",
                        token
                    )))
                }
            };
            match rest {
                [] => Ok(Segment::Uid { uid, hash: false }),
                ["hash"] => Ok(Segment::Uid { uid, hash: true }),
                _ => Err(ArcError::Config(format!(
                    "Unknown path format token: {{{}}}",
                    token
                ))),
            }
        }
        [] => Err(ArcError::Config("Empty path format token".to_string())),
    }
}

impl PathFormat {
    pub fn parse(template: &str) -> ArcResult<Self> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..].find('}').ok_or_else(|| {
                ArcError::Config(format!("Unbalanced path format: {}", template))
            })? + open;
            segments.push(parse_token(&rest[open + 1..close])?);
            rest = &rest[close + 1..];
        }
        if rest.contains('}') {
            return Err(ArcError::Config(format!(
                "Unbalanced path format: {}",
                template
            )));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn format(&self, ctx: &PathContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Date(fmt) => out.push_str(&ctx.now.format(fmt).to_string()),
                Segment::Uid { uid, hash } => {
                    let value = match uid {
                        Uid::Study => ctx.study_iuid,
                        Uid::Series => ctx.series_iuid,
                        Uid::Sop => ctx.sop_iuid,
                    };
                    if *hash {
                        out.push_str(&format!("{:08X}", string_hash(value) as u32));
                    } else {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}
