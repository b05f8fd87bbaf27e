//! Person names
//!
//! Names use the `Family^Given^Middle^Prefix^Suffix` component form with up
//! to three `=`-separated representations: alphabetic, ideographic and
//! phonetic. Absent or empty names, and the literal `*`, are wildcards.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
    pub family: Option<String>,
    pub given: Option<String>,
    pub middle: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub ideographic: Option<String>,
    pub phonetic: Option<String>,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty() && s != "*").then(|| s.to_string())
}

impl PersonName {
    pub fn parse(s: &str) -> Self {
        let mut groups = s.splitn(3, '=');
        let alphabetic = groups.next().unwrap_or("");
        let ideographic = groups.next().and_then(non_empty);
        let phonetic = groups.next().and_then(non_empty);

        let mut parts = alphabetic.splitn(5, '^').map(non_empty);
        Self {
            family: parts.next().flatten(),
            given: parts.next().flatten(),
            middle: parts.next().flatten(),
            prefix: parts.next().flatten(),
            suffix: parts.next().flatten(),
            ideographic,
            phonetic,
        }
    }

    /// True if no representation carries any value
    pub fn is_wildcard(&self) -> bool {
        self.alphabetic().is_none() && self.ideographic.is_none() && self.phonetic.is_none()
    }

    /// Alphabetic representation with trailing empty components trimmed
    pub fn alphabetic(&self) -> Option<String> {
        let parts = [
            self.family.as_deref().unwrap_or(""),
            self.given.as_deref().unwrap_or(""),
            self.middle.as_deref().unwrap_or(""),
            self.prefix.as_deref().unwrap_or(""),
            self.suffix.as_deref().unwrap_or(""),
        ];
        let used = parts.iter().rposition(|p| !p.is_empty())? + 1;
        Some(parts[..used].join("^"))
    }
}
