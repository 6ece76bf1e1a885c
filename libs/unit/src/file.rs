//! Unit file parsing, normalisation and content hashing.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::UnitFileError;

/// Length of the abbreviated hash shown in listings.
pub const SHORT_HASH_LENGTH: usize = 7;

/// A single `Key=value` entry of a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOption {
    pub section: String,
    pub name: String,
    pub value: String,
}

/// A parsed unit file.
///
/// Options keep their file order; repeated keys are kept as repeated
/// entries (systemd semantics for list-valued options).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFile {
    options: Vec<UnitOption>,
}

impl UnitFile {
    /// Parse a unit file from raw bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, UnitFileError> {
        let text = std::str::from_utf8(raw).map_err(|_| UnitFileError::NotUtf8)?;
        Self::parse(text)
    }

    /// Parse a unit file.
    ///
    /// Lines ending in a backslash continue on the next line. Lines
    /// starting with `#` or `;` are comments. Lines outside any section are
    /// ignored. A value wrapped in double quotes is split into several
    /// values at unquoted spaces: `MachineMetadata="a=b" "c=d"`.
    pub fn parse(content: &str) -> Result<Self, UnitFileError> {
        let mut options = Vec::new();
        let mut section: Option<String> = None;
        let mut pending = String::new();
        let mut pending_start = 0;

        for (idx, raw_line) in content.lines().enumerate() {
            let line_num = idx + 1;

            if let Some(stripped) = raw_line.strip_suffix('\\') {
                if pending.is_empty() {
                    pending_start = line_num;
                }
                pending.push_str(stripped);
                pending.push(' ');
                continue;
            }

            let (line, line_num) = if pending.is_empty() {
                if raw_line.starts_with('#') || raw_line.starts_with(';') {
                    continue;
                }
                (raw_line.to_string(), line_num)
            } else {
                let joined = std::mem::take(&mut pending) + raw_line;
                (joined, pending_start)
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim();
                if name.is_empty() {
                    return Err(UnitFileError::Parse {
                        line: line_num,
                        reason: "empty section name".to_string(),
                    });
                }
                section = Some(name.to_string());
                continue;
            }

            let Some(current) = section.as_ref() else {
                continue;
            };

            let Some((key, value)) = line.split_once('=') else {
                return Err(UnitFileError::Parse {
                    line: line_num,
                    reason: "missing '='".to_string(),
                });
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(UnitFileError::Parse {
                    line: line_num,
                    reason: "empty key".to_string(),
                });
            }

            for value in split_values(value.trim()) {
                options.push(UnitOption {
                    section: current.clone(),
                    name: key.to_string(),
                    value,
                });
            }
        }

        if !pending.is_empty() {
            return Err(UnitFileError::Parse {
                line: pending_start,
                reason: "continuation at end of file".to_string(),
            });
        }

        Ok(Self { options })
    }

    /// Build a unit file from explicit options.
    pub fn from_options(options: Vec<UnitOption>) -> Self {
        Self { options }
    }

    /// All options in file order.
    pub fn options(&self) -> &[UnitOption] {
        &self.options
    }

    /// Values of `key` in `section`, in file order.
    pub fn values<'a>(&'a self, section: &'a str, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.options
            .iter()
            .filter(move |o| o.section == section && o.name == key)
            .map(|o| o.value.as_str())
    }

    /// Options of one section, in file order.
    pub fn section<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a UnitOption> {
        self.options.iter().filter(move |o| o.section == section)
    }

    /// The first `Description` of the `[Unit]` section, if any.
    pub fn description(&self) -> Option<&str> {
        self.values("Unit", "Description").next()
    }

    /// Serialise to the normalised form used as the payload blob.
    ///
    /// Sections appear in order of first appearance; options keep their
    /// relative order within a section.
    pub fn serialize(&self) -> String {
        let mut sections: Vec<&str> = Vec::new();
        for opt in &self.options {
            if !sections.contains(&opt.section.as_str()) {
                sections.push(&opt.section);
            }
        }

        let mut out = String::new();
        for (i, section) in sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(section);
            out.push_str("]\n");
            for opt in self.options.iter().filter(|o| o.section == *section) {
                out.push_str(&opt.name);
                out.push('=');
                out.push_str(&opt.value);
                out.push('\n');
            }
        }
        out
    }

    /// Content hash of the normalised body.
    pub fn hash(&self) -> UnitHash {
        UnitHash::of_bytes(self.serialize().as_bytes())
    }
}

fn split_values(value: &str) -> Vec<String> {
    if !(value.len() >= 2 && value.starts_with('"') && value.ends_with('"')) {
        return vec![value.to_string()];
    }

    let mut values = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in value.chars() {
        match c {
            '"' => quoted = !quoted,
            ' ' if !quoted => {
                if !current.is_empty() {
                    values.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        values.push(current);
    }
    values
}

/// Hex sha256 digest addressing a payload blob.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitHash(String);

impl UnitHash {
    /// Hash raw payload bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a hex digest.
    pub fn parse(s: &str) -> Result<Self, UnitFileError> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(UnitFileError::InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated digest.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_HASH_LENGTH]
    }
}

impl fmt::Display for UnitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UnitHash {
    type Error = UnitFileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UnitHash> for String {
    fn from(hash: UnitHash) -> Self {
        hash.0
    }
}
