//! Charm and bundle identifiers.
//!
//! Accepted forms:
//! - `cs:[~user/][series/]name[-revision]` for entities held by the store
//! - `local:series/name[-revision]` for entities in a local repository
//! - the schema may be omitted, in which case `cs` is assumed
//!
//! The `bundle` series marks a bundle; anything else is a charm.

use crate::{Result, TroveError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::SmolStr;
use std::fmt;
use std::str::FromStr;

pub const BUNDLE_SERIES: &str = "bundle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    Store,
    Local,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Store => "cs",
            Schema::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Charm,
    Bundle,
}

impl ArtifactKind {
    /// Suffix used for cached archive files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Charm => "charm",
            ArtifactKind::Bundle => "bundle",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub schema: Schema,
    pub user: Option<SmolStr>,
    pub series: Option<SmolStr>,
    pub name: SmolStr,
    pub revision: Option<u32>,
}

impl ArtifactId {
    pub fn parse(s: &str) -> Result<Self> {
        let (schema, rest) = match s.split_once(':') {
            Some(("cs", rest)) => (Schema::Store, rest),
            Some(("local", rest)) => (Schema::Local, rest),
            Some((other, _)) => {
                return Err(TroveError::invalid_id(
                    s,
                    format!("unknown schema {:?}", other),
                ));
            }
            None => (Schema::Store, s),
        };

        let mut segments: Vec<&str> = rest.split('/').collect();
        let mut user = None;
        if let Some(first) = segments.first() {
            if let Some(name) = first.strip_prefix('~') {
                if schema == Schema::Local {
                    return Err(TroveError::invalid_id(s, "local ids cannot specify a user"));
                }
                if !is_valid_user(name) {
                    return Err(TroveError::invalid_id(s, format!("invalid user {:?}", name)));
                }
                user = Some(SmolStr::new(name));
                segments.remove(0);
            }
        }

        let (series, name_rev) = match segments.as_slice() {
            [name_rev] => (None, *name_rev),
            [series, name_rev] => {
                if !is_valid_series(series) {
                    return Err(TroveError::invalid_id(
                        s,
                        format!("invalid series {:?}", series),
                    ));
                }
                (Some(SmolStr::new(*series)), *name_rev)
            }
            _ => return Err(TroveError::invalid_id(s, "too many path segments")),
        };

        let (name, revision) = split_revision(name_rev);
        if !is_valid_name(name) {
            return Err(TroveError::invalid_id(s, format!("invalid name {:?}", name)));
        }
        if schema == Schema::Local && series.is_none() {
            return Err(TroveError::invalid_id(s, "local ids must specify a series"));
        }

        Ok(Self {
            schema,
            user,
            series,
            name: SmolStr::new(name),
            revision,
        })
    }

    pub fn kind(&self) -> ArtifactKind {
        match self.series.as_deref() {
            Some(BUNDLE_SERIES) => ArtifactKind::Bundle,
            _ => ArtifactKind::Charm,
        }
    }

    pub fn is_fully_qualified(&self) -> bool {
        self.revision.is_some()
    }

    pub fn with_revision(&self, revision: Option<u32>) -> Self {
        let mut id = self.clone();
        id.revision = revision;
        id
    }

    pub fn without_user(&self) -> Self {
        let mut id = self.clone();
        id.user = None;
        id
    }

    /// The id without its schema, as used in store API paths.
    pub fn path(&self) -> String {
        let mut out = String::new();
        if let Some(user) = &self.user {
            out.push('~');
            out.push_str(user);
            out.push('/');
        }
        if let Some(series) = &self.series {
            out.push_str(series);
            out.push('/');
        }
        out.push_str(&self.name);
        if let Some(revision) = self.revision {
            out.push('-');
            out.push_str(&revision.to_string());
        }
        out
    }

    /// A filesystem-safe rendering of the full id.
    pub fn quote(&self) -> String {
        quote(&self.to_string())
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.schema.as_str(), self.path())
    }
}

impl FromStr for ArtifactId {
    type Err = TroveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ArtifactId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ArtifactId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Escapes everything except ASCII letters, digits, `.` and `-` as `_xx_`.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push('_');
            out.push_str(&hex::encode([byte]));
            out.push('_');
        }
    }
    out
}

fn split_revision(name_rev: &str) -> (&str, Option<u32>) {
    if let Some((name, rev)) = name_rev.rsplit_once('-') {
        if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(revision) = rev.parse::<u32>() {
                return (name, Some(revision));
            }
        }
    }
    (name_rev, None)
}

/// Names are lowercase alphanumeric words joined by single hyphens, must
/// start with a letter, and no hyphen-separated word may be purely numeric.
pub fn is_valid_name(name: &str) -> bool {
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return false;
    }
    name.split('-').all(|word| {
        !word.is_empty()
            && word
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            && word.bytes().any(|b| b.is_ascii_lowercase())
    })
}

fn is_valid_series(series: &str) -> bool {
    !series.is_empty()
        && series.starts_with(|c: char| c.is_ascii_lowercase())
        && series
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn is_valid_user(user: &str) -> bool {
    !user.is_empty()
        && user
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'+' || b == b'.')
}
