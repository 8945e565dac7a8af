//! Version specifier parsing and image ordering

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, Result};

/// Server edition. Community sorts before enterprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Community,
    Enterprise,
}

impl Edition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::Community => "community",
            Edition::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build variant. The standard build sorts before serverless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Standard,
    Serverless,
}

impl Variant {
    pub fn is_serverless(&self) -> bool {
        matches!(self, Variant::Serverless)
    }
}

/// A parsed version specifier, before any artifact has been selected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDef {
    /// Owner of a privately built image, if any
    pub owner: Option<String>,
    pub edition: Edition,
    /// `major.minor[.patch...]`
    pub version: String,
    /// `0` for released builds
    pub build_number: u64,
    pub serverless: bool,
}

impl ImageDef {
    /// Parse a specifier of the form `[owner-]edition-version-build[-serverless]`.
    ///
    /// Edition defaults to enterprise and build to 0. With two segments the
    /// first is read as an edition unless it contains a `.`.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            OrchestratorError::InvalidVersionFormat(format!("{:?}: {}", spec, reason))
        };

        let mut parts: Vec<&str> = spec.trim().split('-').collect();
        let serverless = parts.len() > 1 && parts.last() == Some(&"serverless");
        if serverless {
            parts.pop();
        }

        let (owner, edition, version, build) = match parts.as_slice() {
            [version] => (None, None, *version, None),
            [first, second] if first.contains('.') => (None, None, *first, Some(*second)),
            [edition, version] => (None, Some(*edition), *version, None),
            [edition, version, build] => (None, Some(*edition), *version, Some(*build)),
            [owner, edition, version, build] => (Some(*owner), Some(*edition), *version, Some(*build)),
            _ => return Err(invalid("expected [owner-]edition-version-build")),
        };

        let edition = match edition {
            None => Edition::Enterprise,
            Some("community") => Edition::Community,
            Some("enterprise") => Edition::Enterprise,
            Some(other) => return Err(invalid(&format!("unknown edition {:?}", other))),
        };

        if !version.contains('.') {
            return Err(invalid("version must be at least major.minor"));
        }

        let build_number = match build {
            None => 0,
            Some(b) => b
                .parse::<u64>()
                .map_err(|_| invalid(&format!("build number {:?} is not an integer", b)))?,
        };

        if let Some(owner) = owner {
            if owner.is_empty() {
                return Err(invalid("empty owner"));
            }
        }

        Ok(Self {
            owner: owner.map(str::to_string),
            edition,
            version: version.to_string(),
            build_number,
            serverless,
        })
    }

    pub fn is_community(&self) -> bool {
        self.edition == Edition::Community
    }

    pub fn variant(&self) -> Variant {
        if self.serverless {
            Variant::Serverless
        } else {
            Variant::Standard
        }
    }
}

/// Parse a version specifier; see [`ImageDef::parse`]
pub fn identify(spec: &str) -> Result<ImageDef> {
    ImageDef::parse(spec)
}

impl fmt::Display for ImageDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(owner) = &self.owner {
            write!(f, "{}-", owner)?;
        }
        write!(f, "{}-{}-{}", self.edition, self.version, self.build_number)?;
        if self.serverless {
            write!(f, "-serverless")?;
        }
        Ok(())
    }
}

impl Ord for ImageDef {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(&self.version, &other.version)
            .then(self.build_number.cmp(&other.build_number))
            .then(self.edition.cmp(&other.edition))
            .then(self.variant().cmp(&other.variant()))
            .then_with(|| self.owner.cmp(&other.owner))
    }
}

impl PartialOrd for ImageDef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ImageDef {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ImageDef {}

/// One dotted component. Numeric components sort before textual ones.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Component<'a> {
    Numeric(u64),
    Text(&'a str),
}

impl<'a> Component<'a> {
    fn parse(s: &'a str) -> Self {
        match s.parse::<u64>() {
            Ok(n) => Component::Numeric(n),
            Err(_) => Component::Text(s),
        }
    }
}

/// Compare dotted versions component by component.
///
/// Numeric components compare numerically (`02` == `2`), missing trailing
/// components count as zero (`7.2` == `7.2.0`), and a numeric component
/// sorts before a non-numeric one, which compare as strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();

    for i in 0..left.len().max(right.len()) {
        let l = Component::parse(left.get(i).copied().unwrap_or("0"));
        let r = Component::parse(right.get(i).copied().unwrap_or("0"));
        let ord = l.cmp(&r);
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}
