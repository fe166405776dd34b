//! Response metadata and hypermedia link resolution
//!
//! Every create/update call and every listed item carries a header-like
//! envelope: `Location`, `Title`, `Last-Modified` and any number of RFC 8288
//! `Link` values. Looking up a relation that is not present is a normal
//! condition; callers decide locally whether that is fatal.

use crate::{OptimizeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const HEADER_LOCATION: &str = "Location";
const HEADER_TITLE: &str = "Title";
const HEADER_LINK: &str = "Link";
const HEADER_LAST_MODIFIED: &str = "Last-Modified";

/// Named hypermedia relations used by the Optimize API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    SelfLink,
    Next,
    Prev,
    Up,
    Alternate,
    Labels,
    Trials,
    NextTrial,
    Scenarios,
    Template,
    Experiments,
}

impl Relation {
    /// Get the `rel` value used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::SelfLink => "self",
            Relation::Next => "next",
            Relation::Prev => "prev",
            Relation::Up => "up",
            Relation::Alternate => "alternate",
            Relation::Labels => "https://stormforge.io/rel/labels",
            Relation::Trials => "https://stormforge.io/rel/trials",
            Relation::NextTrial => "https://stormforge.io/rel/next-trial",
            Relation::Scenarios => "https://stormforge.io/rel/scenarios",
            Relation::Template => "https://stormforge.io/rel/template",
            Relation::Experiments => "https://stormforge.io/rel/experiments",
        }
    }

    /// Short name used in messages
    pub fn name(&self) -> &'static str {
        let rel = self.as_str();
        rel.rsplit('/').next().unwrap_or(rel)
    }

    fn matches(&self, rel: &str) -> bool {
        rel.eq_ignore_ascii_case(self.as_str()) || rel.eq_ignore_ascii_case(self.name())
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Header-style metadata attached to API responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Append a link with the given relation
    pub fn with_link(self, relation: Relation, url: impl fmt::Display) -> Self {
        self.with_header(HEADER_LINK, format!("<{}>; rel=\"{}\"", url, relation.as_str()))
    }

    pub fn with_location(self, location: impl Into<String>) -> Self {
        self.with_header(HEADER_LOCATION, location)
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.with_header(HEADER_TITLE, title)
    }

    /// All values for a header, matched case-insensitively
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    fn first(&self, name: &str) -> Option<&str> {
        self.values(name).into_iter().next().filter(|v| !v.is_empty())
    }

    /// Canonical URL of the created or updated resource
    pub fn location(&self) -> Option<&str> {
        self.first(HEADER_LOCATION)
    }

    pub fn title(&self) -> Option<&str> {
        self.first(HEADER_TITLE)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.first(HEADER_LAST_MODIFIED)
    }

    /// Look up the URL for a relation; `None` means the capability is absent
    pub fn link(&self, relation: Relation) -> Option<&str> {
        self.values(HEADER_LINK)
            .into_iter()
            .flat_map(parse_link_header)
            .find(|link| link.rels.iter().any(|rel| relation.matches(rel)))
            .map(|link| link.url)
            .filter(|url| !url.is_empty())
    }

    /// Look up a relation that the caller cannot proceed without
    pub fn require_link(&self, relation: Relation) -> Result<&str> {
        self.link(relation)
            .ok_or_else(|| OptimizeError::missing_link(relation))
    }

    /// Location that the caller cannot proceed without
    pub fn require_location(&self) -> Result<&str> {
        self.location()
            .ok_or_else(|| OptimizeError::MalformedResponse("missing location".to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single parsed `Link` header entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkValue<'a> {
    pub url: &'a str,
    pub rels: Vec<&'a str>,
}

/// Parse one `Link` header value, which may hold several comma separated links
pub fn parse_link_header(value: &str) -> Vec<LinkValue<'_>> {
    let mut links = Vec::new();
    let mut rest = value;

    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let url = rest[start + 1..start + len].trim();
        rest = &rest[start + len + 1..];

        let params_end = rest.find('<').unwrap_or(rest.len());
        let params = &rest[..params_end];
        rest = &rest[params_end..];

        let mut rels = Vec::new();
        for param in params.split(';') {
            let Some((key, val)) = param.split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("rel") {
                let val = val.trim().trim_end_matches(',').trim().trim_matches('"');
                rels.extend(val.split_whitespace());
            }
        }

        links.push(LinkValue { url, rels });
    }

    links
}
