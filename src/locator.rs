//! Source-locator normalization.
//!
//! Callers hand the pipeline anything from a bare video id to a full share
//! URL. Providers all want the same thing: the canonical id. This module
//! extracts it once, up front, so adapters never re-parse user input.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::AcquireError;

/// A bare video id: exactly 11 URL-safe base64 characters.
static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // static pattern, verified by tests
    Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap()
});

/// URL path prefixes that carry the id as the following segment.
const ID_PATH_PREFIXES: &[&str] = &["shorts", "embed", "live", "v"];

/// A normalized content locator: the extracted video id plus the canonical
/// watch URL that providers accepting full URLs are given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoLocator {
    video_id: String,
}

impl VideoLocator {
    /// Parses a raw source locator into a normalized [`VideoLocator`].
    ///
    /// Accepted forms:
    /// - bare 11-character video id
    /// - `watch?v=<id>` URLs on any host
    /// - `youtu.be/<id>` short links
    /// - `shorts/<id>`, `embed/<id>`, `live/<id>`, `v/<id>` path forms
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::InvalidLocator`] when no id can be extracted.
    pub fn parse(raw: &str) -> Result<Self, AcquireError> {
        let raw = raw.trim();

        if VIDEO_ID_RE.is_match(raw) {
            return Ok(Self {
                video_id: raw.to_string(),
            });
        }

        let url = Url::parse(raw).map_err(|_| AcquireError::invalid_locator(raw))?;

        if let Some(id) = id_from_query(&url).or_else(|| id_from_path(&url)) {
            return Ok(Self { video_id: id });
        }

        Err(AcquireError::invalid_locator(raw))
    }

    /// The extracted 11-character video id.
    #[must_use]
    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// The canonical watch URL for providers that accept full URLs.
    #[must_use]
    pub fn canonical_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }
}

impl std::fmt::Display for VideoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.video_id)
    }
}

/// Extracts the id from a `?v=` query parameter.
fn id_from_query(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
        .filter(|candidate| VIDEO_ID_RE.is_match(candidate))
}

/// Extracts the id from short-link and path-segment forms.
fn id_from_path(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let first = segments.next()?;

    // youtu.be/<id> carries the id as the first segment.
    let candidate = if url.host_str().is_some_and(|h| h.ends_with("youtu.be")) {
        first
    } else if ID_PATH_PREFIXES.contains(&first) {
        segments.next()?
    } else {
        return None;
    };

    VIDEO_ID_RE
        .is_match(candidate)
        .then(|| candidate.to_string())
}
