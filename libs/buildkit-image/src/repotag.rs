//! `registry[:port]/path:tag` references

use std::fmt;

/// A fully-qualified image reference such as `localhost:5000/foo:bar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepoTag<'a>(&'a str);

impl<'a> RepoTag<'a> {
    pub fn new(reference: &'a str) -> Self {
        Self(reference)
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }

    /// Split into repository and tag.
    ///
    /// A registry port adds a colon, so both `repo:tag` and
    /// `host:port/repo:tag` are accepted. Anything else has no tag.
    fn split(&self) -> Option<(&'a str, &'a str)> {
        match self.0.matches(':').count() {
            1 | 2 => self.0.rsplit_once(':'),
            _ => None,
        }
    }

    /// Everything before the tag, or `""` if the reference has no tag.
    pub fn repository(&self) -> &'a str {
        self.split().map(|(repo, _)| repo).unwrap_or("")
    }

    /// The tag, or `""` if the reference has none.
    pub fn tag(&self) -> &'a str {
        self.split().map(|(_, tag)| tag).unwrap_or("")
    }

    /// The first path segment.
    pub fn registry(&self) -> &'a str {
        self.0.split('/').next().unwrap_or("")
    }

    /// The repository without its registry.
    pub fn path(&self) -> Option<&'a str> {
        self.repository().split_once('/').map(|(_, path)| path)
    }
}

impl fmt::Display for RepoTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository() {
        assert_eq!(RepoTag::new("example.com/foo:bar").repository(), "example.com/foo");
        assert_eq!(RepoTag::new("localhost:5000/foo:bar").repository(), "localhost:5000/foo");
        assert_eq!(RepoTag::new("example.com/foo").repository(), "");
    }

    #[test]
    fn tag() {
        assert_eq!(RepoTag::new("example.com/foo:bar").tag(), "bar");
        assert_eq!(RepoTag::new("localhost:5000/foo:bar").tag(), "bar");
        assert_eq!(RepoTag::new("registry.com/foo").tag(), "");
        // A digest adds more colons than a tagged reference can have.
        assert_eq!(RepoTag::new("r.com/foo:v1@sha256:abc:def").tag(), "");
    }

    #[test]
    fn registry() {
        assert_eq!(RepoTag::new("example.com/foo:bar").registry(), "example.com");
        assert_eq!(RepoTag::new("localhost:5000/foo:bar").registry(), "localhost:5000");
    }

    #[test]
    fn path() {
        assert_eq!(RepoTag::new("example.com/foo:bar").path(), Some("foo"));
        assert_eq!(RepoTag::new("localhost:5000/foo:bar").path(), Some("foo"));
        assert_eq!(RepoTag::new("example.com/org/foo:bar").path(), Some("org/foo"));
        assert_eq!(RepoTag::new("foo:bar").path(), None);
    }
}
