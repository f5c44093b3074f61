//! Slash-separated document paths.
//!
//! Empty segments are ignored, so `""`, `"/"` and `"//"` all name the
//! root, and `"/a/b/"` is the same path as `"a/b"`.
//!
//! Segments are escaped the way JSON Pointer does it: `~1` stands for `/`
//! and `~0` for `~`. The key `"/etc/hosts"` is reached through
//! `"/~1etc~1hosts"`. An empty object key cannot be named at all, so
//! members stored under `""` are not addressable.

use std::fmt;

/// A parsed path into a [`JsonTree`](crate::JsonTree)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        Self {
            segments: raw
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(unescape)
                .collect(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Final segment, `None` for the root
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path, `None` for the root
    pub fn parent(&self) -> Option<Path> {
        self.split_last().map(|(parent, _)| parent)
    }

    /// Split into parent path and final segment
    pub fn split_last(&self) -> Option<(Path, &str)> {
        let (last, rest) = self.segments.split_last()?;
        Some((
            Path {
                segments: rest.to_vec(),
            },
            last.as_str(),
        ))
    }

    pub fn join(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", escape(segment))?;
        }
        Ok(())
    }
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

// `~1` first, so `~01` comes out as `~1` rather than `/`
fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Path::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_spellings() {
        assert!(Path::parse("").is_root());
        assert!(Path::parse("/").is_root());
        assert!(Path::parse("//").is_root());
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn test_parse_ignores_empty_segments() {
        let path = Path::parse("/a//b/");
        assert_eq!(path.segments(), &["a".to_string(), "b".to_string()]);
        assert_eq!(path, Path::parse("a/b"));
        assert_eq!(path.to_string(), "/a/b");
    }

    #[test]
    fn test_parent_and_last() {
        let path = Path::parse("/servers/0/port");
        assert_eq!(path.last(), Some("port"));
        assert_eq!(path.parent().unwrap().to_string(), "/servers/0");
        assert_eq!(Path::parse("/servers").parent(), Some(Path::root()));
        assert_eq!(Path::root().parent(), None);
    }

    #[test]
    fn test_escaped_segments() {
        let path = Path::root().join("/etc/hosts").join("a~b");
        assert_eq!(path.to_string(), "/~1etc~1hosts/a~0b");
        assert_eq!(Path::parse(&path.to_string()), path);
        assert_eq!(path.segments(), &["/etc/hosts".to_string(), "a~b".to_string()]);
        assert_eq!(Path::parse("/~01").last(), Some("~1"));
    }

    #[test]
    fn test_join() {
        let path = Path::root().join("array").join(2.to_string());
        assert_eq!(path.to_string(), "/array/2");
    }
}
