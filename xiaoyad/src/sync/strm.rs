//! `.strm` placeholder links: parsing, resolution against the listing index
//! and rewriting for the served tree.

use thiserror::Error;
use url::Url;

/// Endpoint the upstream placeholders point at.
pub const SOURCE_ENDPOINT: &str = "http://xiaoya.host:5678";
/// Path prefix under which the upstream endpoint serves stream files.
pub const SOURCE_ROOT_PATH: &str = "/d";

#[derive(Debug, Error)]
pub enum StrmError {
    #[error("invalid stream link {link:?}: {source}")]
    Parse {
        link: String,
        #[source]
        source: url::ParseError,
    },
}

/// Trims surrounding whitespace and unescapes the literal `%20` upstream uses
/// for spaces.
pub fn normalize(raw: &str) -> String {
    raw.trim().replace("%20", " ")
}

pub fn parse_link(raw: &str) -> Result<Url, StrmError> {
    let link = normalize(raw);
    Url::parse(&link).map_err(|source| StrmError::Parse { link, source })
}

/// Listing-index path a link points at: its decoded path with the source
/// root prefix removed.
pub fn link_target(link: &Url) -> String {
    let decoded = urlencoding::decode(link.path())
        .map(|path| path.into_owned())
        .unwrap_or_else(|_| link.path().to_string());
    let relative = strip_root(&decoded, SOURCE_ROOT_PATH);
    format!("/{}", relative.trim_start_matches('/'))
}

/// Rewrites upstream links so they point at the configured endpoint.
#[derive(Debug, Clone)]
pub struct StrmRewriter {
    endpoint: Url,
    root_path: String,
}

impl StrmRewriter {
    pub fn new(endpoint: Url, root_path: &str) -> Self {
        Self {
            endpoint,
            root_path: format!("/{}", root_path.trim_matches('/')),
        }
    }

    /// Rewritten single-line content for a placeholder, without the newline.
    pub fn rewrite(&self, raw: &str) -> String {
        let link = match parse_link(raw) {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!(error = %err, "publishing unparsable stream link as is");
                return normalize(raw);
            }
        };
        if link.origin().ascii_serialization() != SOURCE_ENDPOINT {
            return link.to_string();
        }

        let relative = strip_root(link.path(), SOURCE_ROOT_PATH).trim_start_matches('/');
        let path = if self.root_path == "/" {
            format!("/{relative}")
        } else {
            format!("{}/{relative}", self.root_path)
        };

        let mut rewritten = self.endpoint.clone();
        rewritten.set_path(&path);
        rewritten.set_query(link.query());
        rewritten.set_fragment(link.fragment());
        rewritten.to_string()
    }
}

/// Strips `root` from the front of `path` when it is a whole leading segment.
fn strip_root<'a>(path: &'a str, root: &str) -> &'a str {
    match path.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter(endpoint: &str, root: &str) -> StrmRewriter {
        StrmRewriter::new(Url::parse(endpoint).unwrap(), root)
    }

    #[test]
    fn rewrites_source_links_to_endpoint_and_root() {
        let rewriter = rewriter("http://my.host/", "/z");
        assert_eq!(
            rewriter.rewrite("http://xiaoya.host:5678/d/x/y\n"),
            "http://my.host/z/x/y"
        );
    }

    #[test]
    fn keeps_query_and_fragment() {
        let rewriter = rewriter("https://media.example:8443/", "/d");
        assert_eq!(
            rewriter.rewrite("http://xiaoya.host:5678/d/a/b.mkv?sign=1#t"),
            "https://media.example:8443/d/a/b.mkv?sign=1#t"
        );
    }

    #[test]
    fn encodes_spaces_and_unicode_once() {
        let rewriter = rewriter("http://my.host/", "/z");
        let out = rewriter.rewrite("http://xiaoya.host:5678/d/电影/A%20B/A%20B.mkv");
        assert_eq!(
            out,
            "http://my.host/z/%E7%94%B5%E5%BD%B1/A%20B/A%20B.mkv"
        );
    }

    #[test]
    fn foreign_links_are_published_as_parsed() {
        let rewriter = rewriter("http://my.host/", "/z");
        assert_eq!(
            rewriter.rewrite("http://xiaoya.host:5679/d/x"),
            "http://xiaoya.host:5679/d/x"
        );
        assert_eq!(
            rewriter.rewrite("https://cdn.example/d/x"),
            "https://cdn.example/d/x"
        );
        assert_eq!(rewriter.rewrite("not a link"), "not a link");
    }

    #[test]
    fn link_target_strips_source_root() {
        let link = parse_link("http://xiaoya.host:5678/d/电影/A%20B/A.mkv").unwrap();
        assert_eq!(link_target(&link), "/电影/A B/A.mkv");

        let other = parse_link("http://xiaoya.host:5678/dx/a.mkv").unwrap();
        assert_eq!(link_target(&other), "/dx/a.mkv");
    }

    #[test]
    fn root_path_slash_publishes_relative_path() {
        let rewriter = rewriter("http://my.host/", "/");
        assert_eq!(
            rewriter.rewrite("http://xiaoya.host:5678/d/x/y"),
            "http://my.host/x/y"
        );
    }
}
