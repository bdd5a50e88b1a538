//! Traversal contract shared by the HTML index crawler and the Alist client.

use std::fmt;
use std::future::Future;
use std::ops::Deref;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::RemoteError;
use crate::record::{FileRecord, join_path};

/// What a [`Visitor`] wants the walk to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFlow {
    Continue,
    /// On a directory: do not descend. On a file: skip its remaining siblings.
    SkipDir,
    /// Stop the whole walk without an error.
    SkipAll,
}

/// A remote path namespace that can be listed.
pub trait RemoteTree: Sync {
    fn stat(&self, path: &str) -> impl Future<Output = Result<FileRecord, RemoteError>> + Send;

    /// Direct children of `path`, in no particular order.
    fn read_dir(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Vec<FileRecord>, RemoteError>> + Send;

    fn walk<V>(
        &self,
        root: &str,
        visitor: &mut V,
    ) -> impl Future<Output = Result<(), V::Error>> + Send
    where
        V: Visitor + Send,
    {
        walk_tree(self, root, visitor)
    }
}

/// A `stat` or `read_dir` call that failed during a walk.
#[derive(Debug, Clone, Copy)]
pub struct WalkError<'a> {
    /// The directory whose listing failed. `None` when the node itself could
    /// not be stat'ed.
    pub entry: Option<&'a FileRecord>,
    pub error: &'a RemoteError,
}

impl Deref for WalkError<'_> {
    type Target = RemoteError;

    fn deref(&self) -> &RemoteError {
        self.error
    }
}

impl fmt::Display for WalkError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.error, f)
    }
}

pub trait Visitor {
    type Error: Send;

    /// Called once per node. Failed `stat`/`read_dir` calls are reported as
    /// `Err` so the visitor decides whether they are fatal.
    fn visit(
        &mut self,
        path: &str,
        entry: Result<&FileRecord, WalkError<'_>>,
    ) -> impl Future<Output = Result<WalkFlow, Self::Error>> + Send;
}

/// Depth-first, pre-order walk from `root`.
///
/// Directories are listed before they are visited; children are visited in
/// ascending name order. `SkipDir` and `SkipAll` never surface as errors.
pub async fn walk_tree<T, V>(tree: &T, root: &str, visitor: &mut V) -> Result<(), V::Error>
where
    T: RemoteTree + ?Sized,
    V: Visitor + Send,
{
    match tree.stat(root).await {
        Ok(entry) => {
            walk_entry(tree, root.to_string(), entry, visitor).await?;
        }
        Err(error) => {
            let failed = WalkError {
                entry: None,
                error: &error,
            };
            visitor.visit(root, Err(failed)).await?;
        }
    }
    Ok(())
}

fn walk_entry<'a, T, V>(
    tree: &'a T,
    path: String,
    entry: FileRecord,
    visitor: &'a mut V,
) -> BoxFuture<'a, Result<WalkFlow, V::Error>>
where
    T: RemoteTree + ?Sized,
    V: Visitor + Send,
{
    async move {
        if !entry.is_dir {
            return visitor.visit(&path, Ok(&entry)).await;
        }

        let listing = tree.read_dir(&path).await;
        let flow = match &listing {
            Ok(_) => visitor.visit(&path, Ok(&entry)).await?,
            Err(error) => {
                let failed = WalkError {
                    entry: Some(&entry),
                    error,
                };
                visitor.visit(&path, Err(failed)).await?
            }
        };
        let mut children = match (listing, flow) {
            (Ok(children), WalkFlow::Continue) => children,
            (_, flow) => return Ok(flow),
        };
        children.sort_by(|a, b| a.name.cmp(&b.name));

        for child in children {
            let child_path = join_path(&path, &child.name);
            let is_dir = child.is_dir;
            match walk_entry(tree, child_path, child, visitor).await? {
                WalkFlow::Continue => {}
                WalkFlow::SkipDir if is_dir => {}
                flow => return Ok(flow),
            }
        }
        Ok(WalkFlow::Continue)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Failure, Op};
    use reqwest::StatusCode;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTree {
        dirs: HashMap<String, Vec<FileRecord>>,
        broken: Vec<String>,
        reads: Mutex<Vec<String>>,
    }

    impl FakeTree {
        fn with_dir(mut self, path: &str, children: &[(&str, bool)]) -> Self {
            let entries = children
                .iter()
                .map(|(name, is_dir)| {
                    let child = join_path(path, name);
                    if *is_dir {
                        FileRecord::dir(child)
                    } else {
                        FileRecord::file(child, 1, 1, "")
                    }
                })
                .collect();
            self.dirs.insert(path.to_string(), entries);
            self
        }
    }

    impl RemoteTree for FakeTree {
        async fn stat(&self, path: &str) -> Result<FileRecord, RemoteError> {
            if self.dirs.contains_key(path) {
                Ok(FileRecord::dir(path))
            } else {
                Err(RemoteError::failed(
                    Op::Head,
                    path,
                    Failure::Status(StatusCode::NOT_FOUND),
                ))
            }
        }

        async fn read_dir(&self, path: &str) -> Result<Vec<FileRecord>, RemoteError> {
            self.reads.lock().unwrap().push(path.to_string());
            if self.broken.iter().any(|b| b == path) {
                return Err(RemoteError::failed(
                    Op::Get,
                    path,
                    Failure::Status(StatusCode::BAD_GATEWAY),
                ));
            }
            let mut children = self.dirs.get(path).cloned().unwrap_or_default();
            children.reverse();
            Ok(children)
        }
    }

    #[derive(Default)]
    struct Recorder {
        visited: Vec<String>,
        errors: Vec<String>,
        failed_dirs: Vec<String>,
        skip: Vec<String>,
        stop_at: Option<String>,
    }

    impl Visitor for Recorder {
        type Error = std::convert::Infallible;

        async fn visit(
            &mut self,
            path: &str,
            entry: Result<&FileRecord, WalkError<'_>>,
        ) -> Result<WalkFlow, Self::Error> {
            if let Err(failed) = entry {
                self.errors.push(path.to_string());
                if let Some(dir) = failed.entry {
                    self.failed_dirs.push(dir.path.clone());
                }
                return Ok(WalkFlow::Continue);
            }
            self.visited.push(path.to_string());
            if self.stop_at.as_deref() == Some(path) {
                return Ok(WalkFlow::SkipAll);
            }
            if self.skip.iter().any(|s| s == path) {
                return Ok(WalkFlow::SkipDir);
            }
            Ok(WalkFlow::Continue)
        }
    }

    fn sample_tree() -> FakeTree {
        FakeTree::default()
            .with_dir("/", &[("b", true), ("a", true), ("c.nfo", false)])
            .with_dir("/a", &[("z.nfo", false), ("m.nfo", false)])
            .with_dir("/b", &[("x", true)])
            .with_dir("/b/x", &[("y.strm", false)])
    }

    #[tokio::test]
    async fn visits_children_in_ascending_name_order() {
        let tree = sample_tree();
        let mut recorder = Recorder::default();
        tree.walk("/", &mut recorder).await.unwrap();

        assert_eq!(
            recorder.visited,
            vec!["/", "/a", "/a/m.nfo", "/a/z.nfo", "/b", "/b/x", "/b/x/y.strm", "/c.nfo"]
        );
    }

    #[tokio::test]
    async fn skip_dir_prevents_descending() {
        let tree = sample_tree();
        let mut recorder = Recorder {
            skip: vec!["/b".into()],
            ..Recorder::default()
        };
        tree.walk("/", &mut recorder).await.unwrap();

        assert!(!recorder.visited.iter().any(|p| p.starts_with("/b/")));
        assert!(recorder.visited.contains(&"/c.nfo".to_string()));
        let reads = tree.reads.lock().unwrap().clone();
        assert!(!reads.contains(&"/b/x".to_string()));
    }

    #[tokio::test]
    async fn skip_dir_on_file_skips_remaining_siblings() {
        let tree = sample_tree();
        let mut recorder = Recorder {
            skip: vec!["/a/m.nfo".into()],
            ..Recorder::default()
        };
        tree.walk("/", &mut recorder).await.unwrap();

        assert!(!recorder.visited.contains(&"/a/z.nfo".to_string()));
        assert!(recorder.visited.contains(&"/b".to_string()));
    }

    #[tokio::test]
    async fn skip_all_stops_walk_without_error() {
        let tree = sample_tree();
        let mut recorder = Recorder {
            stop_at: Some("/a/m.nfo".into()),
            ..Recorder::default()
        };
        tree.walk("/", &mut recorder).await.unwrap();

        assert_eq!(recorder.visited.last().unwrap(), "/a/m.nfo");
        assert!(!recorder.visited.contains(&"/b".to_string()));
    }

    #[tokio::test]
    async fn failed_root_stat_is_reported_to_visitor() {
        let tree = FakeTree::default();
        let mut recorder = Recorder::default();
        tree.walk("/missing", &mut recorder).await.unwrap();

        assert_eq!(recorder.errors, vec!["/missing"]);
        assert!(recorder.failed_dirs.is_empty());
        assert!(recorder.visited.is_empty());
    }

    #[tokio::test]
    async fn failed_read_dir_is_reported_and_not_descended() {
        let mut tree = sample_tree();
        tree.broken.push("/b".into());
        let mut recorder = Recorder::default();
        tree.walk("/", &mut recorder).await.unwrap();

        assert_eq!(recorder.errors, vec!["/b"]);
        assert_eq!(recorder.failed_dirs, vec!["/b"]);
        assert!(!recorder.visited.iter().any(|p| p.starts_with("/b")));
        assert!(recorder.visited.contains(&"/c.nfo".to_string()));
    }
}
