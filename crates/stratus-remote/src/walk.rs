//! Depth-first traversal of a remote tree.

use std::time::SystemTime;

use crate::{RemoteFs, RemoteMetadata, RemoteResult};

#[derive(Debug, Clone)]
pub struct WalkedEntry {
    /// Logical path relative to the backend root (`""` for the root itself)
    pub path: String,
    pub metadata: RemoteMetadata,
}

/// Walk the remote tree under `root`, parents before children, root
/// included. With `skip_hidden`, dot-prefixed entries are pruned together
/// with their subtrees; the root itself is never pruned.
///
/// The first backend error aborts the walk.
pub async fn walk(
    fs: &dyn RemoteFs,
    root: &str,
    skip_hidden: bool,
) -> RemoteResult<Vec<WalkedEntry>> {
    let root = root.trim_matches('/');
    let root_meta = if root.is_empty() {
        RemoteMetadata {
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            is_dir: true,
        }
    } else {
        fs.stat(root).await?
    };

    let mut out = vec![WalkedEntry {
        path: root.to_string(),
        metadata: root_meta.clone(),
    }];
    let mut pending = Vec::new();
    if root_meta.is_dir {
        pending.push(root.to_string());
    }

    while let Some(dir) = pending.pop() {
        for entry in fs.list(&dir).await? {
            if skip_hidden && entry.name.starts_with('.') {
                continue;
            }
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{dir}/{}", entry.name)
            };
            if entry.metadata.is_dir {
                pending.push(path.clone());
            }
            out.push(WalkedEntry {
                path,
                metadata: entry.metadata,
            });
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRemote;

    #[tokio::test]
    async fn includes_root_and_prunes_hidden() {
        let fs = MemoryRemote::new();
        fs.write("a.txt", b"1").await.unwrap();
        fs.write(".md5_a.txt", b"h").await.unwrap();
        fs.write("sub/b.txt", b"2").await.unwrap();
        fs.write(".hidden/secret.txt", b"3").await.unwrap();

        let mut paths: Vec<String> = walk(&fs, "", true)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["", "a.txt", "sub", "sub/b.txt"]);
    }

    #[tokio::test]
    async fn parents_precede_children() {
        let fs = MemoryRemote::new();
        fs.write("x/y/z.txt", b"1").await.unwrap();

        let paths: Vec<String> = walk(&fs, "", true)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        let pos = |p: &str| paths.iter().position(|x| x == p).unwrap();
        assert!(pos("x") < pos("x/y"));
        assert!(pos("x/y") < pos("x/y/z.txt"));
    }
}
