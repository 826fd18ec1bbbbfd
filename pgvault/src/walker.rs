//! Enumeration of the data directory for archival.
//!
//! The walk is pull-based on purpose: files routinely disappear between
//! enumeration and archival while the cluster keeps running, and the
//! missing-ok decision has to be made at the moment a file is touched,
//! not against a stale buffered listing.

use std::collections::BTreeMap;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

/// Archive base for the data directory itself.
pub const PGDATA_BASE: &str = "pgdata";
/// Archive base under which tablespace trees are stored, one subdirectory
/// per tablespace name.
pub const TABLESPACES_BASE: &str = "tablespaces";

/// Top-level directories whose contents are skipped but whose entry is
/// kept, so restore recreates them empty: runtime state the server
/// rebuilds, plus the WAL stream which travels through the separate
/// archive.
const EXCLUDED_DIR_CONTENTS: &[&str] = &[
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
    "pg_tblspc",
    "pg_wal",
    "pg_xlog",
];

/// Names never archived wherever they appear.
const EXCLUDED_NAMES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "pg_internal.init",
    "postgresql.auto.conf.tmp",
    "backup_label.old",
];

/// Name prefixes never archived: temporary sort areas and unix sockets.
const EXCLUDED_NAME_PREFIXES: &[&str] = &["pgsql_tmp", ".s.PGSQL."];

/// A tablespace to include in the walk, keyed by name at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedTablespace {
    pub oid: u32,
    pub path: Utf8PathBuf,
}

/// One enumerated path. Directories are emitted before their contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path inside the archive, e.g. `pgdata/global/pg_control`.
    pub archive_path: Utf8PathBuf,
    pub local_path: Utf8PathBuf,
    /// Zero for directories.
    pub file_size: u64,
    pub is_directory: bool,
    /// Whether the entry may vanish before archival without failing the
    /// backup. Cluster-level files invalidate the snapshot when they
    /// disappear; anything deeper is replayed from the WAL.
    pub missing_ok: bool,
}

impl WalkEntry {
    fn is_ancestor_of(&self, other: &Utf8Path) -> bool {
        other.starts_with(&self.archive_path)
    }
}

/// Lazily enumerates the data directory and every tablespace, in a
/// deterministic order: depth first, directories before their contents,
/// siblings lexically.
pub fn snapshot_entries<'a>(
    pgdata: &Utf8Path,
    tablespaces: &'a BTreeMap<String, WalkedTablespace>,
) -> impl Iterator<Item = anyhow::Result<WalkEntry>> + 'a {
    let mut roots = vec![(Utf8PathBuf::from(PGDATA_BASE), pgdata.to_path_buf())];
    for (name, tablespace) in tablespaces {
        roots.push((
            Utf8PathBuf::from(TABLESPACES_BASE).join(name),
            tablespace.path.clone(),
        ));
    }
    roots.into_iter().flat_map(|(base, root)| walk_root(base, root))
}

fn walk_root(
    archive_base: Utf8PathBuf,
    root: Utf8PathBuf,
) -> impl Iterator<Item = anyhow::Result<WalkEntry>> {
    let walk_root = root.clone();
    walkdir::WalkDir::new(root.as_std_path())
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|dentry| !name_excluded(dentry.file_name().to_string_lossy().as_ref()))
        .filter_map(move |dentry| entry_from_dirent(&archive_base, &walk_root, dentry))
}

fn name_excluded(name: &str) -> bool {
    EXCLUDED_NAMES.contains(&name)
        || EXCLUDED_NAME_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

fn in_excluded_dir(relative: &Utf8Path) -> bool {
    let mut components = relative.components();
    let first = components.next().map(|c| c.as_str());
    let below_top = components.next().is_some();
    below_top && first.is_some_and(|name| EXCLUDED_DIR_CONTENTS.contains(&name))
}

fn entry_from_dirent(
    archive_base: &Utf8Path,
    root: &Utf8Path,
    dentry: walkdir::Result<walkdir::DirEntry>,
) -> Option<anyhow::Result<WalkEntry>> {
    let dentry = match dentry {
        Ok(dentry) => dentry,
        Err(e) => {
            // A subtree that vanished mid-walk below the top level is the
            // same as its files vanishing: tolerated.
            if e.depth() > 1 && e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) {
                return None;
            }
            return Some(Err(anyhow::Error::new(e).context("walk data directory")));
        }
    };

    let local_path = match Utf8PathBuf::from_path_buf(dentry.path().to_path_buf()) {
        Ok(p) => p,
        Err(bad) => return Some(Err(anyhow::anyhow!("non-utf8 path in data directory: {bad:?}"))),
    };
    let relative = match local_path.strip_prefix(root) {
        Ok(r) => r.to_path_buf(),
        Err(e) => return Some(Err(anyhow::Error::new(e).context("strip walk root"))),
    };
    if in_excluded_dir(&relative) {
        return None;
    }

    // Symlinks are not archived; tablespace links under pg_tblspc are
    // recreated from the manifest at restore time.
    if dentry.path_is_symlink() {
        return None;
    }

    let missing_ok = dentry.depth() > 1;
    let metadata = match dentry.metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => {
            if missing_ok {
                return None;
            }
            return Some(Err(anyhow::Error::new(e)
                .context(format!("top-level entry {local_path} disappeared during walk"))));
        }
        Err(e) => return Some(Err(anyhow::Error::new(e).context("stat walk entry"))),
    };

    let is_directory = metadata.is_dir();
    Some(Ok(WalkEntry {
        archive_path: archive_base.join(&relative),
        local_path,
        file_size: if is_directory { 0 } else { metadata.len() },
        is_directory,
        missing_ok,
    }))
}

/// Splits an entry stream into chunks whose accumulated file sizes stay at
/// or under `target_chunk_size` (directories count as zero). When a chunk
/// boundary falls inside a subtree, the next chunk re-emits every ancestor
/// directory of the upcoming file so each chunk extracts standalone.
pub fn split_entries(
    entries: impl Iterator<Item = anyhow::Result<WalkEntry>>,
    target_chunk_size: u64,
) -> anyhow::Result<(u64, Vec<Vec<WalkEntry>>)> {
    let mut chunks = Vec::new();
    let mut current: Vec<WalkEntry> = Vec::new();
    let mut current_size = 0u64;
    // Ancestor directory chain of the walk position, used to seed chunks
    // opened mid-subtree.
    let mut open_dirs: Vec<WalkEntry> = Vec::new();
    let mut total_entries = 0u64;

    for entry in entries {
        let entry = entry?;
        total_entries += 1;

        if entry.is_directory {
            open_dirs.retain(|dir| dir.is_ancestor_of(&entry.archive_path));
            open_dirs.push(entry.clone());
            current.push(entry);
        } else {
            if current_size > 0 && current_size + entry.file_size > target_chunk_size {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
                current.extend(
                    open_dirs
                        .iter()
                        .filter(|dir| dir.is_ancestor_of(&entry.archive_path))
                        .cloned(),
                );
            }
            current_size += entry.file_size;
            current.push(entry);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok((total_entries, chunks))
}

/// Enumerates and splits in one go; the walk itself stays lazy.
pub fn find_and_split(
    pgdata: &Utf8Path,
    tablespaces: &BTreeMap<String, WalkedTablespace>,
    target_chunk_size: u64,
) -> anyhow::Result<(u64, Vec<Vec<WalkEntry>>)> {
    split_entries(snapshot_entries(pgdata, tablespaces), target_chunk_size)
        .context("enumerate data directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(path: &Utf8Path, len: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'a'; len]).unwrap();
    }

    fn archive_paths(entries: &[WalkEntry]) -> Vec<String> {
        entries.iter().map(|e| e.archive_path.to_string()).collect()
    }

    #[test]
    fn split_by_size_reemits_ancestor_directories() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path().join("pgdata");
        for name in ["f1", "f2", "f3"] {
            write_file(&pgdata.join("split_top").join(name), 50_000);
        }
        for name in ["f1", "f2", "f3"] {
            write_file(&pgdata.join("split_top/split_sub").join(name), 50_000);
        }

        let (total_file_count, chunks) =
            find_and_split(&pgdata, &BTreeMap::new(), 110_000).unwrap();

        // 6 files and 2 directories
        assert_eq!(total_file_count, 8);
        assert_eq!(chunks.len(), 3);

        assert_eq!(
            archive_paths(&chunks[0]),
            vec!["pgdata/split_top", "pgdata/split_top/f1", "pgdata/split_top/f2"]
        );
        assert_eq!(
            archive_paths(&chunks[1]),
            vec![
                "pgdata/split_top",
                "pgdata/split_top/f3",
                "pgdata/split_top/split_sub",
                "pgdata/split_top/split_sub/f1"
            ]
        );
        assert_eq!(
            archive_paths(&chunks[2]),
            vec![
                "pgdata/split_top",
                "pgdata/split_top/split_sub",
                "pgdata/split_top/split_sub/f2",
                "pgdata/split_top/split_sub/f3"
            ]
        );

        // every chunk contains the ancestors of each of its files
        for chunk in &chunks {
            for entry in chunk.iter().filter(|e| !e.is_directory) {
                let mut parent = entry.archive_path.parent();
                while let Some(dir) = parent {
                    if dir == "pgdata" {
                        break;
                    }
                    assert!(
                        chunk
                            .iter()
                            .any(|e| e.is_directory && e.archive_path == dir),
                        "chunk missing ancestor {dir} of {}",
                        entry.archive_path
                    );
                    parent = dir.parent();
                }
            }
        }
    }

    #[test]
    fn walk_order_is_deterministic() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path().join("pgdata");
        write_file(&pgdata.join("zz.conf"), 10);
        write_file(&pgdata.join("base/1/2654"), 10);
        write_file(&pgdata.join("base/1/2655"), 10);
        write_file(&pgdata.join("global/pg_control"), 10);

        let first: Vec<_> = snapshot_entries(&pgdata, &BTreeMap::new())
            .collect::<anyhow::Result<_>>()
            .unwrap();
        let second: Vec<_> = snapshot_entries(&pgdata, &BTreeMap::new())
            .collect::<anyhow::Result<_>>()
            .unwrap();
        assert_eq!(first, second);

        assert_eq!(
            archive_paths(&first),
            vec![
                "pgdata/base",
                "pgdata/base/1",
                "pgdata/base/1/2654",
                "pgdata/base/1/2655",
                "pgdata/global",
                "pgdata/global/pg_control",
                "pgdata/zz.conf",
            ]
        );
    }

    #[test]
    fn missing_ok_follows_archive_depth() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path().join("pgdata");
        write_file(&pgdata.join("top1.test"), 3);
        write_file(&pgdata.join("global/sub1.test"), 3);

        let entries: Vec<_> = snapshot_entries(&pgdata, &BTreeMap::new())
            .collect::<anyhow::Result<_>>()
            .unwrap();
        for entry in &entries {
            if entry.archive_path.parent() == Some(Utf8Path::new(PGDATA_BASE)) {
                assert!(!entry.missing_ok, "{entry:?}");
            } else {
                assert!(entry.missing_ok, "{entry:?}");
            }
        }
    }

    #[test]
    fn excluded_state_is_not_walked() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path().join("pgdata");
        write_file(&pgdata.join("postmaster.pid"), 3);
        write_file(&pgdata.join("postmaster.opts"), 3);
        write_file(&pgdata.join("pg_wal/000000010000000000000001"), 3);
        write_file(&pgdata.join("pg_stat_tmp/global.stat"), 3);
        write_file(&pgdata.join("base/pgsql_tmp/pgsql_tmp123.0"), 3);
        write_file(&pgdata.join("base/1/2654"), 3);
        write_file(&pgdata.join("global/pg_control"), 3);

        let entries: Vec<_> = snapshot_entries(&pgdata, &BTreeMap::new())
            .collect::<anyhow::Result<_>>()
            .unwrap();
        let paths = archive_paths(&entries);
        assert_eq!(
            paths,
            vec![
                "pgdata/base",
                "pgdata/base/1",
                "pgdata/base/1/2654",
                "pgdata/global",
                "pgdata/global/pg_control",
                // WAL and stats directories survive as empty entries
                "pgdata/pg_stat_tmp",
                "pgdata/pg_wal",
            ]
        );
    }

    #[test]
    fn vanished_sublevel_entries_are_skipped() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path().join("pgdata");
        write_file(&pgdata.join("top1.test"), 3);
        write_file(&pgdata.join("global/sub1.test"), 3);
        write_file(&pgdata.join("global/sub2.test"), 3);

        // Delete a subdirectory file between readdir and stat by removing
        // it during iteration.
        let empty_tablespaces = BTreeMap::new();
        let mut iter = snapshot_entries(&pgdata, &empty_tablespaces);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.archive_path, "pgdata/global");
        fs::remove_file(pgdata.join("global/sub1.test")).unwrap();
        let rest: Vec<_> = iter.collect::<anyhow::Result<_>>().unwrap();
        let paths = archive_paths(&rest);
        assert!(!paths.contains(&"pgdata/global/sub1.test".to_string()));
        assert!(paths.contains(&"pgdata/global/sub2.test".to_string()));
        assert!(paths.contains(&"pgdata/top1.test".to_string()));
    }

    #[test]
    fn tablespaces_are_walked_under_their_name() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path().join("pgdata");
        write_file(&pgdata.join("global/pg_control"), 3);
        let ts = dir.path().join("ts1");
        write_file(&ts.join("PG_15_202209061/16384/2654"), 3);

        let tablespaces = BTreeMap::from([(
            "tstest".to_string(),
            WalkedTablespace {
                oid: 16385,
                path: ts,
            },
        )]);
        let entries: Vec<_> = snapshot_entries(&pgdata, &tablespaces)
            .collect::<anyhow::Result<_>>()
            .unwrap();
        let paths = archive_paths(&entries);
        assert!(paths.contains(&"tablespaces/tstest/PG_15_202209061/16384/2654".to_string()));
        // tablespace top level is fragile too
        let ts_top = entries
            .iter()
            .find(|e| e.archive_path == "tablespaces/tstest/PG_15_202209061")
            .unwrap();
        assert!(!ts_top.missing_ok);
    }
}
