// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Mirror of the system tree carrying per-node ownership and mode, plus the
//! compaction pass that turns per-file metadata into a small number of
//! `set_perm_recursive` defaults with per-node overrides.

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Write},
    process::{Command, Stdio},
};

use thiserror::Error;
use tracing::debug;

use crate::edify::EdifyScript;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Path registered as both file and directory: {0}")]
    NodeKindConflict(String),
    #[error("Parent of {0} is not a directory")]
    ParentNotDirectory(String),
    #[error("Unknown path: {0}")]
    UnknownPath(String),
    #[error("No filesystem metadata resolved for: {0}")]
    MissingMetadata(String),
    #[error("Invalid filesystem config record: {0:?}")]
    InvalidRecord(String),
    #[error("Failed to spawn {0:?}")]
    Spawn(String, #[source] io::Error),
    #[error("{0:?} exited with status {1}")]
    HelperFailed(String, i32),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Perms {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// The recursive default chosen for a directory: owner pair plus the
/// dominant directory and file modes among its descendants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Subtree {
    pub uid: u32,
    pub gid: u32,
    pub dmode: u32,
    pub fmode: u32,
}

/// Tuple counts keyed by (uid, gid, dmode, fmode); directories count under
/// dmode, files under fmode. Ordered so that tallies iterate
/// deterministically.
type Descendants = BTreeMap<(u32, u32, Option<u32>, Option<u32>), u64>;

#[derive(Debug)]
struct Node {
    path: String,
    name: String,
    is_dir: bool,
    children: Vec<NodeId>,
    perms: Option<Perms>,
    best_subtree: Option<Subtree>,
}

/// Path-indexed tree for one archive scan. Incremental composition builds
/// two independent instances; nothing here is shared process state.
#[derive(Debug)]
pub struct PermTree {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
}

impl Default for PermTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PermTree {
    pub fn new() -> Self {
        let root = Node {
            path: String::new(),
            name: String::new(),
            is_dir: true,
            children: vec![],
            perms: None,
            best_subtree: None,
        };

        Self {
            nodes: vec![root],
            index: HashMap::from([(String::new(), ROOT)]),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Register a node, creating intermediate directories on demand. Paths
    /// are relative with forward slashes and no trailing slash.
    pub fn ensure_node(&mut self, path: &str, is_dir: bool) -> Result<NodeId> {
        if let Some(&id) = self.index.get(path) {
            if self.nodes[id].is_dir != is_dir {
                return Err(Error::NodeKindConflict(path.to_owned()));
            }
            return Ok(id);
        }

        let (parent_path, name) = match path.rsplit_once('/') {
            Some((p, n)) => (p, n),
            None => ("", path),
        };

        let parent = self.ensure_node(parent_path, true)?;
        if !self.nodes[parent].is_dir {
            return Err(Error::ParentNotDirectory(path.to_owned()));
        }

        let id = self.nodes.len();
        self.nodes.push(Node {
            path: path.to_owned(),
            name: name.to_owned(),
            is_dir,
            children: vec![],
            perms: None,
            best_subtree: None,
        });
        self.nodes[parent].children.push(id);
        self.index.insert(path.to_owned(), id);

        Ok(id)
    }

    pub fn set_perms(&mut self, path: &str, uid: u32, gid: u32, mode: u32) -> Result<()> {
        let &id = self
            .index
            .get(path)
            .ok_or_else(|| Error::UnknownPath(path.to_owned()))?;

        self.nodes[id].perms = Some(Perms { uid, gid, mode });

        Ok(())
    }

    /// Apply `path uid gid octal_mode` records. Records for paths outside
    /// the tree (symlinks, removed files) are skipped.
    pub fn apply_config_text(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(path), Some(uid), Some(gid), Some(mode)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(Error::InvalidRecord(line.to_owned()));
            };

            let path = path.trim_end_matches('/');
            let uid: u32 = uid.parse().map_err(|_| Error::InvalidRecord(line.to_owned()))?;
            let gid: u32 = gid.parse().map_err(|_| Error::InvalidRecord(line.to_owned()))?;
            let mode = u32::from_str_radix(mode, 8)
                .map_err(|_| Error::InvalidRecord(line.to_owned()))?;

            match self.index.get(path) {
                Some(&id) => self.nodes[id].perms = Some(Perms { uid, gid, mode }),
                None => debug!("Skipping filesystem config record for unknown path: {path}"),
            }
        }

        Ok(())
    }

    /// Resolve metadata by invoking the external `fs_config` helper: one
    /// line per known node on stdin (directories suffixed with `/`), the
    /// same lines with uid/gid/mode appended on stdout.
    pub fn run_fs_config_helper(&mut self, program: &str) -> Result<()> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(program.to_owned(), e))?;

        {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            let mut paths: Vec<&Node> = self.nodes[ROOT + 1..].iter().collect();
            paths.sort_by(|a, b| a.path.cmp(&b.path));

            for node in paths {
                if node.is_dir {
                    writeln!(stdin, "{}/", node.path)?;
                } else {
                    writeln!(stdin, "{}", node.path)?;
                }
            }
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::HelperFailed(
                program.to_owned(),
                output.status.code().unwrap_or(-1),
            ));
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|_| Error::InvalidRecord("<non-UTF-8 helper output>".to_owned()))?;

        self.apply_config_text(&text)
    }

    /// Sort every directory's children by name. Must run after metadata
    /// resolution; the emission order of the permission plan depends on it.
    pub fn sort_children(&mut self) {
        for id in 0..self.nodes.len() {
            let mut children = std::mem::take(&mut self.nodes[id].children);
            children.sort_by(|&a, &b| self.nodes[a].name.cmp(&self.nodes[b].name));
            self.nodes[id].children = children;
        }
    }

    fn count_child_metadata(&mut self, id: NodeId) -> Result<Descendants> {
        let node = &self.nodes[id];
        let perms = node
            .perms
            .ok_or_else(|| Error::MissingMetadata(node.path.clone()))?;

        let mut d = Descendants::new();
        d.insert((perms.uid, perms.gid, Some(perms.mode), None), 1);

        for child in self.nodes[id].children.clone() {
            if self.nodes[child].is_dir {
                for (k, v) in self.count_child_metadata(child)? {
                    *d.entry(k).or_insert(0) += v;
                }
            } else {
                let child_node = &self.nodes[child];
                let perms = child_node
                    .perms
                    .ok_or_else(|| Error::MissingMetadata(child_node.path.clone()))?;

                *d.entry((perms.uid, perms.gid, None, Some(perms.mode)))
                    .or_insert(0) += 1;
            }
        }

        // Owner pair covering the most descendants. Strict comparison, so
        // ties resolve to the smallest pair.
        let mut owners = BTreeMap::<(u32, u32), u64>::new();
        for (&(uid, gid, _, _), &count) in &d {
            *owners.entry((uid, gid)).or_insert(0) += count;
        }

        let mut best_owner = (0, 0);
        let mut best_count = 0;
        for (&owner, &count) in &owners {
            if count > best_count {
                best_owner = owner;
                best_count = count;
            }
        }

        // Dominant modes among descendants with the chosen owner. The `>=`
        // keeps the last tuple seen on ties.
        let mut best_dmode = (0u64, 0o755);
        let mut best_fmode = (0u64, 0o644);
        for (&(uid, gid, dmode, fmode), &count) in &d {
            if (uid, gid) != best_owner {
                continue;
            }
            if let Some(m) = dmode {
                if count >= best_dmode.0 {
                    best_dmode = (count, m);
                }
            }
            if let Some(m) = fmode {
                if count >= best_fmode.0 {
                    best_fmode = (count, m);
                }
            }
        }

        self.nodes[id].best_subtree = Some(Subtree {
            uid: best_owner.0,
            gid: best_owner.1,
            dmode: best_dmode.1,
            fmode: best_fmode.1,
        });

        Ok(d)
    }

    /// Emit the permission-setting plan for the subtree rooted at `root`.
    /// The traversal starts with no inherited context, so the root always
    /// contributes one `set_perm_recursive`.
    pub fn set_permissions(&mut self, root: &str, script: &mut EdifyScript) -> Result<()> {
        let &id = self
            .index
            .get(root)
            .ok_or_else(|| Error::UnknownPath(root.to_owned()))?;

        self.count_child_metadata(id)?;
        self.emit(id, None, script)
    }

    fn emit(
        &self,
        id: NodeId,
        mut context: Option<Subtree>,
        script: &mut EdifyScript,
    ) -> Result<()> {
        let node = &self.nodes[id];
        let perms = node
            .perms
            .ok_or_else(|| Error::MissingMetadata(node.path.clone()))?;
        let device_path = format!("/{}", node.path);

        if node.is_dir {
            let best = node.best_subtree.expect("compaction ran before emission");

            if context != Some(best) {
                script.set_perm_recursive(&device_path, best.uid, best.gid, best.dmode, best.fmode);
                context = Some(best);
            }

            if perms.uid != best.uid || perms.gid != best.gid || perms.mode != best.dmode {
                script.set_perm(&device_path, perms.uid, perms.gid, perms.mode);
            }

            for &child in &node.children {
                self.emit(child, context, script)?;
            }
        } else {
            let matches_context = context.is_some_and(|ctx| {
                perms.uid == ctx.uid && perms.gid == ctx.gid && perms.mode == ctx.fmode
            });

            if !matches_context {
                script.set_perm(&device_path, perms.uid, perms.gid, perms.mode);
            }
        }

        Ok(())
    }

    /// All registered paths in sorted order. Used by tests and diagnostics.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.nodes[ROOT + 1..]
            .iter()
            .map(|n| n.path.as_str())
            .collect();
        paths.sort_unstable();
        paths
    }
}
