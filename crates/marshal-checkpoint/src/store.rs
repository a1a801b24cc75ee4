use gix::objs::tree::{Entry, EntryKind};
use gix::{ObjectId, Repository};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::paths::{normalize_file_set, resolve};
use crate::protocol::{CheckpointHandle, RestoreSummary};

const CHECKPOINT_REF: &str = "refs/marshal/checkpoints";
const COMMITTER_NAME: &str = "marshal";
const COMMITTER_EMAIL: &str = "checkpoints@marshal.local";

/// A stored checkpoint as read back from its commit. `files` maps every path
/// present at store time to its blob id; covered paths that did not exist are
/// simply absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub parent: Option<CheckpointHandle>,
    pub message: String,
    pub files: BTreeMap<String, String>,
}

/// Nested view of a file set, used to build git trees bottom-up.
#[derive(Debug)]
enum Node {
    Blob(ObjectId),
    Dir(BTreeMap<String, Node>),
}

/// Checkpoint storage backed by one bare git repository per project.
///
/// Layout under the root: `<project-name>-<key>.git`, where the key is derived
/// from the canonical project path. The newest checkpoint of a project is
/// tracked by `refs/marshal/checkpoints` in its repository.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshots exactly `file_set` under `project_dir` and returns the new commit's handle.
    pub fn store(
        &self,
        project_dir: &Path,
        file_set: &[String],
        label: Option<String>,
    ) -> StoreResult<CheckpointHandle> {
        let file_set = normalize_file_set(file_set)?;
        let repo_path = self.repo_path(project_dir);
        let repo = open_or_init(&repo_path)?;

        let mut root = BTreeMap::new();
        let mut present = 0usize;
        for relative in &file_set {
            let full = resolve(project_dir, relative);
            let bytes = match std::fs::read(&full) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(full, e)),
            };
            let blob = repo
                .write_blob(&bytes)
                .map_err(|e| StoreError::repository(&repo_path, format!("Failed to write blob: {e}")))?
                .detach();
            insert_path(&mut root, relative, blob)?;
            present += 1;
        }

        let tree = write_tree(&repo, &repo_path, &root)?;
        let parent = head_id(&repo, &repo_path)?;
        let signature = gix::actor::Signature {
            name: COMMITTER_NAME.into(),
            email: COMMITTER_EMAIL.into(),
            time: gix::date::Time::now_local_or_utc(),
        };
        let message = label.unwrap_or_else(|| format!("checkpoint of {}", project_dir.display()));
        let commit = gix::objs::Commit {
            tree,
            parents: parent.into_iter().collect(),
            author: signature.clone(),
            committer: signature,
            encoding: None,
            message: message.into(),
            extra_headers: Vec::new(),
        };
        let id = repo
            .write_object(&commit)
            .map_err(|e| StoreError::repository(&repo_path, format!("Failed to write commit: {e}")))?
            .detach();
        repo.reference(
            CHECKPOINT_REF,
            id,
            gix::refs::transaction::PreviousValue::Any,
            "checkpoint",
        )
        .map_err(|e| StoreError::repository(&repo_path, format!("Failed to update {CHECKPOINT_REF}: {e}")))?;

        debug!(
            target: "marshal::checkpoint",
            commit = %id,
            files = present,
            "stored checkpoint"
        );
        Ok(CheckpointHandle::from_object_id(id.to_string()))
    }

    /// Makes the working files in `file_set` match the checkpoint. Paths the
    /// checkpoint does not record as present are deleted; paths outside
    /// `file_set` are left alone.
    pub fn restore(
        &self,
        project_dir: &Path,
        handle: &CheckpointHandle,
        file_set: &[String],
    ) -> StoreResult<RestoreSummary> {
        let file_set = normalize_file_set(file_set)?;
        let repo_path = self.repo_path(project_dir);
        let repo = open_existing(&repo_path, handle)?;
        let snapshot = read_checkpoint(&repo, &repo_path, handle)?;

        // Read every blob before touching the working tree so a damaged store
        // cannot leave a half-restored project behind.
        let mut plan: Vec<(String, Option<Vec<u8>>)> = Vec::with_capacity(file_set.len());
        for relative in file_set {
            let contents = match snapshot.files.get(&relative) {
                Some(blob) => Some(read_blob(&repo, &repo_path, *blob)?),
                None => None,
            };
            plan.push((relative, contents));
        }

        let mut summary = RestoreSummary::default();
        for (relative, contents) in plan {
            let full = resolve(project_dir, &relative);
            match contents {
                Some(bytes) => {
                    if let Some(parent) = full.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
                    }
                    std::fs::write(&full, &bytes).map_err(|e| StoreError::io(&full, e))?;
                    summary.written.push(relative);
                }
                None => match std::fs::remove_file(&full) {
                    Ok(()) => summary.deleted.push(relative),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::io(full, e)),
                },
            }
        }

        debug!(
            target: "marshal::checkpoint",
            commit = %handle,
            written = summary.written.len(),
            deleted = summary.deleted.len(),
            "restored checkpoint"
        );
        Ok(summary)
    }

    pub fn head(&self, project_dir: &Path) -> StoreResult<Option<CheckpointHandle>> {
        let repo_path = self.repo_path(project_dir);
        if !repo_path.exists() {
            return Ok(None);
        }
        let repo = gix::open(&repo_path)
            .map_err(|e| StoreError::repository(&repo_path, format!("Failed to open repository: {e}")))?;
        Ok(head_id(&repo, &repo_path)?.map(|id| CheckpointHandle::from_object_id(id.to_string())))
    }

    pub fn load_commit(&self, project_dir: &Path, handle: &CheckpointHandle) -> StoreResult<Checkpoint> {
        let repo_path = self.repo_path(project_dir);
        let repo = open_existing(&repo_path, handle)?;
        let snapshot = read_checkpoint(&repo, &repo_path, handle)?;
        Ok(Checkpoint {
            parent: snapshot
                .parent
                .map(|id| CheckpointHandle::from_object_id(id.to_string())),
            message: snapshot.message,
            files: snapshot
                .files
                .into_iter()
                .map(|(path, blob)| (path, blob.to_string()))
                .collect(),
        })
    }

    fn repo_path(&self, project_dir: &Path) -> PathBuf {
        let canonical =
            std::fs::canonicalize(project_dir).unwrap_or_else(|_| project_dir.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let key = hex::encode(&digest[..8]);
        let name = canonical
            .file_name()
            .and_then(|n| n.to_str())
            .map(sanitize)
            .unwrap_or_else(|| "project".to_string());
        self.root.join(format!("{name}-{key}.git"))
    }
}

struct Snapshot {
    parent: Option<ObjectId>,
    message: String,
    files: BTreeMap<String, ObjectId>,
}

fn open_or_init(repo_path: &Path) -> StoreResult<Repository> {
    if repo_path.exists() {
        gix::open(repo_path)
            .map_err(|e| StoreError::repository(repo_path, format!("Failed to open repository: {e}")))
    } else {
        gix::init_bare(repo_path)
            .map_err(|e| StoreError::repository(repo_path, format!("Failed to create repository: {e}")))
    }
}

/// A project without a repository has no checkpoints at all.
fn open_existing(repo_path: &Path, handle: &CheckpointHandle) -> StoreResult<Repository> {
    if !repo_path.exists() {
        return Err(StoreError::NotFound(handle.to_string()));
    }
    gix::open(repo_path)
        .map_err(|e| StoreError::repository(repo_path, format!("Failed to open repository: {e}")))
}

fn head_id(repo: &Repository, repo_path: &Path) -> StoreResult<Option<ObjectId>> {
    let reference = repo
        .try_find_reference(CHECKPOINT_REF)
        .map_err(|e| StoreError::repository(repo_path, format!("Failed to read {CHECKPOINT_REF}: {e}")))?;
    Ok(reference.and_then(|r| r.try_id().map(|id| id.detach())))
}

fn find_object<'repo>(
    repo: &'repo Repository,
    repo_path: &Path,
    id: ObjectId,
) -> StoreResult<Option<gix::Object<'repo>>> {
    repo.try_find_object(id)
        .map_err(|e| StoreError::repository(repo_path, format!("Failed to read object {id}: {e}")))
}

fn corrupt(id: ObjectId, message: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        message: message.to_string(),
    }
}

fn read_checkpoint(
    repo: &Repository,
    repo_path: &Path,
    handle: &CheckpointHandle,
) -> StoreResult<Snapshot> {
    let id = ObjectId::from_hex(handle.as_str().as_bytes())
        .map_err(|_| StoreError::InvalidHandle(handle.to_string()))?;
    let object =
        find_object(repo, repo_path, id)?.ok_or_else(|| StoreError::NotFound(handle.to_string()))?;
    let commit = object
        .try_into_commit()
        .map_err(|_| StoreError::NotFound(handle.to_string()))?;
    let (tree, parent, message) = {
        let decoded = commit.decode().map_err(|e| corrupt(id, e))?;
        (
            decoded.tree(),
            decoded.parents().next(),
            decoded.message.to_string(),
        )
    };

    let mut files = BTreeMap::new();
    collect_blobs(repo, repo_path, tree, "", &mut files)?;
    Ok(Snapshot {
        parent,
        message,
        files,
    })
}

fn collect_blobs(
    repo: &Repository,
    repo_path: &Path,
    tree_id: ObjectId,
    prefix: &str,
    out: &mut BTreeMap<String, ObjectId>,
) -> StoreResult<()> {
    let object = find_object(repo, repo_path, tree_id)?
        .ok_or_else(|| corrupt(tree_id, "tree is missing"))?;
    let tree = object.try_into_tree().map_err(|e| corrupt(tree_id, e))?;
    let entries: Vec<(String, bool, ObjectId)> = tree
        .decode()
        .map_err(|e| corrupt(tree_id, e))?
        .entries
        .iter()
        .map(|entry| (entry.filename.to_string(), entry.mode.is_tree(), entry.oid.to_owned()))
        .collect();

    for (name, is_tree, oid) in entries {
        let path = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        if is_tree {
            collect_blobs(repo, repo_path, oid, &path, out)?;
        } else {
            out.insert(path, oid);
        }
    }
    Ok(())
}

fn read_blob(repo: &Repository, repo_path: &Path, id: ObjectId) -> StoreResult<Vec<u8>> {
    let object = find_object(repo, repo_path, id)?.ok_or_else(|| corrupt(id, "blob is missing"))?;
    if object.kind != gix::object::Kind::Blob {
        return Err(corrupt(id, format!("expected a blob, found {:?}", object.kind)));
    }
    Ok(object.detach().data)
}

fn insert_path(root: &mut BTreeMap<String, Node>, relative: &str, blob: ObjectId) -> StoreResult<()> {
    let mut parts: Vec<&str> = relative.split('/').collect();
    let Some(file_name) = parts.pop() else {
        return Err(StoreError::InvalidPath(relative.to_string()));
    };

    let mut dir = root;
    for part in parts {
        let node = dir
            .entry(part.to_string())
            .or_insert_with(|| Node::Dir(BTreeMap::new()));
        dir = match node {
            Node::Dir(children) => children,
            Node::Blob(_) => return Err(StoreError::InvalidPath(relative.to_string())),
        };
    }
    if matches!(dir.get(file_name), Some(Node::Dir(_))) {
        return Err(StoreError::InvalidPath(relative.to_string()));
    }
    dir.insert(file_name.to_string(), Node::Blob(blob));
    Ok(())
}

fn write_tree(
    repo: &Repository,
    repo_path: &Path,
    dir: &BTreeMap<String, Node>,
) -> StoreResult<ObjectId> {
    let mut entries = Vec::with_capacity(dir.len());
    for (name, node) in dir {
        let (mode, oid) = match node {
            Node::Blob(id) => (EntryKind::Blob.into(), *id),
            Node::Dir(children) => (EntryKind::Tree.into(), write_tree(repo, repo_path, children)?),
        };
        entries.push(Entry {
            mode,
            filename: name.as_str().into(),
            oid,
        });
    }
    // Git requires tree entries in its own name order.
    entries.sort();

    let id = repo
        .write_object(&gix::objs::Tree { entries })
        .map_err(|e| StoreError::repository(repo_path, format!("Failed to write tree: {e}")))?;
    Ok(id.detach())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
