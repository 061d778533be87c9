//! In-memory engine over a fake, content-addressed object graph.
//!
//! Several [`MemoryEngine`]s created with [`MemoryEngine::sibling`] share one
//! object database and logical clock but keep their own refs, notes and
//! working tree, which is how tests simulate independent devices. Remotes are
//! [`MemoryRemote`] handles that any number of engines can register.

use anyhow::{Context, Result, bail};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Checkout, CommitInfo, Engine, MergeInProgress, PickOutcome, PushMode};

/// Path -> file contents.
type Tree = BTreeMap<String, Vec<u8>>;

/// Start of the logical clock, seconds since the epoch.
const CLOCK_START: i64 = 1_700_000_000;

const STATE_DIR_PREFIX: &str = ".jul/";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredCommit {
    tree: String,
    parents: Vec<String>,
    message: String,
    committed_at: i64,
}

#[derive(Debug, Default)]
struct ObjectStore {
    trees: HashMap<String, Tree>,
    commits: HashMap<String, StoredCommit>,
}

impl ObjectStore {
    fn put_tree(&mut self, tree: Tree) -> String {
        let mut hasher = Sha1::new();
        hasher.update(b"tree\n");
        for (path, contents) in &tree {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(contents.len().to_string().as_bytes());
            hasher.update([0]);
            hasher.update(contents);
        }
        let id = format!("{:x}", hasher.finalize());
        self.trees.entry(id.clone()).or_insert(tree);
        id
    }

    fn tree(&self, id: &str) -> Result<&Tree> {
        self.trees
            .get(id)
            .with_context(|| format!("unknown tree {id}"))
    }

    fn commit(&self, sha: &str) -> Result<&StoredCommit> {
        self.commits
            .get(sha)
            .with_context(|| format!("unknown commit {sha}"))
    }

    fn commit_tree(&self, sha: &str) -> Result<&Tree> {
        let commit = self.commit(sha)?;
        self.tree(&commit.tree)
    }

    fn put_commit(&mut self, commit: StoredCommit) -> Result<String> {
        self.tree(&commit.tree)?;
        for parent in &commit.parents {
            self.commit(parent)?;
        }
        let mut hasher = Sha1::new();
        hasher.update(format!("commit\ntree {}\n", commit.tree).as_bytes());
        for parent in &commit.parents {
            hasher.update(format!("parent {parent}\n").as_bytes());
        }
        hasher.update(format!("time {}\n\n", commit.committed_at).as_bytes());
        hasher.update(commit.message.as_bytes());
        let sha = format!("{:x}", hasher.finalize());
        self.commits.entry(sha.clone()).or_insert(commit);
        Ok(sha)
    }
}

#[derive(Debug)]
struct Shared {
    objects: Mutex<ObjectStore>,
    clock: AtomicI64,
    step: AtomicI64,
}

impl Shared {
    fn now(&self) -> i64 {
        let step = self.step.load(Ordering::SeqCst);
        self.clock.fetch_add(step, Ordering::SeqCst)
    }

    fn new_commit(&self, tree: &str, parents: &[String], message: &str) -> Result<String> {
        let committed_at = self.now();
        lock(&self.objects).put_commit(StoredCommit {
            tree: tree.to_string(),
            parents: parents.to_vec(),
            message: message.to_string(),
            committed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Remotes
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RemoteState {
    refs: BTreeMap<String, String>,
    notes: BTreeMap<String, BTreeMap<String, String>>,
    /// Ref prefixes whose pushes fail.
    rejected: Vec<String>,
    /// Tips another writer lands just before the next push to that ref.
    races: BTreeMap<String, String>,
}

/// A remote repository shared by every engine that registers it.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self, name: &str) -> Option<String> {
        lock(&self.state).refs.get(name).cloned()
    }

    /// Move a remote ref directly, as another writer would.
    pub fn set_tip(&self, name: &str, sha: &str) {
        lock(&self.state)
            .refs
            .insert(name.to_string(), sha.to_string());
    }

    /// Refuse every later push to a ref under `prefix`.
    pub fn reject(&self, prefix: &str) {
        lock(&self.state).rejected.push(prefix.to_string());
    }

    /// Move `name` to `sha` right before the next push to it is applied.
    pub fn race_next_push(&self, name: &str, sha: &str) {
        lock(&self.state)
            .races
            .insert(name.to_string(), sha.to_string());
    }

    pub fn ref_names(&self) -> Vec<String> {
        lock(&self.state).refs.keys().cloned().collect()
    }

    pub fn note(&self, notes_ref: &str, object: &str) -> Option<String> {
        lock(&self.state)
            .notes
            .get(notes_ref)
            .and_then(|notes| notes.get(object))
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CheckoutState {
    head: String,
    index: Tree,
    mid_merge: bool,
}

/// One simulated clone.
#[derive(Debug)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
    refs: Mutex<BTreeMap<String, String>>,
    notes: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    worktree: Mutex<Tree>,
    remotes: Mutex<BTreeMap<String, MemoryRemote>>,
    checkouts: Mutex<HashMap<String, Arc<Mutex<CheckoutState>>>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        let shared = Shared {
            objects: Mutex::new(ObjectStore::default()),
            clock: AtomicI64::new(CLOCK_START),
            step: AtomicI64::new(1),
        };
        Self::with_shared(Arc::new(shared))
    }

    fn with_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            refs: Mutex::new(BTreeMap::new()),
            notes: Mutex::new(BTreeMap::new()),
            worktree: Mutex::new(Tree::new()),
            remotes: Mutex::new(BTreeMap::new()),
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    /// Another clone sharing objects, clock and remote registrations, with
    /// empty refs, notes and working tree.
    pub fn sibling(&self) -> Self {
        let engine = Self::with_shared(Arc::clone(&self.shared));
        *lock(&engine.remotes) = lock(&self.remotes).clone();
        engine
    }

    pub fn add_remote(&self, name: &str, remote: &MemoryRemote) {
        lock(&self.remotes).insert(name.to_string(), remote.clone());
    }

    /// Stop the logical clock so following commits share a timestamp.
    pub fn freeze_clock(&self) {
        self.shared.step.store(0, Ordering::SeqCst);
    }

    // -- working tree -------------------------------------------------------

    pub fn write_file(&self, path: &str, contents: impl AsRef<[u8]>) {
        lock(&self.worktree).insert(path.to_string(), contents.as_ref().to_vec());
    }

    pub fn remove_file(&self, path: &str) {
        lock(&self.worktree).remove(path);
    }

    pub fn worktree_file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.worktree).get(path).cloned()
    }

    /// Commit the working tree on top of `HEAD` and advance `HEAD`.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let tree = self.snapshot_tree()?;
        let parents: Vec<String> = self.resolve_ref("HEAD")?.into_iter().collect();
        let sha = self.commit_tree(&tree, &parents, message)?;
        self.update_ref("HEAD", &sha)?;
        Ok(sha)
    }

    /// Files of a commit's tree.
    pub fn files_at(&self, commit: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(lock(&self.shared.objects).commit_tree(commit)?.clone())
    }

    /// Leave the isolated checkout for `key` in a mid-merge state.
    pub fn mark_mid_merge(&self, key: &str) {
        let state = self.checkout_state(key);
        lock(&state).mid_merge = true;
    }

    fn checkout_state(&self, key: &str) -> Arc<Mutex<CheckoutState>> {
        Arc::clone(
            lock(&self.checkouts)
                .entry(key.to_string())
                .or_default(),
        )
    }

    fn remote(&self, name: &str) -> Result<MemoryRemote> {
        lock(&self.remotes)
            .get(name)
            .cloned()
            .with_context(|| format!("remote {name} not found"))
    }

    fn is_commit(&self, sha: &str) -> bool {
        lock(&self.shared.objects).commits.contains_key(sha)
    }
}

impl Engine for MemoryEngine {
    type Checkout = MemoryCheckout;

    fn resolve_ref(&self, name: &str) -> Result<Option<String>> {
        let refs = lock(&self.refs);
        if let Some(sha) = refs.get(name) {
            return Ok(Some(sha.clone()));
        }
        if let Some(sha) = refs.get(&format!("refs/heads/{name}")) {
            return Ok(Some(sha.clone()));
        }
        drop(refs);
        Ok(self.is_commit(name).then(|| name.to_string()))
    }

    fn update_ref(&self, name: &str, target: &str) -> Result<()> {
        if !self.is_commit(target) {
            bail!("failed to update {name}: unknown commit {target}");
        }
        lock(&self.refs).insert(name.to_string(), target.to_string());
        Ok(())
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(lock(&self.refs)
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn commit_info(&self, sha: &str) -> Result<CommitInfo> {
        let objects = lock(&self.shared.objects);
        let commit = objects.commit(sha)?;
        Ok(CommitInfo {
            sha: sha.to_string(),
            tree: commit.tree.clone(),
            parents: commit.parents.clone(),
            message: commit.message.trim_end_matches('\n').to_string(),
            committed_at: commit.committed_at,
        })
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let objects = lock(&self.shared.objects);
        objects.commit(ancestor)?;
        let mut queue = VecDeque::from([descendant.to_string()]);
        let mut seen = BTreeSet::new();
        while let Some(sha) = queue.pop_front() {
            if sha == ancestor {
                return Ok(true);
            }
            if !seen.insert(sha.clone()) {
                continue;
            }
            queue.extend(objects.commit(&sha)?.parents.iter().cloned());
        }
        Ok(false)
    }

    fn commit_tree(&self, tree: &str, parents: &[String], message: &str) -> Result<String> {
        self.shared.new_commit(tree, parents, message)
    }

    fn snapshot_tree(&self) -> Result<String> {
        let tree: Tree = lock(&self.worktree)
            .iter()
            .filter(|(path, _)| !path.starts_with(STATE_DIR_PREFIX))
            .map(|(path, contents)| (path.clone(), contents.clone()))
            .collect();
        Ok(lock(&self.shared.objects).put_tree(tree))
    }

    fn changed_paths(&self, base: Option<&str>, commit: &str) -> Result<Vec<String>> {
        let objects = lock(&self.shared.objects);
        let empty = Tree::new();
        let before = match base {
            Some(base) => objects.commit_tree(base)?,
            None => &empty,
        };
        let after = objects.commit_tree(commit)?;
        let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        Ok(paths
            .into_iter()
            .filter(|path| before.get(*path) != after.get(*path))
            .cloned()
            .collect())
    }

    fn read_file(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.shared.objects)
            .commit_tree(commit)?
            .get(path)
            .cloned())
    }

    fn reset_working_tree(&self, commit: &str) -> Result<()> {
        let tree = lock(&self.shared.objects).commit_tree(commit)?.clone();
        *lock(&self.worktree) = tree;
        Ok(())
    }

    fn remotes(&self) -> Result<Vec<String>> {
        Ok(lock(&self.remotes).keys().cloned().collect())
    }

    fn remote_tip(&self, remote: &str, name: &str) -> Result<Option<String>> {
        Ok(self.remote(remote)?.tip(name))
    }

    fn fetch_ref(&self, remote: &str, name: &str) -> Result<Option<String>> {
        let tip = self.remote(remote)?.tip(name);
        if let Some(tip) = &tip {
            self.update_ref(name, tip)?;
        }
        Ok(tip)
    }

    fn push_ref(&self, remote: &str, sha: &str, name: &str, mode: &PushMode) -> Result<()> {
        if !self.is_commit(sha) {
            bail!("failed to push {name} to {remote}: unknown commit {sha}");
        }
        let remote_handle = self.remote(remote)?;
        let mut state = lock(&remote_handle.state);
        if let Some(raced) = state.races.remove(name) {
            state.refs.insert(name.to_string(), raced);
        }
        if state.rejected.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            bail!("failed to push {name} to {remote}: rejected by remote");
        }
        if let PushMode::Lease { expected } = mode {
            let current = state.refs.get(name);
            if current != expected.as_ref() {
                bail!(
                    "failed to push {name} to {remote}: stale info (remote at {}, expected {})",
                    current.map(String::as_str).unwrap_or("nothing"),
                    expected.as_deref().unwrap_or("nothing")
                );
            }
        }
        state.refs.insert(name.to_string(), sha.to_string());
        Ok(())
    }

    fn push_notes(&self, remote: &str, notes_ref: &str) -> Result<()> {
        let local = lock(&self.notes).get(notes_ref).cloned();
        let Some(local) = local else {
            return Ok(());
        };
        let remote_handle = self.remote(remote)?;
        lock(&remote_handle.state)
            .notes
            .entry(notes_ref.to_string())
            .or_default()
            .extend(local);
        Ok(())
    }

    fn read_note(&self, notes_ref: &str, object: &str) -> Result<Option<String>> {
        Ok(lock(&self.notes)
            .get(notes_ref)
            .and_then(|notes| notes.get(object))
            .cloned())
    }

    fn write_note(&self, notes_ref: &str, object: &str, content: &str) -> Result<()> {
        lock(&self.notes)
            .entry(notes_ref.to_string())
            .or_default()
            .insert(object.to_string(), content.to_string());
        Ok(())
    }

    fn list_notes(&self, notes_ref: &str) -> Result<Vec<String>> {
        Ok(lock(&self.notes)
            .get(notes_ref)
            .map(|notes| notes.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn isolated_checkout(
        &self,
        key: &str,
        base: &str,
        allow_resume: bool,
    ) -> Result<MemoryCheckout> {
        let state = self.checkout_state(key);
        let checkout = MemoryCheckout {
            state,
            shared: Arc::clone(&self.shared),
        };
        if lock(&checkout.state).mid_merge {
            if allow_resume {
                return Ok(checkout);
            }
            return Err(MergeInProgress {
                path: format!("memory:{key}"),
            }
            .into());
        }
        let mut checkout = checkout;
        checkout.reset(base)?;
        Ok(checkout)
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckout
// ---------------------------------------------------------------------------

/// Isolated checkout of a [`MemoryEngine`].
#[derive(Debug)]
pub struct MemoryCheckout {
    state: Arc<Mutex<CheckoutState>>,
    shared: Arc<Shared>,
}

impl Checkout for MemoryCheckout {
    fn head(&self) -> Result<String> {
        Ok(lock(&self.state).head.clone())
    }

    /// Three-way apply per path: a path changed by the commit is taken when
    /// the index still matches the commit's parent, kept when it already
    /// matches the commit, and conflicts otherwise.
    fn cherry_pick(&mut self, commit: &str) -> Result<PickOutcome> {
        let (before, after) = {
            let objects = lock(&self.shared.objects);
            let stored = objects.commit(commit)?;
            let before = match stored.parents.first() {
                Some(parent) => objects.commit_tree(parent)?.clone(),
                None => Tree::new(),
            };
            (before, objects.tree(&stored.tree)?.clone())
        };

        let mut state = lock(&self.state);
        let mut next = state.index.clone();
        let mut conflicts = Vec::new();
        let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        for path in paths {
            let base = before.get(path);
            let theirs = after.get(path);
            if base == theirs {
                continue;
            }
            let ours = state.index.get(path);
            if ours == theirs {
                continue;
            }
            if ours != base {
                conflicts.push(path.clone());
                continue;
            }
            match theirs {
                Some(contents) => next.insert(path.clone(), contents.clone()),
                None => next.remove(path),
            };
        }

        if !conflicts.is_empty() {
            return Ok(PickOutcome::Conflict(conflicts));
        }
        if next == state.index {
            return Ok(PickOutcome::Empty);
        }
        state.index = next;
        Ok(PickOutcome::Applied)
    }

    fn write_tree(&mut self) -> Result<String> {
        let index = lock(&self.state).index.clone();
        Ok(lock(&self.shared.objects).put_tree(index))
    }

    fn commit(&mut self, message: &str) -> Result<String> {
        let tree = self.write_tree()?;
        let head = self.head()?;
        let sha = self.shared.new_commit(&tree, &[head], message)?;
        lock(&self.state).head = sha.clone();
        Ok(sha)
    }

    fn reset(&mut self, commit: &str) -> Result<()> {
        let tree = lock(&self.shared.objects).commit_tree(commit)?.clone();
        let mut state = lock(&self.state);
        state.head = commit.to_string();
        state.index = tree;
        state.mid_merge = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
