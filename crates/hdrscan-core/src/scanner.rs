//! The include scanner: resolution, caching, and the concurrent traversal.
//!
//! Resolution mirrors the preprocessor's search order: relative to the
//! includer for quote forms, then along the configured search path, with
//! `#include_next` resuming after the includer's own hit. The traversal
//! walks the resulting DAG on the runtime's pool, deduplicating on the
//! `(artifact, context)` triple, pruning at modular headers, and re-entering
//! the walk for hint-driven expansion once the textual fixed point is
//! reached.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::artifact::{Artifact, ArtifactFactory};
use crate::hints::{ActionEnv, Hints};
use crate::inclusion::{
    Inclusion, InclusionWithContext, LocateResult, SearchFlavor, RELATIVE_POS, TOP_LEVEL_POS,
};
use crate::parse::{InclusionExtractor, ParseCache};
use crate::path_cache::PathExistenceCache;
use crate::{contains_uplevel, normalize_path, FileSystem, ScanError};

/// Seed for the fan-out shuffle. Fixed so traversal order is reproducible;
/// the shuffle only decorrelates sibling exploration across worker tasks.
const SHUFFLE_SEED: u64 = 0x5eed_c0de;

/// Ordered include search directories.
///
/// The quote list is the full `-iquote`, `-I`, `-isystem` sequence; the
/// angle list is its `-I`, `-isystem` suffix. Immutable for the lifetime of
/// a scanner.
#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    quote: Vec<PathBuf>,
    angle: Vec<PathBuf>,
}

impl SearchPaths {
    pub fn new(quote: Vec<PathBuf>, angle: Vec<PathBuf>) -> Self {
        Self { quote, angle }
    }

    /// Assemble both lists from the compiler's flag groups.
    pub fn from_flags(
        iquote: impl IntoIterator<Item = PathBuf>,
        include: impl IntoIterator<Item = PathBuf>,
        isystem: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        let angle: Vec<PathBuf> = include.into_iter().chain(isystem).collect();
        let quote = iquote.into_iter().chain(angle.iter().cloned()).collect();
        Self { quote, angle }
    }

    pub fn quote_list(&self) -> &[PathBuf] {
        &self.quote
    }

    pub fn angle_list(&self) -> &[PathBuf] {
        &self.angle
    }

    fn list(&self, flavor: Option<SearchFlavor>) -> &[PathBuf] {
        match flavor {
            Some(SearchFlavor::Quote) => &self.quote,
            _ => &self.angle,
        }
    }
}

/// How the traversal pipelines recursion. Either strategy yields the same
/// result set; they differ only in how work reaches the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanStrategy {
    /// Dispatch unparsed children to the pool and block at a quiescence
    /// barrier; already-parsed children run inline.
    #[default]
    ForkJoin,
    /// Compose children as futures awaited on the parent task.
    Chained,
}

/// Per-invocation header metadata.
#[derive(Debug, Default)]
pub struct HeaderData {
    /// Headers whose transitive tails are covered by a precompiled module.
    pub modular_headers: HashSet<Arc<Artifact>>,
    /// Declared outputs of upstream actions within this scan's dependency
    /// scope, keyed by exec path.
    pub legal_outputs: HashMap<PathBuf, Arc<Artifact>>,
}

impl HeaderData {
    pub fn new(
        modular_headers: HashSet<Arc<Artifact>>,
        legal_outputs: HashMap<PathBuf, Arc<Artifact>>,
    ) -> Self {
        Self {
            modular_headers,
            legal_outputs,
        }
    }

    pub fn with_legal_outputs(outputs: impl IntoIterator<Item = Arc<Artifact>>) -> Self {
        let legal_outputs = outputs
            .into_iter()
            .map(|artifact| (artifact.exec_path().to_path_buf(), artifact))
            .collect();
        Self {
            modular_headers: HashSet::new(),
            legal_outputs,
        }
    }
}

/// Thread-safe artifact set receiving scan results.
///
/// Doubles as the traversal's visited set, so it may be shared across
/// several `scan` calls to aggregate their closures.
#[derive(Debug, Default)]
pub struct IncludeSet {
    inner: Mutex<HashSet<Arc<Artifact>>>,
}

impl IncludeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, reporting whether the artifact was new. The return value is
    /// the sole gate against double traversal.
    fn add(&self, artifact: Arc<Artifact>) -> bool {
        self.inner.lock().unwrap().insert(artifact)
    }

    pub fn contains(&self, artifact: &Artifact) -> bool {
        self.inner.lock().unwrap().contains(artifact)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Clone of the current contents.
    pub fn snapshot(&self) -> HashSet<Arc<Artifact>> {
        self.inner.lock().unwrap().clone()
    }

    /// Consume into the underlying set.
    pub fn into_inner(self) -> HashSet<Arc<Artifact>> {
        self.inner.into_inner().unwrap()
    }
}

/// Cooperative cancellation handle polled at traversal checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Immutable scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Absolute directory under which all action inputs are laid out.
    pub exec_root: PathBuf,
    /// Exec-relative prefix of the output tree (e.g. `bazel-out`).
    pub output_prefix: PathBuf,
    /// Exec-relative root of the inc symlink tree; entries below it are
    /// treated as source-like.
    pub inc_root: PathBuf,
    pub search: SearchPaths,
    pub strategy: ScanStrategy,
    /// Upper bound on concurrent inclusion extractions.
    pub pool_width: usize,
    pub cancel: CancelFlag,
}

impl ScannerConfig {
    pub fn new(
        exec_root: impl Into<PathBuf>,
        output_prefix: impl Into<PathBuf>,
        search: SearchPaths,
    ) -> Self {
        let output_prefix = output_prefix.into();
        let inc_root = output_prefix.join("inc");
        Self {
            exec_root: exec_root.into(),
            output_prefix,
            inc_root,
            search,
            strategy: ScanStrategy::default(),
            pool_width: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
            cancel: CancelFlag::new(),
        }
    }
}

/// Computes transitive inclusion closures.
///
/// The resolution cache and path-existence cache live for the scanner's
/// lifetime and are shared by every invocation; the parse cache is owned
/// externally and shared across scanners.
pub struct IncludeScanner {
    config: ScannerConfig,
    path_cache: PathExistenceCache,
    factory: Arc<dyn ArtifactFactory>,
    extractor: Arc<dyn InclusionExtractor>,
    hints: Option<Arc<dyn Hints>>,
    parse_cache: Arc<ParseCache>,
    resolution_cache: RwLock<HashMap<InclusionWithContext, LocateResult>>,
    extract_permits: Arc<Semaphore>,
}

impl IncludeScanner {
    pub fn new(
        config: ScannerConfig,
        fs: Arc<dyn FileSystem>,
        factory: Arc<dyn ArtifactFactory>,
        extractor: Arc<dyn InclusionExtractor>,
        hints: Option<Arc<dyn Hints>>,
        parse_cache: Arc<ParseCache>,
    ) -> Self {
        let path_cache = PathExistenceCache::new(fs, config.exec_root.clone());
        let extract_permits = Arc::new(Semaphore::new(config.pool_width.max(1)));
        Self {
            config,
            path_cache,
            factory,
            extractor,
            hints,
            parse_cache,
            resolution_cache: RwLock::new(HashMap::new()),
            extract_permits,
        }
    }

    // --- path classification ---

    /// Entries of the inc symlink tree are source-like, not outputs.
    fn is_inc_path(&self, path: &Path) -> bool {
        path.starts_with(&self.config.inc_root) && path != self.config.inc_root.as_path()
    }

    fn is_real_output(&self, path: &Path) -> bool {
        path.starts_with(&self.config.output_prefix) && !self.is_inc_path(path)
    }

    fn is_illegal_output(&self, path: &Path, legal: &HashMap<PathBuf, Arc<Artifact>>) -> bool {
        self.is_real_output(path) && !legal.contains_key(path)
    }

    // --- existence ---

    fn is_file(
        &self,
        path: &Path,
        name: &Path,
        is_source: bool,
        legal: &HashMap<PathBuf, Arc<Artifact>>,
    ) -> bool {
        if self.is_real_output(path) {
            return legal.contains_key(path);
        }
        if is_source && !path.is_absolute() && name.components().count() > 1 && path.ends_with(name)
        {
            // path = prefix/name: stat the directory layers contributed by
            // the written name before the file itself, outermost first, so
            // deep misses on shared prefixes stay cheap.
            let mut layers = Vec::new();
            let mut current = path.parent();
            for _ in 1..name.components().count() {
                match current {
                    Some(dir) => {
                        layers.push(dir);
                        current = dir.parent();
                    }
                    None => break,
                }
            }
            for dir in layers.into_iter().rev() {
                if !self.path_cache.directory_exists(dir) {
                    return false;
                }
            }
        }
        self.path_cache.file_exists(path, is_source)
    }

    // --- relative resolution (quote forms); never cached because it
    // depends on the includer ---

    fn locate_relative(
        &self,
        includer: &Artifact,
        name: &Path,
        legal: &HashMap<PathBuf, Arc<Artifact>>,
    ) -> Option<Arc<Artifact>> {
        let dir = includer.exec_path().parent().unwrap_or(Path::new(""));
        let candidate = normalize_path(&dir.join(name));
        if !self.is_file(&candidate, name, includer.is_source(), legal) {
            return None;
        }
        let rel_dir = includer.root_relative().parent().unwrap_or(Path::new(""));
        let root_relative = normalize_path(&rel_dir.join(name));
        if contains_uplevel(&root_relative) {
            // The inclusion escapes the includer's package root.
            return None;
        }
        if let Some(output) = legal.get(&candidate) {
            return Some(output.clone());
        }
        let resolved = self.factory.resolve_source_for_includer(name, includer);
        if resolved.is_none() {
            // Only names that climb out of the includer's root can fail here.
            debug_assert!(contains_uplevel(&normalize_path(name)));
            log::debug!(
                "relative candidate {} did not resolve under the root of {}",
                candidate.display(),
                includer,
            );
        }
        resolved
    }

    // --- search-path resolution ---

    fn locate_on_paths(
        &self,
        key: &InclusionWithContext,
        legal: &HashMap<PathBuf, Arc<Artifact>>,
        only_check_generated: bool,
    ) -> LocateResult {
        let name = &key.inclusion().path;
        let start = if key.inclusion().kind.is_next() {
            // Top-level context is -1; a `_next` there searches the whole
            // list.
            key.context_path_pos().max(0) as usize
        } else {
            0
        };
        let paths = self.config.search.list(key.context_kind());
        let mut viewed_illegal = false;
        for (pos, dir) in paths.iter().enumerate().skip(start) {
            let mut candidate = normalize_path(&dir.join(name));
            if contains_uplevel(&candidate) {
                // Absorb leading uplevels against the exec root. Mixed-style
                // separators can leave them behind, in which case the entry
                // is skipped.
                let absolute = normalize_path(&self.config.exec_root.join(&candidate));
                let stripped = absolute
                    .strip_prefix(&self.config.exec_root)
                    .map(Path::to_path_buf);
                candidate = match stripped {
                    Ok(relative) => relative,
                    Err(_) => absolute,
                };
                if contains_uplevel(&candidate) {
                    continue;
                }
            }
            if only_check_generated && !self.is_real_output(&candidate) {
                continue;
            }
            viewed_illegal |= self.is_illegal_output(&candidate, legal);
            let in_output_tree = candidate.starts_with(&self.config.output_prefix);
            if !self.is_file(&candidate, name, !in_output_tree, legal) {
                continue;
            }
            let artifact = if in_output_tree {
                match legal.get(&candidate) {
                    Some(output) => output.clone(),
                    // A declared include directory can expose files that are
                    // not declared outputs; stop searching so the miss stays
                    // tied to this entry.
                    None => return LocateResult::not_found(viewed_illegal),
                }
            } else if candidate.is_relative() {
                match self.factory.resolve_source(&candidate) {
                    Some(source) => source,
                    // Owning package not loaded.
                    None => continue,
                }
            } else {
                // Absolute include: hand the artifact back so its own
                // inclusions get scanned; rejecting it is the caller's
                // policy.
                self.factory.absolute_source(&candidate)
            };
            return LocateResult::found(artifact, (pos + 1) as i32, viewed_illegal);
        }
        LocateResult::not_found(viewed_illegal)
    }

    // --- resolution cache ---

    /// Cached search-path resolution. A miss that observed an undeclared
    /// output is never memoized: it is not a stable answer across actions
    /// sharing this scanner, since a later action may legally produce that
    /// file.
    fn lookup(
        &self,
        key: &InclusionWithContext,
        legal: &HashMap<PathBuf, Arc<Artifact>>,
    ) -> LocateResult {
        if let Some(hit) = self.resolution_cache.read().unwrap().get(key) {
            return hit.clone();
        }
        let result = self.locate_on_paths(key, legal, false);
        if result.is_found() || !result.viewed_illegal_output {
            return self.memoize(key, result);
        }
        // Retry against generated candidates only; the taint may vanish for
        // an action with a wider legal-output set.
        let retry = self.locate_on_paths(key, legal, true);
        if retry.is_found() || !retry.viewed_illegal_output {
            return self.memoize(key, retry);
        }
        log::debug!("uncacheable miss for {}", key.inclusion());
        retry
    }

    fn memoize(&self, key: &InclusionWithContext, result: LocateResult) -> LocateResult {
        // First writer wins so every reader observes one answer.
        self.resolution_cache
            .write()
            .unwrap()
            .entry(key.clone())
            .or_insert(result)
            .clone()
    }

    #[cfg(test)]
    fn cached(&self, key: &InclusionWithContext) -> Option<LocateResult> {
        self.resolution_cache.read().unwrap().get(key).cloned()
    }

    // --- entry point ---

    /// Compute the transitive inclusion closure of `sources` into
    /// `includes_out`.
    ///
    /// `main_source` anchors `-include` command-line arguments. On success
    /// the set is closed under inclusion restricted to found, declared,
    /// non-modular files; modular headers appear without their tails and
    /// undeclared outputs not at all.
    pub async fn scan(
        self: Arc<Self>,
        main_source: Option<Arc<Artifact>>,
        sources: &[Arc<Artifact>],
        header_data: Arc<HeaderData>,
        cmdline_includes: &[String],
        includes_out: Arc<IncludeSet>,
        env: &dyn ActionEnv,
    ) -> Result<(), ScanError> {
        let path_hints = match &self.hints {
            Some(hints) => {
                let hinted = hints.path_level_hints(self.config.search.quote_list(), env);
                if env.values_missing() {
                    return Err(ScanError::MissingDeps);
                }
                Some(hinted)
            }
            None => None,
        };

        let hints = self.hints.clone();
        let job = Arc::new(ScanJob {
            scanner: self,
            header: header_data,
            includes: includes_out,
            visited: Mutex::new(HashSet::new()),
            failed: AtomicBool::new(false),
        });

        if let Some(main) = main_source.filter(|_| !cmdline_includes.is_empty()) {
            log::debug!(
                "processing {} command-line includes against {}",
                cmdline_includes.len(),
                main,
            );
            let mut children = Children::new(job.clone());
            let mut interrupted = None;
            for name in cmdline_includes {
                if let Err(error) =
                    job.check_cancel("command-line include processing", main.exec_path())
                {
                    interrupted = Some(error);
                    break;
                }
                let key =
                    InclusionWithContext::new(Inclusion::quote(name.as_str()), TOP_LEVEL_POS, None);
                if let Some((file, recurse)) = find_and_process(&job, &key, &main) {
                    children.dispatch(file, recurse);
                }
            }
            finish(children, interrupted).await?;
        }

        process_bulk(&job, sources).await?;

        if let (Some(hints), Some(path_hints)) = (&hints, path_hints) {
            process_bulk(&job, &path_hints).await?;

            // Iterate file-level hints to a fixed point: each round injects
            // the hints of everything reached so far, scans the novel ones,
            // and continues from whatever that scan added.
            let mut frontier: Vec<Arc<Artifact>> = job.includes.snapshot().into_iter().collect();
            while !frontier.is_empty() {
                let mut adjacent = Vec::new();
                let mut queued = HashSet::new();
                for artifact in &frontier {
                    for hinted in hints.file_level_hints(artifact) {
                        if !job.includes.contains(&hinted) && queued.insert(hinted.clone()) {
                            adjacent.push(hinted);
                        }
                    }
                }
                if adjacent.is_empty() {
                    break;
                }
                log::debug!("hint frontier advances over {} artifacts", adjacent.len());
                let before = job.includes.snapshot();
                process_bulk(&job, &adjacent).await?;
                frontier = job
                    .includes
                    .snapshot()
                    .into_iter()
                    .filter(|artifact| !before.contains(artifact))
                    .collect();
            }
        }
        Ok(())
    }
}

/// Per-invocation traversal state.
struct ScanJob {
    scanner: Arc<IncludeScanner>,
    header: Arc<HeaderData>,
    includes: Arc<IncludeSet>,
    /// Dedup on the `(artifact, context kind, context position)` triple: the
    /// same file must be revisited when reached under a context whose
    /// `#include_next` would search differently.
    visited: Mutex<HashSet<(Arc<Artifact>, Option<SearchFlavor>, i32)>>,
    failed: AtomicBool,
}

impl ScanJob {
    fn check_cancel(&self, operation: &'static str, file: &Path) -> Result<(), ScanError> {
        if self.scanner.config.cancel.is_cancelled() {
            Err(ScanError::interrupted(operation, file))
        } else {
            Ok(())
        }
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    fn record_failure(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Extract the inclusions of `file` through the shared parse cache.
    async fn parse(&self, file: &Arc<Artifact>) -> Result<Arc<Vec<Inclusion>>, ScanError> {
        let future = self.scanner.parse_cache.future_for(file, || {
            let extractor = self.scanner.extractor.clone();
            let permits = self.scanner.extract_permits.clone();
            let treat_as_generated = self.scanner.is_real_output(file.exec_path());
            let file = file.clone();
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| ScanError::interrupted("extraction scheduling", file.exec_path()))?;
                extractor.extract(&file, treat_as_generated).await.map(Arc::new)
            }
            .boxed()
        });
        match future.clone().await {
            Ok(inclusions) => Ok(inclusions),
            Err(error) => {
                // Drop the poisoned entry so a rewound execution can retry.
                self.scanner.parse_cache.evict(file, &future);
                Err(error)
            }
        }
    }

    fn process_file(
        self: Arc<Self>,
        file: Arc<Artifact>,
        context_path_pos: i32,
        context_kind: Option<SearchFlavor>,
    ) -> BoxFuture<'static, Result<(), ScanError>> {
        async move {
            self.check_cancel("inclusion extraction", file.exec_path())?;
            if self.has_failed() {
                return Ok(());
            }
            let inclusions = self.parse(&file).await?;
            // Shuffled fan-out decorrelates sibling hotspots across workers
            // while staying reproducible.
            let mut inclusions = inclusions.as_ref().clone();
            inclusions.shuffle(&mut StdRng::seed_from_u64(SHUFFLE_SEED));

            let mut children = Children::new(self.clone());
            let mut interrupted = None;
            for inclusion in inclusions {
                if let Err(error) = self.check_cancel("inclusion resolution", file.exec_path()) {
                    interrupted = Some(error);
                    break;
                }
                if self.has_failed() {
                    break;
                }
                let key = InclusionWithContext::new(inclusion, context_path_pos, context_kind);
                if let Some((child, recurse)) = find_and_process(&self, &key, &file) {
                    children.dispatch(child, recurse);
                }
            }
            finish(children, interrupted).await
        }
        .boxed()
    }
}

/// Top-level entry for sources, path hints, and hint frontiers.
async fn process_bulk(job: &Arc<ScanJob>, sources: &[Arc<Artifact>]) -> Result<(), ScanError> {
    let mut children = Children::new(job.clone());
    for source in sources {
        // A top-level file lands in the result set before its own scan; one
        // already present is skipped wholesale, even though it might now be
        // reachable under a context that searches differently.
        if !job.includes.add(source.clone()) {
            continue;
        }
        children.dispatch(
            source.clone(),
            job.clone().process_file(source.clone(), TOP_LEVEL_POS, None),
        );
    }
    finish(children, None).await
}

/// Resolve one inclusion and stage recursion into the located file.
///
/// Relative resolution runs first for quote forms; everything else goes
/// through the cached search-path lookup. Returns the artifact and its
/// recursion future when the file is novel under this context.
fn find_and_process(
    job: &Arc<ScanJob>,
    key: &InclusionWithContext,
    includer: &Arc<Artifact>,
) -> Option<(Arc<Artifact>, BoxFuture<'static, Result<(), ScanError>>)> {
    let legal = &job.header.legal_outputs;
    let mut located = None;
    let mut context_path_pos = RELATIVE_POS;
    let mut context_kind = None;
    if key.inclusion().kind.flavor() == SearchFlavor::Quote {
        located = job
            .scanner
            .locate_relative(includer, &key.inclusion().path, legal);
    }
    if located.is_none() {
        let result = job.scanner.lookup(key, legal);
        located = result.artifact;
        context_path_pos = result.include_pos;
        context_kind = key.context_kind();
    }
    let file = match located {
        Some(file) => file,
        None => {
            log::debug!("{} from {}: not found", key.inclusion(), includer);
            return None;
        }
    };
    if job.scanner.is_illegal_output(file.exec_path(), legal) {
        // A cached hit from an action that could legally consume this
        // output; the current one cannot.
        return None;
    }
    if !job
        .visited
        .lock()
        .unwrap()
        .insert((file.clone(), context_kind, context_path_pos))
    {
        return None;
    }
    job.includes.add(file.clone());
    if job.header.modular_headers.contains(&file) {
        // The module that owns this header already accounts for its
        // transitive tail.
        return None;
    }
    Some((
        file.clone(),
        job.clone().process_file(file, context_path_pos, context_kind),
    ))
}

enum ChildTask {
    Inline(BoxFuture<'static, Result<(), ScanError>>),
    Spawned(JoinHandle<Result<(), ScanError>>),
}

/// Recursion staged under one parent, awaited at its quiescence barrier.
struct Children {
    job: Arc<ScanJob>,
    tasks: Vec<ChildTask>,
}

impl Children {
    fn new(job: Arc<ScanJob>) -> Self {
        Self {
            job,
            tasks: Vec::new(),
        }
    }

    /// Fork/join dispatches unparsed files to the pool; a file whose parse
    /// is already cached recurses inline, where scheduling overhead would
    /// exceed the saved latency. Chained mode always composes inline.
    fn dispatch(&mut self, file: Arc<Artifact>, recurse: BoxFuture<'static, Result<(), ScanError>>) {
        let task = match self.job.scanner.config.strategy {
            ScanStrategy::Chained => ChildTask::Inline(recurse),
            ScanStrategy::ForkJoin => {
                if self.job.scanner.parse_cache.is_ready(&file) {
                    ChildTask::Inline(recurse)
                } else {
                    ChildTask::Spawned(tokio::spawn(recurse))
                }
            }
        };
        self.tasks.push(task);
    }

    /// Await every staged child. The first failure wins; later spawned work
    /// is still awaited so no task outlives the barrier, while inline work
    /// that has not started yet is dropped once a failure is known.
    async fn quiesce(self) -> Result<(), ScanError> {
        let Children { job, tasks } = self;
        let mut first_error: Option<ScanError> = None;
        for task in tasks {
            match task {
                ChildTask::Inline(recurse) => {
                    if first_error.is_none() {
                        if let Err(error) = recurse.await {
                            first_error = Some(error);
                        }
                    }
                }
                ChildTask::Spawned(handle) => match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                    // Workers are never aborted, so a join failure is a
                    // panic; resurface it on the caller's task.
                    Err(join_error) => std::panic::resume_unwind(join_error.into_panic()),
                },
            }
        }
        match first_error {
            Some(error) => {
                job.record_failure();
                Err(error)
            }
            None => Ok(()),
        }
    }
}

/// Quiesce `children`, then surface `interrupted` (recorded before the
/// barrier) ahead of any child failure.
async fn finish(children: Children, interrupted: Option<ScanError>) -> Result<(), ScanError> {
    match interrupted {
        Some(error) => {
            children.job.record_failure();
            let _ = children.quiesce().await;
            Err(error)
        }
        None => children.quiesce().await,
    }
}
