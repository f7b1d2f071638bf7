//! End-to-end scans over an in-memory tree rooted at `/e`, with the output
//! tree under `bazel-out`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hdrscan_core::{
    ActionEnv, Artifact, ArtifactFactory, CancelFlag, HeaderData, Hints, HintsRegistry,
    IncludeScanner, IncludeSet, Inclusion, InclusionExtractor, InMemoryFileSystem, OsFileSystem,
    ParseCache, ReadyEnv, ScanError, ScanStrategy, ScannerConfig, SearchPaths,
    SourceTreeArtifactFactory, TextIncludeExtractor,
};

const EXEC_ROOT: &str = "/e";

fn mem_fs(files: &[(&str, &str)]) -> Arc<InMemoryFileSystem> {
    let mut map = HashMap::new();
    for (path, contents) in files {
        let key = if path.starts_with('/') {
            (*path).to_string()
        } else {
            format!("{EXEC_ROOT}/{path}")
        };
        map.insert(key, (*contents).to_string());
    }
    Arc::new(InMemoryFileSystem::new(map))
}

fn to_paths(paths: &[&str]) -> Vec<PathBuf> {
    paths.iter().map(PathBuf::from).collect()
}

struct Setup {
    scanner: Arc<IncludeScanner>,
    factory: Arc<SourceTreeArtifactFactory>,
    cancel: CancelFlag,
}

impl Setup {
    fn artifact(&self, path: &str) -> Arc<Artifact> {
        self.factory.resolve_source(Path::new(path)).unwrap()
    }

    async fn scan_sources(
        &self,
        sources: &[&str],
        header: Arc<HeaderData>,
    ) -> Result<Arc<IncludeSet>, ScanError> {
        let sources: Vec<_> = sources.iter().map(|path| self.artifact(path)).collect();
        let includes = Arc::new(IncludeSet::new());
        self.scanner
            .clone()
            .scan(None, &sources, header, &[], includes.clone(), &ReadyEnv)
            .await?;
        Ok(includes)
    }
}

fn scanner_on(
    fs: Arc<InMemoryFileSystem>,
    quote: &[&str],
    angle: &[&str],
    strategy: ScanStrategy,
    hints: Option<Arc<dyn Hints>>,
    parse_cache: Arc<ParseCache>,
    extractor: Option<Arc<dyn InclusionExtractor>>,
) -> Setup {
    let factory = Arc::new(SourceTreeArtifactFactory::new());
    let extractor = extractor
        .unwrap_or_else(|| Arc::new(TextIncludeExtractor::new(fs.clone(), EXEC_ROOT)));
    let mut config = ScannerConfig::new(
        EXEC_ROOT,
        "bazel-out",
        SearchPaths::new(to_paths(quote), to_paths(angle)),
    );
    config.strategy = strategy;
    let cancel = config.cancel.clone();
    let scanner = Arc::new(IncludeScanner::new(
        config,
        fs,
        factory.clone(),
        extractor,
        hints,
        parse_cache,
    ));
    Setup {
        scanner,
        factory,
        cancel,
    }
}

fn scanner(files: &[(&str, &str)], quote: &[&str], angle: &[&str]) -> Setup {
    scanner_on(
        mem_fs(files),
        quote,
        angle,
        ScanStrategy::ForkJoin,
        None,
        Arc::new(ParseCache::new()),
        None,
    )
}

fn paths(includes: &IncludeSet) -> HashSet<String> {
    includes
        .snapshot()
        .iter()
        .map(|artifact| artifact.exec_path().display().to_string())
        .collect()
}

fn names(expected: &[&str]) -> HashSet<String> {
    expected.iter().map(|path| path.to_string()).collect()
}

#[tokio::test]
async fn include_next_skips_earlier_search_paths() {
    let setup = scanner(
        &[
            ("a.cc", "#include <v.h>\n"),
            ("inc1/v.h", "#include_next <v.h>\n"),
            ("inc2/v.h", ""),
        ],
        &["inc1", "inc2"],
        &["inc1", "inc2"],
    );
    let includes = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["a.cc", "inc1/v.h", "inc2/v.h"]));
}

#[tokio::test]
async fn include_next_finds_nothing_before_its_own_position() {
    // inc1/v.h is the only v.h; its #include_next must not loop back to it.
    let setup = scanner(
        &[("a.cc", "#include <v.h>\n"), ("inc1/v.h", "#include_next <v.h>\n")],
        &["inc1", "inc2"],
        &["inc1", "inc2"],
    );
    let includes = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["a.cc", "inc1/v.h"]));
}

#[tokio::test]
async fn modular_headers_cut_the_traversal() {
    let setup = scanner(
        &[
            ("a.cc", "#include \"mod.h\"\n"),
            ("mod.h", "#include \"deep.h\"\n"),
            ("deep.h", ""),
        ],
        &[""],
        &[],
    );
    let modular = [setup.artifact("mod.h")].into_iter().collect();
    let header = Arc::new(HeaderData::new(modular, HashMap::new()));
    let includes = setup.scan_sources(&["a.cc"], header).await.unwrap();
    assert_eq!(paths(&includes), names(&["a.cc", "mod.h"]));
}

#[tokio::test]
async fn file_level_hints_expand_to_a_fixed_point() {
    let fs = mem_fs(&[
        ("a.cc", "#include \"x.h\"\n"),
        ("x.h", ""),
        ("y.h", ""),
        ("z.h", ""),
    ]);
    let factory = SourceTreeArtifactFactory::new();
    let mut registry = HintsRegistry::new();
    registry
        .add_file_rule("x.h", vec![factory.resolve_source(Path::new("y.h")).unwrap()])
        .unwrap();
    registry
        .add_file_rule("y.h", vec![factory.resolve_source(Path::new("z.h")).unwrap()])
        .unwrap();
    let setup = scanner_on(
        fs,
        &[""],
        &[],
        ScanStrategy::ForkJoin,
        Some(Arc::new(registry) as Arc<dyn Hints>),
        Arc::new(ParseCache::new()),
        None,
    );
    let includes = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    assert!(paths(&includes).is_superset(&names(&["a.cc", "x.h", "y.h", "z.h"])));
}

struct MissingEnv;

impl ActionEnv for MissingEnv {
    fn values_missing(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn missing_upstream_values_abort_before_any_processing() {
    let setup = scanner_on(
        mem_fs(&[("a.cc", "#include \"x.h\"\n"), ("x.h", "")]),
        &[""],
        &[],
        ScanStrategy::ForkJoin,
        Some(Arc::new(HintsRegistry::new()) as Arc<dyn Hints>),
        Arc::new(ParseCache::new()),
        None,
    );
    let includes = Arc::new(IncludeSet::new());
    let result = setup
        .scanner
        .clone()
        .scan(
            None,
            &[setup.artifact("a.cc")],
            Arc::new(HeaderData::default()),
            &[],
            includes.clone(),
            &MissingEnv,
        )
        .await;
    assert_eq!(result, Err(ScanError::MissingDeps));
    assert!(includes.is_empty());
}

#[tokio::test]
async fn cyclic_inclusions_terminate() {
    let setup = scanner(
        &[
            ("a.cc", "#include \"x.h\"\n"),
            ("x.h", "#include \"y.h\"\n"),
            ("y.h", "#include \"x.h\"\n"),
        ],
        &[""],
        &[],
    );
    let includes = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["a.cc", "x.h", "y.h"]));
}

const DAG: &[(&str, &str)] = &[
    ("a.cc", "#include \"b.h\"\n#include \"c.h\"\n#include <d.h>\n"),
    ("b.h", "#include \"e.h\"\n"),
    ("c.h", "#include \"e.h\"\n"),
    ("e.h", ""),
    ("inc/d.h", "#include_next <d.h>\n"),
    ("inc2/d.h", ""),
];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn both_strategies_compute_the_same_closure() {
    let mut results = Vec::new();
    for strategy in [ScanStrategy::ForkJoin, ScanStrategy::Chained, ScanStrategy::ForkJoin] {
        let setup = scanner_on(
            mem_fs(DAG),
            &["", "inc", "inc2"],
            &["inc", "inc2"],
            strategy,
            None,
            Arc::new(ParseCache::new()),
            None,
        );
        let includes = setup
            .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
            .await
            .unwrap();
        results.push(paths(&includes));
    }
    let expected = names(&["a.cc", "b.h", "c.h", "e.h", "inc/d.h", "inc2/d.h"]);
    for result in results {
        assert_eq!(result, expected);
    }
}

#[tokio::test]
async fn relative_uplevel_escape_is_ignored() {
    // /x.h exists above the exec root and is reachable relative to a.cc,
    // but an inclusion may not climb out of its package root.
    let setup = scanner(
        &[("a.cc", "#include \"../x.h\"\n"), ("/x.h", "")],
        &["sub"],
        &[],
    );
    let includes = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["a.cc"]));
}

#[tokio::test]
async fn absolute_includes_are_scanned_for_their_own_inclusions() {
    let setup = scanner(
        &[
            ("a.cc", "#include </abs/q.h>\n"),
            ("/abs/q.h", "#include \"r.h\"\n"),
            ("/abs/r.h", ""),
        ],
        &["inc"],
        &["inc"],
    );
    let includes = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["a.cc", "/abs/q.h", "/abs/r.h"]));
}

#[tokio::test]
async fn command_line_includes_anchor_to_the_main_source() {
    let setup = scanner(
        &[("src/main.cc", ""), ("src/pch.h", "")],
        &[""],
        &[],
    );
    let main = setup.artifact("src/main.cc");
    let includes = Arc::new(IncludeSet::new());
    setup
        .scanner
        .clone()
        .scan(
            Some(main.clone()),
            &[main],
            Arc::new(HeaderData::default()),
            &["pch.h".to_string()],
            includes.clone(),
            &ReadyEnv,
        )
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["src/main.cc", "src/pch.h"]));
}

#[tokio::test]
async fn cancelled_scan_surfaces_the_interruption() {
    let setup = scanner(&[("a.cc", "#include \"x.h\"\n"), ("x.h", "")], &[""], &[]);
    setup.cancel.cancel();
    let result = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await;
    assert!(matches!(result, Err(ScanError::Interrupted { .. })));
}

struct CountingExtractor {
    inner: TextIncludeExtractor,
    counts: Mutex<HashMap<PathBuf, usize>>,
}

#[async_trait]
impl InclusionExtractor for CountingExtractor {
    async fn extract(
        &self,
        file: &Artifact,
        treat_as_generated: bool,
    ) -> Result<Vec<Inclusion>, ScanError> {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(file.exec_path().to_path_buf())
            .or_insert(0) += 1;
        self.inner.extract(file, treat_as_generated).await
    }
}

#[tokio::test]
async fn parse_cache_is_shared_across_scanners() {
    let fs = mem_fs(&[
        ("a.cc", "#include \"common.h\"\n"),
        ("b.cc", "#include \"common.h\"\n"),
        ("common.h", ""),
    ]);
    let extractor = Arc::new(CountingExtractor {
        inner: TextIncludeExtractor::new(fs.clone(), EXEC_ROOT),
        counts: Mutex::new(HashMap::new()),
    });
    let parse_cache = Arc::new(ParseCache::new());
    let first = scanner_on(
        fs.clone(),
        &[""],
        &[],
        ScanStrategy::ForkJoin,
        None,
        parse_cache.clone(),
        Some(extractor.clone() as Arc<dyn InclusionExtractor>),
    );
    let second = scanner_on(
        fs,
        &[""],
        &[],
        ScanStrategy::Chained,
        None,
        parse_cache,
        Some(extractor.clone() as Arc<dyn InclusionExtractor>),
    );

    first
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    second
        .scan_sources(&["b.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();

    let counts = extractor.counts.lock().unwrap();
    assert_eq!(counts.get(Path::new("common.h")), Some(&1));
}

struct FlakyExtractor {
    inner: TextIncludeExtractor,
    fail_path: PathBuf,
    remaining_failures: AtomicUsize,
}

#[async_trait]
impl InclusionExtractor for FlakyExtractor {
    async fn extract(
        &self,
        file: &Artifact,
        treat_as_generated: bool,
    ) -> Result<Vec<Inclusion>, ScanError> {
        if file.exec_path() == self.fail_path
            && self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(ScanError::Exec {
                path: self.fail_path.clone(),
                message: "helper process exited".to_string(),
            });
        }
        self.inner.extract(file, treat_as_generated).await
    }
}

#[tokio::test]
async fn failed_parses_are_evicted_and_retried() {
    let fs = mem_fs(&[("a.cc", "#include \"x.h\"\n"), ("x.h", "")]);
    let extractor = Arc::new(FlakyExtractor {
        inner: TextIncludeExtractor::new(fs.clone(), EXEC_ROOT),
        fail_path: PathBuf::from("a.cc"),
        remaining_failures: AtomicUsize::new(1),
    });
    let setup = scanner_on(
        fs,
        &[""],
        &[],
        ScanStrategy::Chained,
        None,
        Arc::new(ParseCache::new()),
        Some(extractor as Arc<dyn InclusionExtractor>),
    );

    let result = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await;
    assert!(matches!(result, Err(ScanError::Exec { .. })));

    // The failed entry was dropped from the parse cache; a rewound
    // execution succeeds.
    let includes = setup
        .scan_sources(&["a.cc"], Arc::new(HeaderData::default()))
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["a.cc", "x.h"]));
}

#[tokio::test]
async fn scans_a_real_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("lib")).unwrap();
    std::fs::write(root.join("a.cc"), "#include \"lib/x.h\"\n").unwrap();
    std::fs::write(root.join("lib/x.h"), "#include \"y.h\"\n").unwrap();
    std::fs::write(root.join("lib/y.h"), "").unwrap();

    let factory = Arc::new(SourceTreeArtifactFactory::new());
    let config = ScannerConfig::new(
        root,
        "bazel-out",
        SearchPaths::new(vec![PathBuf::from("")], Vec::new()),
    );
    let fs = Arc::new(OsFileSystem);
    let scanner = Arc::new(IncludeScanner::new(
        config,
        fs.clone(),
        factory.clone(),
        Arc::new(TextIncludeExtractor::new(fs, root)),
        None,
        Arc::new(ParseCache::new()),
    ));

    let includes = Arc::new(IncludeSet::new());
    scanner
        .clone()
        .scan(
            None,
            &[factory.resolve_source(Path::new("a.cc")).unwrap()],
            Arc::new(HeaderData::default()),
            &[],
            includes.clone(),
            &ReadyEnv,
        )
        .await
        .unwrap();
    assert_eq!(paths(&includes), names(&["a.cc", "lib/x.h", "lib/y.h"]));
}
