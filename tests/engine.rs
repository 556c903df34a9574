//! End-to-end tests: discover a workspace on disk, snapshot a pending map
//! and feed a scripted runner stream through the correlator.

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use test_explorer_engine::{
    CancellationToken, FileEvent, RunQueue, RunRequest, RunOutcome, TestTree,
    config::EngineConfig,
    run::{ScriptedProcess, correlate},
    sink::{RecordingSink, SharedSink, SinkEvent},
    source_map::NullSourceMapLoader,
    workspace::start_discovery,
};

fn write(root: &Path, relative: &str, content: &str) -> String {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

fn config() -> EngineConfig {
    EngineConfig {
        debounce_ms: 30,
        ..EngineConfig::default()
    }
}

const WORKSPACE_SOURCE: &str = "\
suite('a', () => { test('aa', fn); test('ab', fn); suite('ac', () => { test('aca', fn); }); });
suite('b', () => { test('ba', fn); });
";

fn suite_labels(tree: &TestTree) -> Vec<String> {
    let mut labels = tree.child_labels(tree.root());
    labels.sort();
    labels
}

#[test]
fn workspace_discovery_builds_the_expected_tree() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.test.ts", WORKSPACE_SOURCE);

    let sink = RecordingSink::shared();
    let handle = start_discovery(dir.path(), &config(), sink as SharedSink).unwrap();
    assert!(handle.wait_until_idle(Duration::from_secs(5)));

    handle.with_tree(|tree| {
        assert_eq!(suite_labels(tree), vec!["a", "b"]);
        let a = tree.child_by_label(tree.root(), "a").unwrap();
        let mut children = tree.child_labels(a);
        children.sort();
        assert_eq!(children, vec!["aa", "ab", "ac"]);
        let ac = tree.child_by_label(a, "ac").unwrap();
        assert_eq!(tree.child_labels(ac), vec!["aca"]);
    });

    let pending = handle.snapshot_pending();
    let mut titles: Vec<&str> = pending.keys().map(|title| title.as_str()).collect();
    titles.sort_unstable();
    assert_eq!(titles, vec!["a aa", "a ab", "a ac aca", "b ba"]);
}

#[test]
fn editing_a_file_removes_only_the_stale_test() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "a.test.ts", WORKSPACE_SOURCE);

    let sink = RecordingSink::shared();
    let handle = start_discovery(dir.path(), &config(), Arc::clone(&sink) as SharedSink).unwrap();
    assert!(handle.wait_until_idle(Duration::from_secs(5)));

    let (a, aa) = handle.with_tree(|tree| {
        let a = tree.child_by_label(tree.root(), "a").unwrap();
        (a, tree.child_by_label(a, "aa").unwrap())
    });

    write(
        dir.path(),
        "a.test.ts",
        &WORKSPACE_SOURCE.replace("test('ab', fn); ", ""),
    );
    handle.handle_event(FileEvent::Changed {
        path,
        live_edit: false,
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let gone = handle.with_tree(|tree| {
            let a = tree.child_by_label(tree.root(), "a").unwrap();
            tree.child_by_label(a, "ab").is_none()
        });
        if gone {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    handle.with_tree(|tree| {
        // Identities survived the re-parse.
        assert_eq!(tree.child_by_label(tree.root(), "a"), Some(a));
        assert_eq!(tree.child_by_label(a, "aa"), Some(aa));
        assert_eq!(tree.child_by_label(a, "ab"), None);
    });

    let removed: Vec<String> = sink
        .lock()
        .unwrap()
        .events
        .iter()
        .filter_map(|event| match event {
            SinkEvent::Removed(fqn) => Some(fqn.as_str().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec!["a ab"]);
}

#[test]
fn discovered_tree_correlates_with_a_scripted_run() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.test.ts", WORKSPACE_SOURCE);

    let discovery_sink = RecordingSink::shared();
    let handle =
        start_discovery(dir.path(), &config(), discovery_sink as SharedSink).unwrap();
    assert!(handle.wait_until_idle(Duration::from_secs(5)));
    let pending = handle.snapshot_pending();

    let (input, process) = ScriptedProcess::new();
    for line in [
        r#"["start",{"total":4}]"#,
        r#"["testStart",{"fullTitle":"a aa"}]"#,
        r#"["pass",{"fullTitle":"a aa","duration":4}]"#,
        r#"["testStart",{"fullTitle":"a ab"}]"#,
        r#"["fail",{"fullTitle":"a ab","err":"boom","expected":"1","actual":"2","duration":7}]"#,
        r#"["testStart",{"fullTitle":"a ac aca"}]"#,
        r#"["pass",{"fullTitle":"a ac aca","duration":2}]"#,
        r#"["end",{}]"#,
    ] {
        input.stdout.send(line.to_string()).unwrap();
    }
    drop(input);

    let run_sink = RecordingSink::shared();
    correlate(
        pending,
        &process,
        Arc::new(NullSourceMapLoader),
        &CancellationToken::none(),
        &(Arc::clone(&run_sink) as SharedSink),
        Duration::from_secs(2),
    )
    .unwrap();

    let run_sink = Arc::try_unwrap(run_sink).unwrap().into_inner().unwrap();
    assert_eq!(
        run_sink.outcomes_for(&"a aa".into()),
        vec![
            RunOutcome::Running,
            RunOutcome::Passed {
                duration_ms: Some(4)
            }
        ]
    );
    let failed = run_sink.outcomes_for(&"a ab".into());
    assert!(matches!(
        failed.last(),
        Some(RunOutcome::Failed { message, .. })
            if message.expected.as_deref() == Some("1") && message.actual.as_deref() == Some("2")
    ));
    // The runner never reached "b ba"; its own filtering decided that.
    assert_eq!(
        run_sink.outcomes_for(&"b ba".into()),
        vec![RunOutcome::Skipped]
    );
    assert!(run_sink.ended());
}

#[test]
fn run_queue_marks_cases_queued_before_running_them() {
    let sink = RecordingSink::shared();
    let queue = RunQueue::new(
        Arc::new(NullSourceMapLoader),
        Arc::clone(&sink) as SharedSink,
        Duration::from_millis(500),
    );

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.test.ts", "test('only', () => {});");
    let discovery_sink = RecordingSink::shared();
    let handle =
        start_discovery(dir.path(), &config(), discovery_sink as SharedSink).unwrap();
    assert!(handle.wait_until_idle(Duration::from_secs(5)));

    let (input, process) = ScriptedProcess::new();
    input
        .stdout
        .send(r#"["pass",{"fullTitle":"only","duration":1}]"#.to_string())
        .unwrap();
    input.stdout.send(r#"["end",{}]"#.to_string()).unwrap();
    drop(input);

    queue
        .enqueue(RunRequest {
            pending: handle.snapshot_pending(),
            process: Box::new(process),
            cancel: CancellationToken::none(),
        })
        .unwrap();
    drop(queue);

    let sink = Arc::try_unwrap(sink).unwrap().into_inner().unwrap();
    let outcomes = sink.outcomes_for(&"only".into());
    assert_eq!(
        outcomes,
        vec![
            RunOutcome::Queued,
            RunOutcome::Passed {
                duration_ms: Some(1)
            }
        ]
    );
}
