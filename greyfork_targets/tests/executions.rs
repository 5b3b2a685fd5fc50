//! End-to-end executions of the real `test_target` guest through both
//! executor strategies.

use core::time::Duration;
use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use greyfork::{
    executors::{
        forkserver::{
            ForkserverExecutor, RunMode, COVERAGE_LOG_ENV, EDGE_LOG_ENV, FEED_LOG_ENV,
            HASH_LOG_ENV, MODE_ENV_VAR, NODE_LOG_ENV, PATH_LOG_ENV, BITMAP_LOG_ENV,
            FORK_SERVER_ENV_VAR,
        },
        CommandExecutor, ExitKind,
    },
    feedback::{read_accum_log, read_branch_trace, read_coverage_summary, read_hash_log},
    GuestAddr,
};
use greyfork_bolts::os::unix_signals::Signal;
use serial_test::serial;

const TARGET: &str = env!("CARGO_BIN_EXE_test_target");

/// Little-endian `0x41424344`, the guest's crash trigger
const CRASH_INPUT: &[u8] = &[0x44, 0x43, 0x42, 0x41];

/// Address of the guest's per-byte comparison
const CMP_BYTE_ADDR: GuestAddr = 0x4100;

fn work_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gf_exec_{}_{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A panicking prior test can leave scratch stdin files behind; the
/// exclusive-create check would refuse to start on top of them.
fn clear_scratch() {
    for path in [".stdin", ".stdin_cov", ".stdin_feed"] {
        let _ = std::fs::remove_file(path);
    }
}

fn path_env(dir: &Path, key: &str, name: &str) -> (String, String) {
    (
        key.to_string(),
        dir.join(name).to_str().unwrap().to_string(),
    )
}

fn coverage_envs(dir: &Path) -> Vec<(String, String)> {
    vec![
        path_env(dir, COVERAGE_LOG_ENV, "coverage"),
        path_env(dir, NODE_LOG_ENV, "nodes"),
        path_env(dir, EDGE_LOG_ENV, "edges"),
        path_env(dir, PATH_LOG_ENV, "paths"),
    ]
}

fn branch_envs(dir: &Path) -> Vec<(String, String)> {
    vec![
        path_env(dir, FEED_LOG_ENV, "feed"),
        path_env(dir, HASH_LOG_ENV, "hash"),
    ]
}

fn summary(dir: &Path, mode: RunMode) -> greyfork::feedback::CoverageSummary {
    read_coverage_summary(dir.join("coverage"), mode).unwrap()
}

#[test]
#[serial]
fn forkserver_classifies_ok_and_crash() {
    clear_scratch();
    let dir = work_dir("classify");
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &coverage_envs(&dir),
        Duration::from_secs(2),
        RunMode::CountNew,
    )
    .unwrap();

    assert_eq!(
        executor.run_coverage(b"aa", RunMode::CountNew).unwrap(),
        ExitKind::Ok
    );
    assert_eq!(
        executor.run_coverage(CRASH_INPUT, RunMode::CountNew).unwrap(),
        ExitKind::Crash(Signal::SigSegmentationFault)
    );
    // The server survives a crashing child and keeps serving.
    assert_eq!(
        executor.run_coverage(b"bb", RunMode::CountNew).unwrap(),
        ExitKind::Ok
    );
}

#[test]
#[serial]
fn forkserver_replay_is_idempotent() {
    clear_scratch();
    let dir = work_dir("replay");
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &coverage_envs(&dir),
        Duration::from_secs(2),
        RunMode::CountNew,
    )
    .unwrap();

    assert_eq!(
        executor.run_coverage(b"aa", RunMode::CountNew).unwrap(),
        ExitKind::Ok
    );
    let first = summary(&dir, RunMode::CountNew);
    assert!(first.new_elem_count.unwrap() > 0);

    assert_eq!(
        executor.run_coverage(b"aa", RunMode::CountNew).unwrap(),
        ExitKind::Ok
    );
    let second = summary(&dir, RunMode::CountNew);
    assert_eq!(second.new_elem_count, Some(0));
    assert_eq!(second.path_hash, first.path_hash);
    assert_eq!(second.set_hash, first.set_hash);
}

#[test]
#[serial]
fn forkserver_accumulative_logs_grow_monotonically() {
    clear_scratch();
    let dir = work_dir("monotone");
    let node_log = dir.join("nodes");
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &coverage_envs(&dir),
        Duration::from_secs(2),
        RunMode::CountNew,
    )
    .unwrap();

    let mut sizes = Vec::new();
    for input in [&b"aa"[..], b"ab", b"aa", b"xyz", b"b"] {
        assert_eq!(
            executor.run_coverage(input, RunMode::CountNew).unwrap(),
            ExitKind::Ok
        );
        sizes.push(read_accum_log(&node_log).unwrap().len());
    }
    assert!(sizes.windows(2).all(|pair| pair[0] <= pair[1]));
    // A crashing run still extends the logs with what it discovered first.
    let before_crash = *sizes.last().unwrap();
    let _ = executor.run_coverage(CRASH_INPUT, RunMode::CountNew).unwrap();
    assert!(read_accum_log(&node_log).unwrap().len() >= before_crash);
}

#[test]
#[serial]
fn forkserver_timeout_is_classified_within_grace() {
    clear_scratch();
    let dir = work_dir("timeout");
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &coverage_envs(&dir),
        Duration::from_millis(500),
        RunMode::CountNew,
    )
    .unwrap();

    let start = Instant::now();
    assert_eq!(
        executor.run_coverage(b"hang", RunMode::CountNew).unwrap(),
        ExitKind::Timeout
    );
    // 500 ms deadline + 400 ms grace, plus slack for slow machines
    assert!(start.elapsed() < Duration::from_millis(3000));

    // The session stays usable afterwards.
    assert_eq!(
        executor.run_coverage(b"ok", RunMode::CountNew).unwrap(),
        ExitKind::Ok
    );
}

#[test]
#[serial]
fn forkserver_serves_a_thousand_runs_without_reexec() {
    clear_scratch();
    let dir = work_dir("thousand");
    let mut envs = coverage_envs(&dir);
    envs.push(path_env(&dir, HASH_LOG_ENV, "hash"));
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &envs,
        Duration::from_secs(2),
        RunMode::HashOnly,
    )
    .unwrap();

    let server_pid = executor.coverage_session().pid();
    for i in 0..1000 {
        let input = format!("run{i}");
        assert_eq!(
            executor
                .run_coverage(input.as_bytes(), RunMode::HashOnly)
                .unwrap(),
            ExitKind::Ok
        );
        // The server process never re-execs; every run is a fresh fork of it.
        assert_eq!(executor.coverage_session().pid(), server_pid);
    }
    assert!(read_hash_log(dir.join("hash")).unwrap().is_some());
}

#[test]
#[serial]
fn forkserver_bitmap_mode_accumulates_across_runs() {
    clear_scratch();
    let dir = work_dir("bitmap");
    let mut envs = coverage_envs(&dir);
    envs.push(path_env(&dir, BITMAP_LOG_ENV, "bitmap"));
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &envs,
        Duration::from_secs(2),
        RunMode::BitmapAccum,
    )
    .unwrap();

    assert_eq!(
        executor.run_coverage(b"xy", RunMode::BitmapAccum).unwrap(),
        ExitKind::Ok
    );
    let first = summary(&dir, RunMode::BitmapAccum);
    assert!(first.new_elem_count.unwrap() > 0);

    // The bitmap file carries the accumulated state into the next run.
    assert_eq!(
        executor.run_coverage(b"xy", RunMode::BitmapAccum).unwrap(),
        ExitKind::Ok
    );
    assert_eq!(summary(&dir, RunMode::BitmapAccum).new_elem_count, Some(0));
}

#[test]
#[serial]
fn branch_session_captures_the_indexed_hit() {
    clear_scratch();
    let cov_dir = work_dir("targ_cov");
    let branch_dir = work_dir("targ_branch");
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &coverage_envs(&cov_dir),
        Duration::from_secs(2),
        RunMode::CountNew,
    )
    .unwrap()
    .with_branch_session(TARGET, &[], &branch_envs(&branch_dir))
    .unwrap();

    // Hits 1 and 2 compare equal ('B' == 0x42); the 3rd hit ('z') differs and
    // must be the one (and only) captured record.
    assert_eq!(
        executor.run_branch(b"BBz", CMP_BYTE_ADDR, 3).unwrap(),
        ExitKind::Ok
    );

    let records = read_branch_trace(branch_dir.join("feed")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].addr, CMP_BYTE_ADDR);
    assert_eq!(records[0].operand_size(), 1);
    assert_eq!(records[0].operand1, u64::from(b'z'));
    assert_eq!(records[0].operand2, 0x42);
}

#[test]
#[serial]
fn branch_session_full_trace_records_every_comparison() {
    clear_scratch();
    let cov_dir = work_dir("full_cov");
    let branch_dir = work_dir("full_branch");
    let mut executor = ForkserverExecutor::new(
        TARGET,
        &[],
        &coverage_envs(&cov_dir),
        Duration::from_secs(2),
        RunMode::CountNew,
    )
    .unwrap()
    .with_branch_session(TARGET, &[], &branch_envs(&branch_dir))
    .unwrap();

    // A zero target address switches the stub's child to full-trace capture.
    assert_eq!(executor.run_branch(b"ab", 0, 0).unwrap(), ExitKind::Ok);

    let records = read_branch_trace(branch_dir.join("feed")).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].operand1, u64::from(b'a'));
    assert_eq!(records[1].operand1, u64::from(b'b'));
    assert!(read_hash_log(branch_dir.join("hash")).unwrap().is_some());
}

#[test]
#[serial]
fn command_executor_runs_without_a_fork_server() {
    clear_scratch();
    let dir = work_dir("direct");
    let executor = CommandExecutor::new(TARGET, vec![], Duration::from_secs(2))
        .unwrap()
        .env(FORK_SERVER_ENV_VAR, "0")
        .env(MODE_ENV_VAR, "0");
    let mut executor = coverage_envs(&dir)
        .into_iter()
        .fold(executor, |executor, (key, val)| executor.env(key, val));

    assert_eq!(executor.run(b"aa").unwrap(), ExitKind::Ok);
    let first = summary(&dir, RunMode::CountNew);
    assert!(first.new_elem_count.unwrap() > 0);

    assert_eq!(
        executor.run(CRASH_INPUT).unwrap(),
        ExitKind::Crash(Signal::SigSegmentationFault)
    );
}
