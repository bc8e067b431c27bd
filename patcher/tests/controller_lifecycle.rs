//! Full controller runs against the in-memory framework and a real git workspace.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use patcher::agents::AgentSupervisor;
use patcher::agents::command::CommandAgent;
use patcher::controller::{Controller, RunSummary};
use patcher::core::phase::Phase;
use patcher::core::types::{AgentExit, SessionOutcome};
use patcher::io::config::PatcherConfig;
use patcher::io::git::Git;
use patcher::io::prompt::INSTRUCTIONS_FILE;
use patcher::io::session_log::SessionRecord;
use patcher::io::workspace::{GitWorkspace, WorkspaceNotFound};
use patcher::test_support::{
    CountingWorkspace, FakeFramework, PovScript, RecordingSleeper, ScriptedAgent,
};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

const ASAN_STDERR: &str = "==42==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602\n\
    READ of size 4 at 0x602 thread T0\n\
    SUMMARY: AddressSanitizer: heap-buffer-overflow parse.c:17 in parse_header\n";

const REF_DIFF: &str = "diff --git a/main.c b/main.c\n\
    --- a/main.c\n\
    +++ b/main.c\n\
    @@ -1 +1 @@\n\
    -int main(void) { return 0; }\n\
    +int main(void) { return 1; }\n";

fn config(root: &Path) -> PatcherConfig {
    PatcherConfig {
        snapshot_image: "snapshot:latest".to_string(),
        target: "demo".to_string(),
        harness: "fuzz_parse".to_string(),
        work_dir: root.join("work"),
        patches_dir: root.join("patches"),
        home_dir: root.join("home"),
        flush_wait_secs: 5,
        ..PatcherConfig::default()
    }
}

fn framework_with_source() -> FakeFramework {
    FakeFramework::default()
        .with_source_file("repo/main.c", "int main(void) { return 0; }\n")
        .with_source_file("repo/util.c", "int util(void) { return 1; }\n")
}

fn workspace_for(
    config: &PatcherConfig,
    framework: &Arc<FakeFramework>,
) -> CountingWorkspace<GitWorkspace<FakeFramework>> {
    CountingWorkspace::new(
        GitWorkspace::new(Arc::clone(framework), config.source_dir(), GIT_TIMEOUT)
            .with_exclude(INSTRUCTIONS_FILE),
    )
}

fn run_with(
    config: &PatcherConfig,
    framework: &Arc<FakeFramework>,
    agent: &ScriptedAgent,
    sleeper: &RecordingSleeper,
) -> (anyhow::Result<RunSummary>, Phase, usize) {
    let workspace = workspace_for(config, framework);
    let mut controller = Controller::new(config, Arc::clone(framework), &workspace, agent, sleeper);
    let result = controller.run();
    (result, controller.phase(), workspace.resets())
}

#[test]
fn two_povs_one_session_patch_produced() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(
        framework_with_source()
            .with_pov("crash-1", b"AAAA")
            .with_pov("crash-2", b"BBBB")
            .with_pov_script(PovScript::crash(1, ASAN_STDERR)),
    );
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)))
        .scribbling()
        .writing_patch("fix.diff", REF_DIFF);
    let sleeper = RecordingSleeper::default();

    let (result, phase, resets) = run_with(&config, &framework, &agent, &sleeper);
    let summary = result.expect("run");

    assert_eq!(phase, Phase::Done);
    assert_eq!(summary.pov_count, 2);
    assert!(summary.patch_produced());
    let session = summary.session.expect("session");
    assert_eq!(session.outcome, SessionOutcome::PatchProduced);
    assert_eq!(session.patches, vec![config.patches_dir.join("fix.diff")]);

    // One session for the whole group, reset before and after it.
    assert_eq!(resets, 2);
    let sessions = agent.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].harness, "fuzz_parse");
    assert_eq!(sessions[0].workspace, config.source_dir().join("repo"));
    assert!(sessions[0].status_at_start.is_empty());
    assert_eq!(sessions[0].reports.len(), 2);
    for report in &sessions[0].reports {
        assert_eq!(report.exit_code, Some(1));
        assert!(report.text.contains("heap-buffer-overflow"));
        assert!(report.text.ends_with("Exit code: 1\n"));
    }

    let calls = framework.calls();
    assert_eq!(
        &calls[..4],
        &["fetch:pov", "fetch:diff", "download:src", "resolve:inc-builder-asan"]
    );
    let runs = framework.pov_runs();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.build_variant == "base"));
    assert!(runs.iter().all(|r| r.harness == "fuzz_parse"));
    assert_eq!(runs[0].response_dir, config.reproduce_dir().join("0-crash-1"));

    assert_eq!(sleeper.slept(), vec![Duration::from_secs(5)]);

    // The scribbles are gone after the final reset.
    let git = Git::new(config.source_dir().join("repo"), GIT_TIMEOUT);
    assert!(git.status_porcelain().expect("status").is_empty());
    assert!(!config.source_dir().join("repo/.git/index.lock").exists());

    let record: SessionRecord = serde_json::from_str(
        &fs::read_to_string(config.session_dir().join("session.json")).expect("record"),
    )
    .expect("parse record");
    assert_eq!(record.pov_count, 2);
    assert_eq!(record.outcome, SessionOutcome::PatchProduced);
    assert_eq!(record.patches, vec!["fix.diff"]);
}

#[test]
fn zero_povs_finishes_without_a_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(framework_with_source());
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, phase, resets) = run_with(&config, &framework, &agent, &sleeper);
    let summary = result.expect("run");

    assert_eq!(phase, Phase::Done);
    assert_eq!(summary.pov_count, 0);
    assert!(summary.session.is_none());
    assert!(!summary.patch_produced());
    assert_eq!(agent.setup_count(), 1);
    assert!(agent.sessions().is_empty());
    assert_eq!(resets, 0);
    assert!(sleeper.slept().is_empty());
    assert!(!framework.calls().iter().any(|c| c.starts_with("resolve:")));
}

#[test]
fn patch_counts_even_when_agent_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(framework_with_source().with_pov("crash-1", b"A"));
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(1))).writing_patch("fix.diff", "x");
    let sleeper = RecordingSleeper::default();

    let (result, _, _) = run_with(&config, &framework, &agent, &sleeper);
    let session = result.expect("run").session.expect("session");

    assert_eq!(session.outcome, SessionOutcome::PatchProduced);
    assert_eq!(session.exit, AgentExit::Exited(Some(1)));
    assert_eq!(sleeper.slept().len(), 1);
}

#[test]
fn clean_exit_without_patch_is_no_patch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(framework_with_source().with_pov("crash-1", b"A"));
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, phase, _) = run_with(&config, &framework, &agent, &sleeper);
    let summary = result.expect("run");

    assert_eq!(phase, Phase::Done);
    assert_eq!(
        summary.session.expect("session").outcome,
        SessionOutcome::NoPatch
    );
    assert!(sleeper.slept().is_empty());
}

#[test]
fn timeout_without_patch_is_timed_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(framework_with_source().with_pov("crash-1", b"A"));
    let agent = ScriptedAgent::new(AgentExit::TimedOut);
    let sleeper = RecordingSleeper::default();

    let (result, _, _) = run_with(&config, &framework, &agent, &sleeper);
    let session = result.expect("run").session.expect("session");
    assert_eq!(session.outcome, SessionOutcome::TimedOut);
}

#[test]
fn patches_present_before_the_session_are_not_counted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    fs::create_dir_all(&config.patches_dir).expect("mkdir");
    fs::write(config.patches_dir.join("old.diff"), "old").expect("write");
    let framework = Arc::new(framework_with_source().with_pov("crash-1", b"A"));
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, _, _) = run_with(&config, &framework, &agent, &sleeper);
    let session = result.expect("run").session.expect("session");
    assert_eq!(session.outcome, SessionOutcome::NoPatch);
    assert!(session.patches.is_empty());
}

#[test]
fn rewritten_patch_counts_and_waits_for_flush() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    fs::create_dir_all(&config.patches_dir).expect("mkdir");
    fs::write(config.patches_dir.join("fix.diff"), "stale attempt").expect("write");
    let framework = Arc::new(framework_with_source().with_pov("crash-1", b"A"));
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0))).writing_patch("fix.diff", REF_DIFF);
    let sleeper = RecordingSleeper::default();

    let (result, _, _) = run_with(&config, &framework, &agent, &sleeper);
    let session = result.expect("run").session.expect("session");

    assert_eq!(session.outcome, SessionOutcome::PatchProduced);
    assert_eq!(session.patches, vec![config.patches_dir.join("fix.diff")]);
    assert_eq!(sleeper.slept(), vec![Duration::from_secs(5)]);
}

#[test]
fn reference_diff_reaches_the_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(
        framework_with_source()
            .with_pov("crash-1", b"A")
            .with_diff("ref.diff", REF_DIFF),
    );
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, _, _) = run_with(&config, &framework, &agent, &sleeper);
    result.expect("run");

    let sessions = agent.sessions();
    let diff = sessions[0].reference_diff.as_ref().expect("reference diff");
    assert_eq!(diff.changed_files, vec!["main.c"]);
}

#[test]
fn failed_diff_fetch_degrades_to_full_mode() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(
        framework_with_source()
            .with_pov("crash-1", b"A")
            .with_failing_diff_fetch(),
    );
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, phase, _) = run_with(&config, &framework, &agent, &sleeper);
    result.expect("run");
    assert_eq!(phase, Phase::Done);
    assert!(agent.sessions()[0].reference_diff.is_none());
}

#[test]
fn failed_shared_dir_registration_falls_back_to_local_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let shared = temp.path().join("home/.copilot");
    fs::create_dir_all(shared.parent().expect("parent")).expect("mkdir");
    fs::write(&shared, "stale file").expect("write");
    let framework = Arc::new(
        framework_with_source()
            .with_pov("crash-1", b"A")
            .with_failing_shared_dirs(),
    );
    let agent =
        ScriptedAgent::new(AgentExit::Exited(Some(0))).sharing(shared.clone(), "copilot-home");
    let sleeper = RecordingSleeper::default();

    let (result, phase, _) = run_with(&config, &framework, &agent, &sleeper);
    result.expect("run");
    assert_eq!(phase, Phase::Done);
    assert!(shared.is_dir());
    assert!(
        framework
            .calls()
            .contains(&"register_shared_dir:copilot-home".to_string())
    );
}

#[test]
fn unresolvable_builder_is_fatal_before_the_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(
        framework_with_source()
            .with_pov("crash-1", b"A")
            .without_service(),
    );
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, phase, _) = run_with(&config, &framework, &agent, &sleeper);
    let err = result.expect_err("missing builder");
    assert!(format!("{err:#}").contains("inc-builder-asan"));
    assert_eq!(phase, Phase::Fatal);
    assert!(agent.sessions().is_empty());
    assert!(framework.pov_runs().is_empty());
}

#[test]
fn missing_project_dir_is_workspace_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(FakeFramework::default().with_pov("crash-1", b"A"));
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, phase, _) = run_with(&config, &framework, &agent, &sleeper);
    let err = result.expect_err("no source tree");
    assert!(
        err.chain()
            .any(|cause| cause.downcast_ref::<WorkspaceNotFound>().is_some())
    );
    assert_eq!(phase, Phase::Fatal);
    assert_eq!(agent.setup_count(), 0);
}

#[test]
fn agent_setup_failure_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(framework_with_source().with_pov("crash-1", b"A"));
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0))).failing_setup();
    let sleeper = RecordingSleeper::default();

    let (result, phase, _) = run_with(&config, &framework, &agent, &sleeper);
    assert!(result.is_err());
    assert_eq!(phase, Phase::Fatal);
    assert!(agent.sessions().is_empty());
}

#[test]
fn reproduction_errors_become_report_text() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(
        framework_with_source()
            .with_pov("crash-1", b"A")
            .with_pov_script(PovScript::fail("builder went away")),
    );
    let agent = ScriptedAgent::new(AgentExit::Exited(Some(0)));
    let sleeper = RecordingSleeper::default();

    let (result, phase, _) = run_with(&config, &framework, &agent, &sleeper);
    result.expect("run");
    assert_eq!(phase, Phase::Done);
    let reports = &agent.sessions()[0].reports;
    assert!(reports[0].text.starts_with("Error reproducing crash: "));
    assert!(reports[0].text.contains("builder went away"));
}

#[cfg(unix)]
#[test]
fn command_agent_runs_in_the_workspace_and_produces_a_patch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config(temp.path());
    let framework = Arc::new(
        framework_with_source()
            .with_pov("crash-1", b"A")
            .with_pov_script(PovScript::crash(1, ASAN_STDERR)),
    );
    let workspace = workspace_for(&config, &framework);
    let agent = CommandAgent::new(
        "test -f AGENTS.md && test -f \"$PATCHER_SESSION_DIR/crash_log_0.txt\" \
         && echo 'x' > scratch.txt \
         && printf 'patch' > \"$PATCHER_PATCHES_DIR/fix.diff\"",
        AgentSupervisor::new(Some(Duration::from_secs(30)), Duration::from_millis(200)),
    );
    let sleeper = RecordingSleeper::default();

    let mut controller =
        Controller::new(&config, Arc::clone(&framework), &workspace, &agent, &sleeper);
    let summary = controller.run().expect("run");

    let session = summary.session.expect("session");
    assert_eq!(session.exit, AgentExit::Exited(Some(0)));
    assert_eq!(session.outcome, SessionOutcome::PatchProduced);

    let root = config.source_dir().join("repo");
    assert!(root.join(INSTRUCTIONS_FILE).exists());
    assert!(!root.join("scratch.txt").exists());
    let git = Git::new(&root, GIT_TIMEOUT);
    assert!(git.status_porcelain().expect("status").is_empty());
    let crash_log =
        fs::read_to_string(config.session_dir().join("crash_log_0.txt")).expect("crash log");
    assert!(crash_log.contains("AddressSanitizer"));
}
