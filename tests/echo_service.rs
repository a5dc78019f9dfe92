#![cfg(unix)]

mod support;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stackhut::backend::{LogLine, LogStream, NullSink, RunStatus};
use stackhut::orchestrator::{Phase, TerminalState};
use stackhut::{CancellationToken, ContentStore, HutError, InvocationArgs, Orchestrator, Outcome, Registry};
use support::EchoProject;

fn registry() -> Registry {
    Registry::standard(BTreeMap::new(), "default".into())
}

fn build_stack(orchestrator: &Orchestrator<'_>, project: &EchoProject) {
    let report = orchestrator.invoke(
        "build-stack",
        &InvocationArgs::new(project.stack_manifest()),
        &mut NullSink,
    );
    assert_eq!(report.exit_code(), 0, "{:?}", report.result);
}

#[test]
fn echo_service_builds_and_runs_locally() {
    let project = EchoProject::new();
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());
    build_stack(&orchestrator, &project);

    let mut args = InvocationArgs::new(project.hut_manifest());
    args.env.insert("GREETING".into(), "stackhut".into());
    let streamed = Arc::new(Mutex::new(Vec::new()));
    let mut sink = {
        let streamed = Arc::clone(&streamed);
        move |line: &LogLine| streamed.lock().unwrap().push(line.clone())
    };

    let report = orchestrator.invoke("run-local", &args, &mut sink);
    assert_eq!(
        report.invocation.phases(),
        [
            Phase::Pending,
            Phase::Building,
            Phase::Running,
            Phase::Terminal(TerminalState::Success)
        ]
    );
    assert_eq!(report.exit_code(), 0);

    let Ok(Outcome::Ran(result)) = report.result else {
        panic!("expected a run outcome");
    };
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.exit_code, Some(0));
    let retained: Vec<LogLine> = result.logs.collect();
    assert!(
        retained
            .iter()
            .any(|line| line.stream == LogStream::Stdout && line.line == "hello stackhut")
    );
    assert!(
        retained
            .iter()
            .any(|line| line.stream == LogStream::Stderr && line.line == "to stderr")
    );
    assert_eq!(streamed.lock().unwrap().len(), retained.len());
}

#[test]
fn log_sequence_ends_with_the_final_line() {
    let project = EchoProject::with_script("#!/bin/sh\necho \"hello $GREETING\"\necho working\necho bye\n");
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());
    build_stack(&orchestrator, &project);

    let mut args = InvocationArgs::new(project.hut_manifest());
    args.env.insert("GREETING".into(), "stackhut".into());
    let report = orchestrator.invoke("run-local", &args, &mut NullSink);
    let Ok(Outcome::Ran(result)) = report.result else {
        panic!("expected a run outcome");
    };
    let lines: Vec<String> = result.logs.map(|line| line.line).collect();
    assert_eq!(lines, ["hello stackhut", "working", "bye"]);
}

#[test]
fn entrypoint_may_use_shell_syntax() {
    let project = EchoProject::new();
    project.write(
        support::HUT_MANIFEST,
        "serviceName: echo\nstack: base@1\nbuild:\n  - copy: ./src bin\n  - exec: chmod +x bin/echo.sh\nrun: cd bin && ./echo.sh\n",
    );
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());
    build_stack(&orchestrator, &project);

    let report = orchestrator.invoke("run-local", &InvocationArgs::new(project.hut_manifest()), &mut NullSink);
    assert_eq!(report.terminal(), TerminalState::Success, "{:?}", report.result);
    let Ok(Outcome::Ran(mut result)) = report.result else {
        panic!("expected a run outcome");
    };
    assert!(result.logs.any(|line| line.line == "hello world"));
}

#[test]
fn second_run_skips_the_build_phase() {
    let project = EchoProject::new();
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());
    build_stack(&orchestrator, &project);

    let args = InvocationArgs::new(project.hut_manifest());
    let first = orchestrator.invoke("run-local", &args, &mut NullSink);
    assert_eq!(first.exit_code(), 0);
    let second = orchestrator.invoke("run-local", &args, &mut NullSink);
    assert_eq!(
        second.invocation.phases(),
        [
            Phase::Pending,
            Phase::Running,
            Phase::Terminal(TerminalState::Success)
        ]
    );
}

#[test]
fn failing_service_reports_failed() {
    let project = EchoProject::with_script("#!/bin/sh\necho dying\nexit 3\n");
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());
    build_stack(&orchestrator, &project);

    let report = orchestrator.invoke("run-local", &InvocationArgs::new(project.hut_manifest()), &mut NullSink);
    assert_eq!(report.terminal(), TerminalState::Failed);
    assert_eq!(report.exit_code(), 1);
    let Ok(Outcome::Ran(result)) = report.result else {
        panic!("expected a run outcome");
    };
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.exit_code, Some(3));
}

#[test]
fn run_without_stack_fails_before_building() {
    let project = EchoProject::new();
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());

    let report = orchestrator.invoke("run-local", &InvocationArgs::new(project.hut_manifest()), &mut NullSink);
    assert_eq!(
        report.invocation.phases(),
        [Phase::Pending, Phase::Terminal(TerminalState::Failed)]
    );
    assert!(matches!(report.result, Err(HutError::MissingDependency { .. })));
    assert!(store.list().unwrap().is_empty());
    assert!(support::tmp_is_empty(&project.store_dir()));
}

#[test]
fn broken_step_goes_straight_to_failed() {
    let project = EchoProject::new();
    project.write(
        support::HUT_MANIFEST,
        "serviceName: echo\nstack: base@1\nbuild:\n  - copy: ./src bin\n  - exec: exit 4\nrun: echo.sh\n",
    );
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());
    build_stack(&orchestrator, &project);

    let report = orchestrator.invoke("run-local", &InvocationArgs::new(project.hut_manifest()), &mut NullSink);
    assert_eq!(
        report.invocation.phases(),
        [
            Phase::Pending,
            Phase::Building,
            Phase::Terminal(TerminalState::Failed)
        ]
    );
    assert!(matches!(
        report.result,
        Err(HutError::BuildStep {
            index: 1,
            exit_code: Some(4),
            ..
        })
    ));
    assert_eq!(store.list().unwrap().len(), 1, "only the stack is published");
}

#[test]
fn cancellation_stops_the_process_promptly() {
    let project = EchoProject::with_script("#!/bin/sh\necho started\nsleep 30\n");
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(&registry, &store, cancel.clone());
    build_stack(&orchestrator, &project);

    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });

    let started = Instant::now();
    let report = orchestrator.invoke("run-local", &InvocationArgs::new(project.hut_manifest()), &mut NullSink);
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert_eq!(report.terminal(), TerminalState::Cancelled);
    assert_eq!(report.exit_code(), 130);
    let Ok(Outcome::Ran(result)) = report.result else {
        panic!("expected a run outcome");
    };
    assert_eq!(result.exit_code, None);
}

#[cfg(target_os = "linux")]
#[test]
fn cancellation_stops_every_process_the_service_started() {
    let project = EchoProject::with_script(
        "#!/bin/sh\nsleep 30 &\necho $! > \"$PID_FILE\"\necho started\nsleep 30\necho done\n",
    );
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(&registry, &store, cancel.clone());
    build_stack(&orchestrator, &project);

    let pid_file = project.dir.path().join("background.pid");
    let mut args = InvocationArgs::new(project.hut_manifest());
    args.env
        .insert("PID_FILE".into(), pid_file.display().to_string());
    let mut sink = move |line: &LogLine| {
        if line.line == "started" {
            cancel.cancel();
        }
    };

    let started = Instant::now();
    let report = orchestrator.invoke("run-local", &args, &mut sink);
    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert_eq!(report.terminal(), TerminalState::Cancelled);
    let Ok(Outcome::Ran(mut result)) = report.result else {
        panic!("expected a run outcome");
    };
    assert!(result.logs.all(|line| line.line != "done"));

    let background: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(support::process_exits(background), "pid {background} survived");
}

#[test]
fn cancelled_build_reports_cancelled() {
    let project = EchoProject::new();
    project.write(
        support::STACK_MANIFEST,
        "serviceName: base\nstack: base@1\nbuild:\n  - exec: trap '' INT TERM; sleep 30\nrun: sh\n",
    );
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(&registry, &store, cancel.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
    });
    let report = orchestrator.invoke(
        "build-stack",
        &InvocationArgs::new(project.stack_manifest()),
        &mut NullSink,
    );
    canceller.join().unwrap();

    assert_eq!(
        report.invocation.phases(),
        [
            Phase::Pending,
            Phase::Building,
            Phase::Terminal(TerminalState::Cancelled)
        ]
    );
    assert_eq!(report.exit_code(), 130);
    assert!(store.list().unwrap().is_empty());
    assert!(support::tmp_is_empty(&project.store_dir()));
}

#[test]
fn timeout_cancels_the_run() {
    let project = EchoProject::with_script("#!/bin/sh\nexec sleep 30\n");
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());
    build_stack(&orchestrator, &project);

    let mut args = InvocationArgs::new(project.hut_manifest());
    args.timeout = Some(Duration::from_millis(200));
    let started = Instant::now();
    let report = orchestrator.invoke("run-local", &args, &mut NullSink);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.terminal(), TerminalState::Cancelled);
}

#[test]
fn unknown_commands_are_rejected() {
    let project = EchoProject::new();
    let store = ContentStore::open(project.store_dir()).unwrap();
    let registry = registry();
    let orchestrator = Orchestrator::new(&registry, &store, CancellationToken::new());

    let report = orchestrator.invoke("deploy", &InvocationArgs::default(), &mut NullSink);
    assert_eq!(report.exit_code(), 127);
    assert!(matches!(report.result, Err(HutError::UnknownCommand { .. })));
}
