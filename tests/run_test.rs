mod common;

use common::{load_cluster, load_config, MockShell};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use wke::core::collector::LOADS_FILE;
use wke::core::measurement::{CURRENT_MEASUREMENT, LAST_MEASUREMENT, RESULT_FILE};
use wke::{
    parse_selector, Cluster, MeasurementSession, OptionMap, OptionValue, PreludeChoice, RunOptions,
    Runner, Selector, WkeError,
};

fn options(pairs: &[(&str, &str)]) -> OptionMap {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), OptionValue::from(*value)))
        .collect()
}

async fn wait_for_invocations(shell: &MockShell, count: usize) {
    for _ in 0..200 {
        if shell.invocations().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} invocations, got {:?}", count, shell.invocations());
}

#[tokio::test]
async fn test_run_on_all_machines() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());

    let selection = parse_selector("all", &cluster).unwrap();
    let success = runner
        .run(&selection, &config, "install-tokio", None, &RunOptions::default())
        .await
        .unwrap();

    assert!(success);
    assert_eq!(
        shell.hosts(),
        vec!["203.0.113.1", "203.0.113.2", "203.0.113.3", "203.0.113.4"]
    );

    for invocation in shell.invocations() {
        assert_eq!(invocation.username, "testuser");
        // Working directory first, then the default prelude, then the script
        assert!(invocation
            .command
            .starts_with("cd /home/testuser && export PATH=${PATH}:${HOME}/.local/bin:/usr/local/bin && "));
        assert!(invocation.command.contains("Just a test script"));
        assert!(invocation.command.ends_with(" install-tokio"));
    }
}

#[tokio::test]
async fn test_run_with_options() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());

    let selection = parse_selector("node2", &cluster).unwrap();
    let success = assert_ok!(
        runner
            .run(
                &selection,
                &config,
                "setup-rust",
                Some(&options(&[("channel", "nightly")])),
                &RunOptions::default(),
            )
            .await
    );

    assert!(success);
    let invocations = shell.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].host, "203.0.113.2");
    assert!(invocations[0].command.ends_with(" setup-rust nightly minimal"));
}

#[tokio::test]
async fn test_python_target_and_typed_option() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());

    let selection = parse_selector("[0]", &cluster).unwrap();
    runner
        .check_run(
            &selection,
            &config,
            "benchmark-tokio",
            Some(&options(&[("num-operations", "500")])),
            &RunOptions::default().with_prelude(PreludeChoice::None),
        )
        .await
        .unwrap();

    let command = &shell.invocations()[0].command;
    assert!(command.starts_with("cd /home/testuser && python3 -c "));
    assert!(command.ends_with(" 500"));
    assert!(!command.contains("export PATH"));
}

#[tokio::test]
async fn test_invalid_requests_are_errors() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("all", &cluster).unwrap();
    let run_options = RunOptions::default();

    let invalid_choice = options(&[("channel", "cbs")]);
    let err = runner
        .run(&selection, &config, "setup-rust", Some(&invalid_choice), &run_options)
        .await
        .unwrap_err();
    assert!(matches!(err, WkeError::InvalidArgument { .. }));
    assert!(err.to_string().contains("allowed choices are stable,nightly"));

    let unknown = options(&[("flavor", "sweet")]);
    let err = runner
        .run(&selection, &config, "setup-rust", Some(&unknown), &run_options)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Got unexpected option \"flavor\""));

    let not_a_number = options(&[("num-operations", "many")]);
    assert_err!(
        runner
            .run(&selection, &config, "benchmark-tokio", Some(&not_a_number), &run_options)
            .await
    );

    let err = runner
        .run(&selection, &config, "setup-golang", None, &run_options)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("\"important\""));

    assert!(runner
        .run(&selection, &config, "no-such-target", None, &run_options)
        .await
        .is_err());

    assert!(runner
        .run(
            &selection,
            &config,
            "install-tokio",
            None,
            &RunOptions::default().with_prelude(PreludeChoice::Named("missing".to_string()))
        )
        .await
        .is_err());

    assert!(runner
        .run(&selection, &config, "install-tokio", None, &RunOptions::default().with_multiply(0))
        .await
        .is_err());

    assert!(shell.invocations().is_empty());
}

#[tokio::test]
async fn test_dry_run_connects_nowhere() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("all", &cluster).unwrap();
    let dry_run = RunOptions::default().with_dry_run(true);

    // setup-golang has no script, but a dry run never gets that far
    let success = runner
        .run(
            &selection,
            &config,
            "setup-golang",
            Some(&options(&[("important", "yes")])),
            &dry_run,
        )
        .await
        .unwrap();
    assert!(success);

    assert!(runner
        .run(&selection, &config, "install-packages", None, &dry_run)
        .await
        .unwrap());

    assert!(shell.invocations().is_empty());
}

#[tokio::test]
async fn test_missing_script_fails_before_connecting() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("all", &cluster).unwrap();

    let err = runner
        .check_run(
            &selection,
            &config,
            "setup-golang",
            Some(&options(&[("important", "yes")])),
            &RunOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no valid script exists"));
    assert!(shell.invocations().is_empty());
}

#[test]
fn test_multiply_assigns_group_indices() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let runner = Runner::new(MockShell::new());
    let selection = parse_selector("[1:3]", &cluster).unwrap();

    let plan = runner
        .prepare(
            &selection,
            &config,
            "install-tokio",
            None,
            &RunOptions::default().with_multiply(2).with_workdir("/tmp/bench"),
        )
        .unwrap()
        .unwrap();

    assert_eq!(plan.target(), "install-tokio");
    let tasks = plan.tasks();
    let machines: Vec<&str> = tasks.iter().map(|t| t.machine.name.as_str()).collect();
    let indices: Vec<usize> = tasks.iter().map(|t| t.group_index).collect();

    let log_names: Vec<&str> = tasks.iter().map(|t| t.log_name.as_str()).collect();

    assert_eq!(machines, vec!["node2", "node2", "node3", "node3"]);
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(log_names, vec!["node2-0", "node2-1", "node3-0", "node3-1"]);
    assert!(tasks.iter().all(|t| t.group_size == 4));
    assert!(tasks.iter().all(|t| t.command.starts_with("cd /tmp/bench && ")));
}

#[tokio::test]
async fn test_multiply_writes_one_log_per_task() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(MockShell::new());
    let selection = parse_selector("node1", &cluster).unwrap();

    let run_options = RunOptions::default()
        .with_multiply(2)
        .with_log_dir(dir.path());
    assert!(runner
        .run(&selection, &config, "install-tokio", None, &run_options)
        .await
        .unwrap());

    for name in ["node1-0", "node1-1"] {
        let out = fs::read_to_string(dir.path().join(format!("{}.out", name))).unwrap();
        assert_eq!(out, "ran on 203.0.113.1\n");
    }
    assert!(!dir.path().join("node1.out").exists());
}

#[tokio::test]
async fn test_failing_machine() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::failing_on("203.0.113.2");
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("all", &cluster).unwrap();

    let success = runner
        .run(&selection, &config, "install-tokio", None, &RunOptions::default())
        .await
        .unwrap();
    assert!(!success);

    let err = runner
        .check_run(&selection, &config, "install-tokio", None, &RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.machine_errors(),
        &["Machine node2 had non-zero exitcode 1".to_string()]
    );
}

#[tokio::test]
async fn test_unreachable_machine() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let runner = Runner::new(MockShell::unreachable("203.0.113.4"));
    let selection = parse_selector("[3]", &cluster).unwrap();

    let err = runner
        .check_run(&selection, &config, "install-tokio", None, &RunOptions::default())
        .await
        .unwrap_err();
    match err {
        WkeError::RemoteExecutionError { machine, command, message } => {
            assert_eq!(machine, "node4");
            assert_eq!(command, "install-tokio");
            assert!(message.contains("Connection refused"));
        }
        other => panic!("unexpected error: {}", other),
    }

    let quiet = RunOptions::default().with_quiet_fail(true);
    assert!(!runner
        .run(&selection, &config, "install-tokio", None, &quiet)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_timeout_stops_machines() {
    let cluster = load_cluster();
    let config = load_config("local");
    let runner = Runner::new(MockShell::new());
    let selection = parse_selector("[0:2]", &cluster).unwrap();

    let run_options = RunOptions::default().with_timeout(Duration::from_millis(100));
    let err = runner
        .check_run(&selection, &config, "run-forever", None, &run_options)
        .await
        .unwrap_err();
    assert!(matches!(err, WkeError::TimeoutError { .. }));

    assert!(!runner
        .run(&selection, &config, "run-forever", None, &run_options)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_timeout_while_host_never_answers() {
    // accepts TCP connections but never sends an SSH banner
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut connections = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            connections.push(stream);
        }
    });

    let cluster = Cluster::from_toml_str(&format!(
        "[cluster]\nusername = \"testuser\"\nssh-port = {}\n\n[[machines]]\nname = \"silent\"\nexternal-addr = \"127.0.0.1\"\n",
        port
    ))
    .unwrap();
    let config = load_config("local");
    let run_options = RunOptions::default()
        .with_timeout(Duration::from_millis(300))
        .with_handle_signals(false);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        Runner::ssh().check_run(&cluster, &config, "create-dir", None, &run_options),
    )
    .await
    .expect("run kept waiting for the silent host");
    assert!(matches!(result, Err(WkeError::TimeoutError { .. })));
}

#[tokio::test]
async fn test_open_remote_returns_exact_contents() {
    let cluster = load_cluster();
    let path = "/tmp/result.txt";
    let mut shell = MockShell::default();
    shell.add_file("203.0.113.1", path, "first\r\nsecond");
    shell.add_file("203.0.113.2", path, "progress\rdone\n");
    shell.add_file("203.0.113.3", path, "");
    shell.add_file("203.0.113.4", path, "x\n\n");

    let contents = cluster.create_slice().open_remote(&shell, path).await.unwrap();
    assert_eq!(contents, vec!["first\r\nsecond", "progress\rdone\n", "", "x\n\n"]);

    let set = cluster.get_machines_by_indices(&[3, 1]).unwrap();
    let contents = set.open_remote(&shell, path).await.unwrap();
    assert_eq!(contents, vec!["x\n\n", "progress\rdone\n"]);

    assert_err!(set.open_remote(&shell, "/tmp/missing.txt").await);
}

#[tokio::test]
async fn test_background_run_stop() {
    let cluster = load_cluster();
    let config = load_config("local");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("[0,1]", &cluster).unwrap();

    let handle = runner
        .background_run(&selection, &config, "run-forever", None, &RunOptions::default())
        .unwrap();
    wait_for_invocations(&shell, 2).await;
    assert!(!handle.is_finished());

    handle.stop();
    assert!(!handle.join().await.unwrap());
}

#[tokio::test]
async fn test_background_run_kill() {
    let cluster = load_cluster();
    let config = load_config("local");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("node1", &cluster).unwrap();

    let handle = runner
        .background_run(&selection, &config, "run-forever", None, &RunOptions::default())
        .unwrap();
    wait_for_invocations(&shell, 1).await;

    handle.kill();
    assert!(!handle.join().await.unwrap());
}

#[tokio::test]
async fn test_background_run_finishes() {
    let cluster = load_cluster();
    let config = load_config("local");
    let runner = Runner::new(MockShell::new());
    let selection = parse_selector("all", &cluster).unwrap();

    let handle = runner
        .background_run(&selection, &config, "create-dir", None, &RunOptions::default())
        .unwrap();
    assert!(handle.join().await.unwrap());
}

#[tokio::test]
async fn test_install_packages() {
    let cluster = load_cluster();
    let config = load_config("inherit");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("[0:2]", &cluster).unwrap();

    assert!(runner
        .run(&selection, &config, "install-packages", None, &RunOptions::default())
        .await
        .unwrap());

    let invocations = shell.invocations();
    assert_eq!(invocations.len(), 2);
    for invocation in &invocations {
        assert_eq!(invocation.username, "testuser");
        assert_eq!(
            invocation.command,
            "bash -c 'sudo apt-get update && sudo apt-get install -y htop nload'"
        );
    }
}

#[tokio::test]
async fn test_install_packages_as_root() {
    let cluster = load_cluster();
    let config = load_config("basic");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("node1", &cluster).unwrap();

    runner
        .install_packages(&selection, &config, false, false, false)
        .await
        .unwrap();

    let invocations = shell.invocations();
    assert_eq!(invocations[0].username, "root");
    assert_eq!(
        invocations[0].command,
        "bash -c 'apt-get update && apt-get install -y htop nload'"
    );
}

#[tokio::test]
async fn test_install_packages_without_packages() {
    let cluster = load_cluster();
    let config = load_config("local");
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());

    runner
        .install_packages(&cluster, &config, true, false, false)
        .await
        .unwrap();
    assert!(shell.invocations().is_empty());
}

#[tokio::test]
async fn test_cleanup() {
    let cluster = load_cluster();
    let shell = MockShell::new();
    let runner = Runner::new(shell.clone());
    let selection = parse_selector("[2:4]", &cluster).unwrap();

    assert!(runner.cleanup(&selection, true).await.unwrap());

    assert_eq!(shell.hosts(), vec!["203.0.113.3", "203.0.113.4"]);
    for invocation in shell.invocations() {
        assert_eq!(invocation.username, "root");
        assert_eq!(invocation.command, "bash -c 'rm -rf /home/testuser/*'");
    }
}

#[tokio::test]
async fn test_measurement_session() {
    let root = TempDir::new().unwrap();
    let shell = MockShell::new();
    let session = MeasurementSession::new(
        root.path(),
        load_cluster(),
        load_config("basic"),
        Runner::new(shell.clone()),
        Some("node1".to_string()),
        false,
    )
    .unwrap();

    assert!(session.log_dir().is_dir());
    assert!(root.path().join(CURRENT_MEASUREMENT).exists());

    let selection = parse_selector("all", session.cluster()).unwrap();
    assert!(session
        .run(&selection, "install-tokio", None, RunOptions::default())
        .await
        .unwrap());

    let ops = options(&[("num-operations", "2000")]);
    let result = session
        .measure(&selection, "benchmark-tokio", 2000, Some(&ops), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.target(), "benchmark-tokio");
    assert_eq!(result.num_operations(), 2000);
    assert!(result.end_time() >= result.start_time());

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(session.log_dir().join(RESULT_FILE)).unwrap())
            .unwrap();
    assert_eq!(json["target"], "benchmark-tokio");
    assert_eq!(json["options"]["num-operations"], "2000");

    // Load samples were taken from the collecting machine
    assert!(session.log_dir().join(LOADS_FILE).is_file());
    assert!(shell
        .invocations()
        .iter()
        .any(|i| i.host == "203.0.113.1" && i.command == "cat /proc/loadavg"));

    // Every machine got its own log files
    for name in selection.machine_names() {
        assert!(session.log_dir().join(format!("{}.out", name)).is_file());
    }

    assert!(root.path().join(LAST_MEASUREMENT).exists());
    assert!(!root.path().join(CURRENT_MEASUREMENT).exists());
}

#[tokio::test]
async fn test_failed_measurement() {
    let root = TempDir::new().unwrap();
    let session = MeasurementSession::new(
        root.path(),
        load_cluster(),
        load_config("basic"),
        Runner::new(MockShell::failing_on("203.0.113.3")),
        None,
        false,
    )
    .unwrap();

    let selection = parse_selector("all", session.cluster()).unwrap();
    let err = session
        .measure(&selection, "benchmark-tokio", 10, None, RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, WkeError::MeasurementFailed { .. }));
    assert!(err.to_string().starts_with("Measurement failed: "));
    assert!(!session.log_dir().join(RESULT_FILE).exists());
    assert!(!root.path().join(LAST_MEASUREMENT).exists());
}

#[tokio::test]
async fn test_measurement_with_background_server() {
    let root = TempDir::new().unwrap();
    let shell = MockShell::new();
    let session = MeasurementSession::new(
        root.path(),
        load_cluster(),
        load_config("local"),
        Runner::new(shell.clone()),
        None,
        false,
    )
    .unwrap();

    let server = parse_selector("node1", session.cluster()).unwrap();
    let clients = parse_selector("[1:4]", session.cluster()).unwrap();

    session
        .background_run(&server, "run-forever", None, RunOptions::default())
        .unwrap();
    assert_eq!(session.num_background_tasks(), 1);
    wait_for_invocations(&shell, 1).await;

    let result = session
        .measure(&clients, "create-file", 3, None, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(result.num_operations(), 3);

    session.stop_background_tasks().await.unwrap();
    assert_eq!(session.num_background_tasks(), 0);
}
