// Needs the docker-test container listening on port 2222 with the current
// user's key authorized for `testuser`. Run with `cargo test -- --ignored`.

mod common;

use common::configs_dir;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use wke::{Cluster, RunOptions, Runner, SshShell};

fn local_cluster() -> Cluster {
    Cluster::from_file(configs_dir().join("local-cluster.toml")).unwrap()
}

#[tokio::test]
#[ignore]
async fn test_copy_and_read_file() {
    let cluster = local_cluster();
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("copied.txt");
    fs::write(&source, "copied by wke\n").unwrap();

    cluster
        .copy_to("localhost", &source, "/tmp/copied.txt")
        .await
        .unwrap();

    let contents = cluster
        .create_slice()
        .open_remote(&SshShell::new(), "/tmp/copied.txt")
        .await
        .unwrap();
    assert_eq!(contents, vec!["copied by wke\n".to_string()]);
}

#[tokio::test]
#[ignore]
async fn test_run_targets() {
    let cluster = local_cluster();
    let config = common::load_config("local");
    let runner = Runner::ssh();
    let run_options = RunOptions::default().with_prelude(wke::PreludeChoice::None);

    for target in ["create-dir", "create-file"] {
        assert!(runner
            .run(&cluster, &config, target, None, &run_options)
            .await
            .unwrap());
    }

    let contents = cluster
        .create_slice()
        .open_remote(runner.shell().as_ref(), "/tmp/test-dir/testfile.txt")
        .await
        .unwrap();
    assert_eq!(contents, vec!["hello wke!\n".to_string()]);
}

#[tokio::test]
#[ignore]
async fn test_stop_background_run() {
    let cluster = local_cluster();
    let config = common::load_config("local");
    let runner = Runner::ssh();

    let handle = runner
        .background_run(&cluster, &config, "run-forever", None, &RunOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!handle.is_finished());

    handle.stop();
    assert!(!handle.join().await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_timeout() {
    let cluster = local_cluster();
    let config = common::load_config("local");
    let run_options = RunOptions::default().with_timeout(Duration::from_secs(1));

    let success = Runner::ssh()
        .run(&cluster, &config, "run-forever", None, &run_options)
        .await
        .unwrap();
    assert!(!success);
}
