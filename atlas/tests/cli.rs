//! CLI tests for the `atlas` binary.
//!
//! Spawns the binary against a temporary data directory and verifies output
//! and exit codes.

use std::process::{Command, Output};

use atlas::exit_codes;
use atlas::io::config::{AtlasConfig, load_config};
use atlas::io::paths::AtlasPaths;
use atlas::io::run_store::{CreateRunOptions, RunStore};

fn atlas(data_dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_atlas"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .output()
        .expect("atlas binary")
}

fn options(goal: &str) -> CreateRunOptions {
    CreateRunOptions {
        name: None,
        goal: goal.to_string(),
        start_url: "https://shop.test/".to_string(),
        mode: "atlas".to_string(),
        env: "local".to_string(),
        beam_size: 3,
        max_steps: 5,
    }
}

#[tokio::test]
async fn runs_list_show_and_rename() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = AtlasPaths::new(temp.path());
    let store = RunStore::new(&paths.runs_dir);
    let run = store.create_run(options("buy socks")).await.expect("create");

    let list = atlas(temp.path(), &["runs", "list"]);
    assert_eq!(list.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&list.stdout);
    assert!(stdout.contains(&run.id));
    assert!(stdout.contains("running"));

    let show = atlas(temp.path(), &["runs", "show", &run.id]);
    assert_eq!(show.status.code(), Some(exit_codes::OK));
    let shown: serde_json::Value = serde_json::from_slice(&show.stdout).expect("json");
    assert_eq!(shown["goal"], "buy socks");

    let rename = atlas(temp.path(), &["runs", "rename", &run.id, "Socks"]);
    assert_eq!(rename.status.code(), Some(exit_codes::OK));
    let renamed = store.get_run(&run.id).await.expect("get").expect("exists");
    assert_eq!(renamed.name, "Socks");
}

#[test]
fn missing_run_exits_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let show = atlas(temp.path(), &["runs", "show", "nope"]);
    assert_eq!(show.status.code(), Some(exit_codes::NOT_FOUND));

    let host = atlas(temp.path(), &["knowledge", "show", "shop.test"]);
    assert_eq!(host.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn invalid_run_id_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let show = atlas(temp.path(), &["runs", "show", "../escape"]);
    assert_eq!(show.status.code(), Some(exit_codes::INVALID));
}

#[tokio::test]
async fn config_init_writes_defaults_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = AtlasPaths::new(temp.path());

    let init = atlas(temp.path(), &["config", "init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    let loaded = load_config(&paths.config_path).await.expect("load");
    assert_eq!(loaded, AtlasConfig::default());

    std::fs::write(&paths.config_path, "max_steps = 9\n").expect("edit");
    let again = atlas(temp.path(), &["config", "init"]);
    assert_eq!(again.status.code(), Some(exit_codes::OK));
    let kept = load_config(&paths.config_path).await.expect("load");
    assert_eq!(kept.max_steps, 9);
}
