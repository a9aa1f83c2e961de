//! End-to-end tests for the marginalia binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CORPUS: &str = "\
### User: Write a study note about: Gravity
### Assistant: Gravity pulls masses together.
### User: Write a study note about: Photosynthesis
### Assistant: Plants turn light into sugar.
";

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let adapters = dir.path().join("adapters");
        let config = format!("[engine.adapters]\nroot_dir = {:?}\n", adapters.display().to_string());
        std::fs::write(dir.path().join("config.toml"), config).unwrap();
        std::fs::write(dir.path().join("corpus.txt"), CORPUS).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("marginalia").unwrap();
        cmd.arg("--config").arg(self.path("config.toml")).arg("--quiet");
        cmd
    }

    fn init_model(&self) -> PathBuf {
        let model = self.path("model");
        self.cmd()
            .args(["init-model", "--hidden", "16", "--epochs", "5", "--corpus"])
            .arg(self.path("corpus.txt"))
            .arg("--out")
            .arg(&model)
            .assert()
            .success();
        model
    }
}

fn write_examples(path: &Path) {
    std::fs::write(
        path,
        "{\"input\":\"Gravity\",\"output\":\"Gravity pulls masses together.\",\"label\":\"like\"}\n",
    )
    .unwrap();
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("marginalia")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init-model"))
        .stdout(predicate::str::contains("regenerate"))
        .stdout(predicate::str::contains("adapters"));
}

#[test]
fn test_init_model_writes_model_directory() {
    let ws = Workspace::new();
    let model = ws.init_model();

    assert!(model.join("config.json").exists());
    assert!(model.join("weights.bin").exists());
    assert!(model.join("tokenizer.json").exists());
}

#[test]
fn test_generate_reports_json() {
    let ws = Workspace::new();
    let model = ws.init_model();

    ws.cmd()
        .args(["--json", "generate", "--content", "Gravity", "--max-tokens", "8", "--seed", "1", "--model"])
        .arg(&model)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"finish_reason\""));
}

#[test]
fn test_generate_requires_content() {
    let ws = Workspace::new();
    let model = ws.init_model();

    ws.cmd()
        .args(["generate", "--model"])
        .arg(&model)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--content"));
}

#[test]
fn test_train_then_inspect_adapter() {
    let ws = Workspace::new();
    let model = ws.init_model();
    let examples = ws.path("examples.jsonl");
    write_examples(&examples);

    ws.cmd()
        .args(["--json", "train", "--user", "7", "--steps", "10", "--model"])
        .arg(&model)
        .arg("--examples")
        .arg(&examples)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"version\": 1"));

    ws.cmd()
        .args(["--json", "adapters", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"user_id\": 7"));

    ws.cmd()
        .args(["--json", "adapters", "info", "--user", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rank\""));

    ws.cmd()
        .args(["adapters", "info", "--user", "8"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("user 8"));
}

#[test]
fn test_regenerate_fails_without_model() {
    let ws = Workspace::new();
    let missing = ws.path("no-such-model");

    ws.cmd()
        .args(["regenerate", "--user", "7", "--content", "Gravity", "--prior", "Things fall.", "--model"])
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load model"));
}

#[test]
fn test_regenerate_prints_a_note() {
    let ws = Workspace::new();
    let model = ws.init_model();

    ws.cmd()
        .args(["--json", "regenerate", "--user", "7", "--content", "Gravity", "--prior", "Things fall.", "--model"])
        .arg(&model)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"fallback\""));
}
