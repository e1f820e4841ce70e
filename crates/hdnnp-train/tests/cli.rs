//! `hdnnp-train` バイナリの結合テスト

use std::path::Path;
use std::process::{Command, Output};

use hdnnp::{Descriptor, Structure};

const N_FEATURE: usize = 3;

/// エネルギーだけで学習できるタグを作る (記述子キャッシュも書く)
fn write_tag(root: &Path, tag: &str, n: usize) {
    let dir = root.join(tag);
    std::fs::create_dir_all(&dir).unwrap();
    let mut lines = Vec::new();
    let mut descriptors = Vec::new();
    for i in 0..n {
        let x = 0.1 * i as f64;
        let structure = Structure {
            elements: vec!["H".into(), "O".into()],
            positions: vec![[0.0, 0.0, 0.0], [1.0 + x, 0.0, 0.0]],
            energy: -1.0 + x * x,
            forces: Vec::new(),
        };
        lines.push(serde_json::to_string(&structure).unwrap());
        descriptors.push(Descriptor {
            n_atom: 2,
            n_feature: N_FEATURE,
            values: (0..2 * N_FEATURE).map(|k| x + 0.05 * k as f64).collect(),
            first: None,
            second: None,
        });
    }
    std::fs::write(dir.join("structures.jsonl"), lines.join("\n")).unwrap();
    hdnnp::io::write_json(dir.join("descriptors.json.gz"), &descriptors).unwrap();
}

fn write_config(dir: &Path, tags: &str, loss: &str) -> std::path::PathBuf {
    let path = dir.join("train.toml");
    let text = format!(
        r#"
[dataset]
root = "{root}"
tags = {tags}

[model]
layers = [
    {{ nodes = 4, activation = "tanh" }},
    {{ nodes = 1, activation = "identity" }},
]
loss_function = {loss}

[training]
out_dir = "{out}"
batch_size = 2
epoch = 2
patience = 5
init_lr = 1.0e-2
progress = false
"#,
        root = dir.join("data").display(),
        out = dir.join("out").display(),
    );
    std::fs::write(&path, text).unwrap();
    path
}

fn train(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hdnnp-train"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn test_missing_tag_is_reported_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_tag(&dir.path().join("data"), "A", 5);
    write_tag(&dir.path().join("data"), "B", 5);
    let config = write_config(dir.path(), r#"["A", "B", "C"]"#, r#"{ name = "zeroth" }"#);

    let output = train(&["--config", config.to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "{stderr}");
    assert_eq!(
        stderr.matches("Sub dataset tagged as \"C\" does not exist.").count(),
        1,
        "{stderr}"
    );

    let out = dir.path().join("out");
    assert!(out.join("MasterNNP.bin").is_file());
    assert!(out.join("config.toml").is_file());
    let result: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("result.json")).unwrap()).unwrap();
    assert_eq!(result["observation"].as_array().unwrap().len(), 4);
}

#[test]
fn test_two_workers() {
    let dir = tempfile::tempdir().unwrap();
    write_tag(&dir.path().join("data"), "A", 6);
    let config = write_config(dir.path(), r#"["all"]"#, r#"{ name = "zeroth" }"#);

    let output = train(&[
        "--config",
        config.to_str().unwrap(),
        "--workers",
        "2",
        "--check-collectives",
    ]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(dir.path().join("out").join("MasterNNP.bin").is_file());
}

#[test]
fn test_invalid_loss_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_tag(&dir.path().join("data"), "A", 5);
    let config = write_config(
        dir.path(),
        r#"["A"]"#,
        r#"{ name = "potential", mixing_beta = 1.1, summation = 0.0, rotation = 1.0 }"#,
    );

    let output = train(&["--config", config.to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("mixing_beta"), "{stderr}");
    assert!(!dir.path().join("out").join("MasterNNP.bin").exists());
}

#[test]
fn test_resume_directory_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    write_tag(&dir.path().join("data"), "A", 5);
    let config = write_config(dir.path(), r#"["A"]"#, r#"{ name = "zeroth" }"#);
    let missing = dir.path().join("out").join("A");

    let output = train(&[
        "--config",
        config.to_str().unwrap(),
        "--resume",
        missing.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
}

#[test]
fn test_resume_uses_config_copied_at_start() {
    let dir = tempfile::tempdir().unwrap();
    write_tag(&dir.path().join("data"), "A", 5);
    let config = write_config(dir.path(), r#"["A"]"#, r#"{ name = "zeroth" }"#);
    let output = train(&["--config", config.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stage_dir = dir.path().join("out").join("A");
    let output = train(&["--resume", stage_dir.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    // 書き換えた設定を渡しても、開始時の写しで再開して警告する
    let changed = write_config(
        dir.path(),
        r#"["A"]"#,
        r#"{ name = "potential", mixing_beta = 1.1, summation = 0.0, rotation = 1.0 }"#,
    );
    let output = train(&[
        "--config",
        changed.to_str().unwrap(),
        "--resume",
        stage_dir.to_str().unwrap(),
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "{stderr}");
    assert!(stderr.contains("used at the start of this run"), "{stderr}");
}
