use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn run_tau(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tau"))
        .args(args)
        .current_dir(dir)
        .env("TAU_LOG", "warn")
        .env("NO_COLOR", "1")
        .output()
        .expect("run tau")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

#[test]
fn init_creates_a_default_configuration_and_selects_it() {
    let tmp = tempdir().expect("tempdir");
    let out = run_tau(tmp.path(), &["init", "demo", "--target-name", "host"]);
    assert!(out.status.success(), "tau init failed: {}", stderr(&out));
    assert!(tmp.path().join(".tau/project.json").is_file());
    assert!(tmp.path().join(".tau/demo/demo-profile").is_dir());

    let dash = run_tau(tmp.path(), &["dashboard"]);
    assert!(dash.status.success(), "tau dashboard failed: {}", stderr(&dash));
    let text = stdout(&dash);
    assert!(text.contains("demo"));
    assert!(text.contains("host"));
    assert!(text.contains("baseline, profile"));
    assert!(text.contains("*demo-profile"));

    let again = run_tau(tmp.path(), &["init", "demo"]);
    assert!(!again.status.success());
    assert!(stderr(&again).contains("A project already exists"));
}

#[test]
fn commands_outside_a_project_fail_with_a_hint() {
    let tmp = tempdir().expect("tempdir");
    let out = run_tau(tmp.path(), &["target", "list"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!stderr(&out).is_empty());
}

#[test]
fn incompatible_edit_is_rejected_and_compatible_edit_reports_rebuild() {
    let tmp = tempdir().expect("tempdir");
    assert!(run_tau(tmp.path(), &["init", "demo"]).status.success());

    let out = run_tau(tmp.path(), &["application", "edit", "demo", "--mpi", "true"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("invalid condition in experiment 'demo-profile'"));

    let out = run_tau(tmp.path(), &["application", "edit", "demo", "--linkage", "static"]);
    assert!(out.status.success(), "edit failed: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("Application rebuild required:"));
    assert!(text.contains("linkage changed from 'dynamic' to 'static'"));

    let list = stdout(&run_tau(tmp.path(), &["application", "list"]));
    assert!(list.contains("static"));
}

#[test]
fn schema_command_prints_entity_schema() {
    let tmp = tempdir().expect("tempdir");
    let out = run_tau(tmp.path(), &["schema", "Measurement"]);
    assert!(out.status.success(), "tau schema failed: {}", stderr(&out));
    let schema: serde_json::Value = serde_json::from_slice(&out.stdout).expect("schema json");
    assert!(schema.to_string().contains("source_inst"));

    let out = run_tau(tmp.path(), &["schema", "Widget"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("Unknown entity 'Widget'"));
}

#[cfg(unix)]
#[test]
fn trial_create_runs_the_program_and_lists_it() {
    use std::os::unix::fs::PermissionsExt;
    let tmp = tempdir().expect("tempdir");
    assert!(run_tau(tmp.path(), &["init", "demo"]).status.success());
    let program = tmp.path().join("a.out");
    fs::write(&program, "#!/bin/sh\necho x > \"$PROFILEDIR/profile.0.0.0\"\n").expect("write program");
    fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).expect("chmod");

    let out = run_tau(tmp.path(), &["trial", "create", "--", "./a.out"]);
    assert!(out.status.success(), "tau trial create failed: {}", stderr(&out));
    assert!(stdout(&out).contains("completed"));
    assert!(tmp.path().join(".tau/demo/demo-profile/0/profile.0.0.0").is_file());

    let list = stdout(&run_tau(tmp.path(), &["trial", "list"]));
    assert!(list.contains("completed"));
    assert!(list.contains("./a.out"));
    let row = list.lines().last().expect("trial row");
    let digest = row.split_whitespace().nth(1).expect("digest column");
    assert_eq!(digest.len(), 12);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));

    let out = run_tau(tmp.path(), &["trial", "delete", "0"]);
    assert!(out.status.success(), "tau trial delete failed: {}", stderr(&out));
    assert!(!tmp.path().join(".tau/demo/demo-profile/0").exists());
}
