use crate::common::TestProject;
use assert_cmd::Command;
use predicates::prelude::*;
use warden::jobs::{FileJobStore, Job, JobStatus, JobStore};

#[test]
fn validate_accepts_a_good_config() {
    let project = TestProject::new(
        r##"
[instances.main]
artifact = "game.dmb"
ports = [1337, 1338]
chat_channels = ["ops"]

[chat.providers.irc]
type = "irc"
server = "irc.example.net:6667"
nickname = "warden"

[[chat.channels]]
id = "ops"
providers = { irc = "#ops" }
"##,
    );

    Command::cargo_bin("warden")
        .unwrap()
        .args(["validate", "-f", project.config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("warden.toml is valid (1 instances"));
}

#[test]
fn validate_reports_problems_with_suggestions() {
    let project = TestProject::new(
        r#"
[instances.main]
artifact = "game.dmb"
ports = [1337, 1337]
chat_channels = ["opz"]

[[chat.channels]]
id = "ops"
"#,
    );

    Command::cargo_bin("warden")
        .unwrap()
        .args(["validate", "-f", project.config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("1337"))
        .stderr(predicate::str::contains("ops"));
}

#[test]
fn missing_config_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    Command::cargo_bin("warden")
        .unwrap()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("warden.toml"));
}

#[test]
fn jobs_lists_the_store() {
    let project = TestProject::new(
        r#"
[instances.main]
artifact = "game.dmb"
ports = [1337, 1338]

[instances.test]
artifact = "game.dmb"
ports = [2337, 2338]
"#,
    );
    let store = FileJobStore::new(&project.dir.path().join(".warden"));
    let mut failed = Job::queued(1, "main", "compile");
    failed.finish(JobStatus::Failed, Some("compiler exited with 1".to_string()));
    store.save_job_status(&failed).unwrap();
    store.save_job_status(&Job::queued(2, "test", "deploy")).unwrap();

    Command::cargo_bin("warden")
        .unwrap()
        .args(["jobs", "-f", project.config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("compiler exited with 1"))
        .stdout(predicate::str::contains("deploy"));

    Command::cargo_bin("warden")
        .unwrap()
        .args(["jobs", "--instance", "main", "-f", project.config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("compile"))
        .stdout(predicate::str::contains("deploy").not());
}

#[test]
fn topic_times_out_against_nothing() {
    let port = crate::common::free_ports(1)[0];
    Command::cargo_bin("warden")
        .unwrap()
        .args(["topic", "--port", &port.to_string(), "--timeout", "200ms", "ping"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn completions_reference_the_binary() {
    for shell in ["bash", "zsh", "fish"] {
        Command::cargo_bin("warden")
            .unwrap()
            .args(["completions", shell])
            .assert()
            .success()
            .stdout(predicate::str::contains("warden"));
    }
}
