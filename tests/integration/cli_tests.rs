use predicates::prelude::*;

use super::fixture::CliFixture;

#[test]
fn test_cli_help() {
    let fixture = CliFixture::new("test_cli_help");
    fixture
        .command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("mutate"));
}

#[test]
fn test_cli_version() {
    let fixture = CliFixture::new("test_cli_version");
    fixture
        .command()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_status_on_fresh_root() {
    let fixture = CliFixture::new("test_status_on_fresh_root");
    let json = fixture.robot(&["status"]);

    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    let data = &json["data"];
    assert_eq!(data["platform"], "simulated");
    assert_eq!(data["mode"], "ephemeral");
    assert_eq!(data["elevated"], true);
    assert_eq!(data["pending_originals"], 0);
    assert_eq!(data["revert"]["state"], "no_pending_revert");
    assert!(fixture.path("journal.db").exists());
    assert!(fixture.path("simulated_platform.json").exists());
}

#[test]
fn test_mutate_then_restore_roundtrip() {
    let fixture = CliFixture::new("test_mutate_then_restore_roundtrip");
    let before = fixture.robot(&["inventory"]);
    let adapter = &before["data"]["adapters"][0];
    let original_address = adapter["current_address"].as_str().unwrap().to_string();

    let mutated = fixture.robot(&["mutate", "mac", "guid", "--override", "BIOS.SerialNumber"]);
    assert_eq!(mutated["status"], "ok");
    let outcomes = mutated["data"]["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o["success"] == true));
    assert_eq!(mutated["data"]["summary"], "completed");
    assert_eq!(mutated["data"]["revert"]["state"], "pending_revert");

    let during = fixture.robot(&["inventory"]);
    assert_ne!(
        during["data"]["adapters"][0]["current_address"].as_str().unwrap(),
        original_address
    );
    assert!(
        during["data"]["metadata"]["BIOS.SerialNumber"]
            .as_str()
            .unwrap()
            .starts_with("PHANTOM-")
    );

    let restored = fixture.robot(&["restore"]);
    assert_eq!(restored["status"], "ok");
    assert_eq!(restored["data"]["revert"]["state"], "no_pending_revert");

    let after = fixture.robot(&["inventory"]);
    assert_eq!(
        after["data"]["adapters"][0]["current_address"].as_str().unwrap(),
        original_address
    );
    let status = fixture.robot(&["status"]);
    assert_eq!(status["data"]["pending_originals"], 0);
    assert_eq!(status["data"]["overrides"], 0);
    assert!(!fixture.path("revert/revert.ps1").exists());
}

#[test]
fn test_history_and_stats_follow_mutations() {
    let fixture = CliFixture::new("test_history_and_stats_follow_mutations");
    fixture.robot(&["mutate", "guid"]);
    fixture.robot(&["mutate", "guid"]);

    let history = fixture.robot(&["history", "--limit", "10"]);
    let entries = history["data"]["mutations"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first, and each write starts where the previous one ended.
    assert_eq!(entries[0]["original_value"], entries[1]["new_value"]);

    let stats = fixture.robot(&["stats"]);
    assert_eq!(stats["data"]["total"], 2);
    assert_eq!(stats["data"]["per_category"]["machine_id"]["succeeded"], 2);
}

#[test]
fn test_plan_writes_nothing() {
    let fixture = CliFixture::new("test_plan_writes_nothing");
    let plan = fixture.robot(&["plan", "mac", "ip"]);
    let outcomes = plan["data"].as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o["message"] == "dry run"));

    let stats = fixture.robot(&["stats"]);
    assert_eq!(stats["data"]["total"], 0);
}

#[test]
fn test_unknown_class_is_structured_error() {
    let fixture = CliFixture::new("test_unknown_class_is_structured_error");
    let output = fixture.run(&["--robot", "mutate", "hostname"]);
    assert!(!output.success);
    let json = output.json();
    assert_eq!(json["status"]["error"]["code"], "VALIDATION_FAILED");
    assert!(
        json["status"]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("hostname")
    );
}

#[test]
fn test_backup_restore_requires_approval() {
    let fixture = CliFixture::new("test_backup_restore_requires_approval");
    fixture
        .command()
        .args(["backup", "restore", "--latest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--approve"));
}

#[test]
fn test_backup_create_list_restore() {
    let fixture = CliFixture::new("test_backup_create_list_restore");
    fixture.robot(&["mutate", "guid"]);

    let created = fixture.robot(&["backup", "create", "--verify"]);
    let record = &created["data"];
    assert!(record["row_counts"]["mutations"].as_i64().unwrap() >= 1);
    let path = record["file_path"].as_str().unwrap().to_string();
    assert!(std::path::Path::new(&path).exists());

    fixture.robot(&["mutate", "guid"]);
    let listed = fixture.robot(&["backup", "list"]);
    assert_eq!(listed["data"]["count"], 1);

    let restored = fixture.robot(&["backup", "restore", &path, "--approve"]);
    assert_eq!(restored["status"], "ok");

    let history = fixture.robot(&["history"]);
    let items: Vec<&str> = history["data"]["mutations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["item"].as_str().unwrap())
        .collect();
    // The second mutation is gone; the restore itself is journaled.
    assert_eq!(items, vec!["backup_restore", "machine_guid"]);
}

#[test]
fn test_permanent_mode_clears_revert() {
    let fixture = CliFixture::new("test_permanent_mode_clears_revert");
    fixture.robot(&["mutate", "guid"]);
    assert!(fixture.path("revert/revert.ps1").exists());

    let mode = fixture.robot(&["mode", "permanent"]);
    assert_eq!(mode["data"]["mode"], "permanent");
    assert_eq!(mode["data"]["revert"]["state"], "no_pending_revert");
    assert!(!fixture.path("revert/revert.ps1").exists());

    let status = fixture.robot(&["status"]);
    assert_eq!(status["data"]["mode"], "permanent");
    assert_eq!(status["data"]["pending_originals"], 1);
}

#[test]
fn test_revert_run_restores_and_clears() {
    let fixture = CliFixture::new("test_revert_run_restores_and_clears");
    fixture.robot(&["mutate", "guid"]);

    let shown = fixture.robot(&["revert", "show"]);
    assert_eq!(shown["data"]["state"]["state"], "pending_revert");
    assert!(!shown["data"]["plan"]["commands"].as_array().unwrap().is_empty());

    let run = fixture.robot(&["revert", "run"]);
    assert_eq!(run["data"]["completed"], true);

    let status = fixture.robot(&["status"]);
    assert_eq!(status["data"]["pending_originals"], 0);
    assert_eq!(status["data"]["revert"]["state"], "no_pending_revert");

    let output = fixture.run(&["--robot", "revert", "run"]);
    assert!(!output.success);
    assert_eq!(output.json()["status"]["error"]["code"], "NOT_FOUND");
}

#[test]
fn test_human_output_mentions_result() {
    let fixture = CliFixture::new("test_human_output_mentions_result");
    fixture
        .command()
        .args(["mutate", "guid"])
        .assert()
        .success()
        .stdout(predicate::str::contains("machine_guid"))
        .stdout(predicate::str::contains("completed"));
}
