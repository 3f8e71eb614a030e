use chrono::{Duration as ChronoDuration, Utc};
use idswap::mutator::{IdentifierClass, MutationOptions};
use idswap::platform::{CURRENT_VERSION_KEY, MACHINE_GUID_KEY, MACHINE_GUID_VALUE};
use idswap::revert::RevertState;
use idswap::storage::{BackupMethod, BackupRecord};
use idswap::test_utils::fixtures::{TestMachine, MACHINE_GUID};
use idswap::test_utils::logging::TestLogger;

#[test]
fn verified_backup_counts_every_row() {
    let log = TestLogger::new("verified_backup_counts_every_row");
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();
    for _ in 0..5 {
        orchestrator.mutate(&IdentifierClass::MachineId, &MutationOptions::default());
    }

    let mut progress = Vec::new();
    let record = orchestrator
        .create_backup(true, &mut |p| progress.push(p))
        .unwrap();
    log.log_actual(&record);

    assert_eq!(record.method, BackupMethod::PageCopy);
    assert!(record.file_path.starts_with(machine.config.backup_dir(machine.root())));
    assert!(record.size_bytes > 0);
    let counts = record.row_counts.as_ref().expect("verified backups carry row counts");
    assert_eq!(counts["mutations"], 5);
    assert_eq!(counts["system_snapshots"], 1);
    assert_eq!(counts["registry_snapshot"], 3);
    assert!(record.included_tables.iter().any(|t| t == "app_settings"));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    let last = orchestrator.journal().last_backup().unwrap().unwrap();
    assert_eq!(last.file_path, record.file_path);
    assert_eq!(last.row_counts, record.row_counts);
    log.pass();
}

#[test]
fn unverified_backup_has_no_row_counts() {
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();
    let record = orchestrator.create_backup(false, &mut |_| {}).unwrap();
    assert!(record.row_counts.is_none());
    assert!(record.file_path.exists());
}

#[test]
fn restore_rolls_journal_back_and_keeps_session() {
    let log = TestLogger::new("restore_rolls_journal_back_and_keeps_session");
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();
    let session = orchestrator.session_id().to_string();

    orchestrator.mutate(&IdentifierClass::MachineId, &MutationOptions::default());
    let backup = orchestrator.create_backup(false, &mut |_| {}).unwrap();

    log.step("diverge after the backup");
    orchestrator.mutate(&IdentifierClass::AdapterAddress, &MutationOptions::default());
    assert_eq!(orchestrator.status().unwrap().pending_originals, 2);

    log.step("restore");
    let state = orchestrator.restore_backup(&backup.file_path).unwrap();
    assert!(matches!(state, RevertState::PendingRevert { .. }));

    let history = orchestrator.history(10).unwrap();
    let items: Vec<&str> = history.iter().map(|r| r.item.as_str()).collect();
    assert_eq!(items, vec!["backup_restore", "machine_guid"]);
    assert_eq!(orchestrator.status().unwrap().pending_originals, 1);

    let journal = orchestrator.journal();
    assert_eq!(journal.count_open_sessions().unwrap(), 1);
    assert!(journal.session(&session).unwrap().is_some());
    assert!(journal.integrity_check().unwrap());

    orchestrator.shutdown().unwrap();
    let reopened = machine.open();
    assert!(!reopened.startup_report().unclean_shutdown());
    log.pass();
}

#[test]
fn restore_rejects_a_corrupt_candidate() {
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();
    orchestrator.mutate(&IdentifierClass::MachineId, &MutationOptions::default());

    let bogus = machine.root().join("not-a-backup.db");
    std::fs::write(&bogus, b"definitely not sqlite").unwrap();
    assert!(orchestrator.restore_backup(&bogus).is_err());

    // The live journal is untouched.
    assert_eq!(orchestrator.history(10).unwrap().len(), 1);
    assert_eq!(orchestrator.journal().count_open_sessions().unwrap(), 1);
}

#[test]
fn backup_captures_registry_baseline_first() {
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();
    orchestrator.mutate(&IdentifierClass::MachineId, &MutationOptions::default());
    let current = orchestrator
        .history(1)
        .unwrap()
        .remove(0)
        .new_value
        .unwrap();

    orchestrator.create_backup(false, &mut |_| {}).unwrap();

    let baseline = orchestrator.journal().latest_registry_snapshot().unwrap();
    let names: Vec<&str> = baseline.iter().map(|v| v.value_name.as_str()).collect();
    // InstallDate is absent on this machine and is skipped.
    assert_eq!(names, vec![MACHINE_GUID_VALUE, "ProductName", "CurrentBuild"]);
    assert_eq!(baseline[0].key_path, MACHINE_GUID_KEY);
    assert_eq!(baseline[0].value.as_deref(), Some(current.as_str()));
    assert_ne!(current, MACHINE_GUID);
    assert_eq!(baseline[1].key_path, CURRENT_VERSION_KEY);
    assert_eq!(baseline[2].value.as_deref(), Some("19045"));
}

fn aged_backup(machine: &TestMachine, age_days: i64) -> BackupRecord {
    BackupRecord {
        created_at: Utc::now() - ChronoDuration::days(age_days),
        file_path: machine.root().join("backups/old.bak"),
        size_bytes: 0,
        included_tables: vec!["mutations".to_string()],
        row_counts: None,
        method: BackupMethod::PageCopy,
    }
}

#[test]
fn startup_takes_backup_once_interval_has_passed() {
    let log = TestLogger::new("startup_takes_backup_once_interval_has_passed");
    let mut machine = TestMachine::new();
    machine.config.journal.auto_backup = true;

    let orchestrator = machine.open();
    assert!(orchestrator.startup_report().auto_backup.is_none());
    orchestrator
        .journal()
        .record_backup(&aged_backup(&machine, 8))
        .unwrap();
    orchestrator.shutdown().unwrap();

    log.step("reopen with a backup older than the interval");
    let orchestrator = machine.open();
    let report = orchestrator.startup_report();
    log.log_actual(report);
    let taken = report.auto_backup.as_ref().expect("backup was due");
    assert!(taken.file_path.exists());
    assert!(taken.row_counts.is_some());
    assert_eq!(orchestrator.list_backups(5).unwrap().len(), 2);
    assert_eq!(
        orchestrator.journal().last_backup().unwrap().unwrap().file_path,
        taken.file_path
    );
    orchestrator.shutdown().unwrap();

    log.step("reopen right after; the fresh backup is not due again");
    let orchestrator = machine.open();
    assert!(orchestrator.startup_report().auto_backup.is_none());
    assert_eq!(orchestrator.list_backups(5).unwrap().len(), 2);
    log.pass();
}

#[test]
fn startup_skips_backup_when_recent_or_disabled() {
    let mut machine = TestMachine::new();
    machine.config.journal.auto_backup = true;
    let orchestrator = machine.open();
    orchestrator
        .journal()
        .record_backup(&aged_backup(&machine, 2))
        .unwrap();
    orchestrator.shutdown().unwrap();

    let orchestrator = machine.open();
    assert!(orchestrator.startup_report().auto_backup.is_none());
    orchestrator
        .journal()
        .record_backup(&aged_backup(&machine, 30))
        .unwrap();
    orchestrator.shutdown().unwrap();

    machine.config.journal.auto_backup = false;
    let orchestrator = machine.open();
    assert!(orchestrator.startup_report().auto_backup.is_none());
    assert_eq!(orchestrator.list_backups(5).unwrap().len(), 2);
}
