use std::time::Duration;

use idswap::error::ErrorCode;
use idswap::mutator::{IdentifierClass, MutationOptions, Originals};
use idswap::platform::{
    KeyValueStore, MemoryPlatform, RegistrationKind, MACHINE_GUID_KEY, MACHINE_GUID_VALUE,
};
use idswap::revert::RevertState;
use idswap::storage::journal::INTERRUPTED_ERROR;
use idswap::storage::{MutationIntent, MutationJournal, Settings};
use idswap::test_utils::fixtures::{TestMachine, ADAPTER_ADDRESS, ADAPTER_ID, MACHINE_GUID};
use idswap::test_utils::logging::TestLogger;

fn machine_guid(machine: &TestMachine) -> Option<String> {
    machine
        .platform
        .get(MACHINE_GUID_KEY, MACHINE_GUID_VALUE)
        .unwrap()
}

#[test]
fn chained_history_links_each_write_to_the_previous() {
    let log = TestLogger::new("chained_history_links_each_write_to_the_previous");
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();

    for _ in 0..3 {
        let summary = orchestrator.mutate(&IdentifierClass::MachineId, &MutationOptions::default());
        assert_eq!(summary.summary, "completed");
    }

    let mut history = orchestrator.history(10).unwrap();
    history.reverse();
    log.log_actual(&history);
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].original_value.as_deref(), Some(MACHINE_GUID));
    for pair in history.windows(2) {
        assert_eq!(pair[1].original_value, pair[0].new_value);
    }
    assert_eq!(history[2].new_value, machine_guid(&machine));

    // Within the session the first original wins.
    let originals = Originals::load(&orchestrator.journal().load_settings().unwrap()).unwrap();
    assert_eq!(originals.machine_guid.unwrap().value.as_deref(), Some(MACHINE_GUID));
    log.pass();
}

#[test]
fn restore_all_undoes_every_class() {
    let log = TestLogger::new("restore_all_undoes_every_class");
    let machine = TestMachine::new();
    let before = machine.platform.adapter(ADAPTER_ID).unwrap();
    let mut orchestrator = machine.open();

    log.step("mutate all resource classes twice");
    let classes = [
        IdentifierClass::AdapterAddress,
        IdentifierClass::MachineId,
        IdentifierClass::NetworkAddress,
    ];
    for _ in 0..2 {
        let summary = orchestrator.mutate_batch(
            &classes,
            &MutationOptions::default(),
            &mut |_| {},
            &idswap::worker::CancelToken::new(),
        );
        assert_eq!(summary.summary, "completed", "{summary:?}");
    }
    let during = machine.platform.adapter(ADAPTER_ID).unwrap();
    assert_ne!(during.current_address, before.current_address);
    assert_ne!(during.ip_addresses, before.ip_addresses);

    log.step("restore");
    let restored = orchestrator.restore_all().unwrap();
    assert!(restored.report.all_succeeded(), "{restored:?}");
    assert_eq!(restored.revert, Some(RevertState::NoPendingRevert));

    let after = machine.platform.adapter(ADAPTER_ID).unwrap();
    assert_eq!(after.current_address.as_deref(), Some(ADAPTER_ADDRESS));
    assert_eq!(after.ip_addresses, before.ip_addresses);
    assert_eq!(machine_guid(&machine).as_deref(), Some(MACHINE_GUID));
    assert_eq!(orchestrator.status().unwrap().pending_originals, 0);

    let stats = orchestrator.statistics().unwrap();
    assert_eq!(stats.per_category["restore"].succeeded, 3);
    log.pass();
}

#[test]
fn unclean_shutdown_is_detected_and_intents_recovered() {
    let machine = TestMachine::new();
    drop(machine.open());

    // A write that started but never recorded its outcome.
    {
        let mut journal = MutationJournal::open(
            machine.config.db_path(machine.root()),
            Duration::from_secs(1),
        )
        .unwrap();
        let intent = MutationIntent::new(
            "machine_id",
            "machine_guid",
            MACHINE_GUID_KEY,
            Some(MACHINE_GUID.to_string()),
            Some("new-guid".to_string()),
            None,
        );
        journal.begin_mutation(&intent, &Settings::new()).unwrap();
    }

    let orchestrator = machine.open();
    let report = orchestrator.startup_report();
    assert!(report.unclean_shutdown());
    assert_eq!(report.stale_sessions, 1);
    assert_eq!(report.recovered_intents, 1);
    assert!(orchestrator.journal().pending_intents().unwrap().is_empty());

    let latest = &orchestrator.history(1).unwrap()[0];
    assert!(!latest.success);
    assert_eq!(latest.error.as_deref(), Some(INTERRUPTED_ERROR));
    assert_eq!(latest.new_value.as_deref(), Some("new-guid"));
    orchestrator.shutdown().unwrap();

    let clean = machine.open();
    assert!(!clean.startup_report().unclean_shutdown());
}

#[test]
fn boot_revert_is_reconciled_at_next_start() {
    let log = TestLogger::new("boot_revert_is_reconciled_at_next_start");
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();
    orchestrator.mutate(&IdentifierClass::MachineId, &MutationOptions::default());
    orchestrator.mutate(&IdentifierClass::AdapterAddress, &MutationOptions::default());

    let state = orchestrator.revert_state();
    log.log_actual(&state);
    assert!(matches!(
        state,
        RevertState::PendingRevert {
            registered: Some(RegistrationKind::SystemTask),
            digest: Some(_),
            ..
        }
    ));
    let task = orchestrator.config().revert.task_name.clone();
    assert_eq!(machine.platform.registrations(&task).len(), 1);

    log.step("machine reboots; the startup task replays the script");
    let plan = orchestrator.scheduler().load_plan().unwrap();
    orchestrator.shutdown().unwrap();
    let report = plan.apply(&machine.platform);
    assert!(report.completed, "{report:?}");
    assert_eq!(machine_guid(&machine).as_deref(), Some(MACHINE_GUID));
    assert_eq!(
        machine.platform.adapter(ADAPTER_ID).unwrap().current_address.as_deref(),
        Some(ADAPTER_ADDRESS)
    );
    assert!(machine.platform.registrations(&task).is_empty());

    log.step("application starts again");
    let orchestrator = machine.open();
    assert!(orchestrator.startup_report().boot_revert_applied);
    assert_eq!(orchestrator.revert_state(), RevertState::NoPendingRevert);
    assert_eq!(orchestrator.status().unwrap().pending_originals, 0);
    let latest = &orchestrator.history(1).unwrap()[0];
    assert_eq!(latest.item, "boot_revert");
    log.pass();
}

#[test]
fn unelevated_process_falls_back_to_user_autorun() {
    let machine = TestMachine::new();
    let mut orchestrator = machine.open();
    orchestrator.mutate(&IdentifierClass::MachineId, &MutationOptions::default());

    machine.platform.set_elevated(false);
    let state = orchestrator.regenerate_revert().unwrap();
    let task = orchestrator.config().revert.task_name.clone();
    assert!(matches!(
        state,
        RevertState::PendingRevert {
            registered: Some(RegistrationKind::UserAutorun),
            ..
        }
    ));
    let registrations = machine.platform.registrations(&task);
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].0, RegistrationKind::UserAutorun);
}

#[test]
fn worker_serializes_jobs_and_returns_orchestrator() {
    use idswap::worker::{Job, JobResult, Worker};

    let machine = TestMachine::new();
    let mut worker = Worker::spawn(machine.open()).unwrap();
    let first = worker
        .submit(Job::Mutate {
            classes: vec![IdentifierClass::MachineId],
            options: MutationOptions::default(),
        })
        .unwrap();
    let second = worker.submit(Job::Backup { verify: true }).unwrap();

    assert!(matches!(
        worker.wait(first, &mut |_| {}).unwrap(),
        Ok(JobResult::Batch(_))
    ));
    match worker.wait(second, &mut |_| {}).unwrap() {
        Ok(JobResult::Backup(record)) => {
            assert_eq!(record.row_counts.unwrap()["mutations"], 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    let orchestrator = worker.join().unwrap();
    assert_eq!(orchestrator.list_backups(5).unwrap().len(), 1);
    orchestrator.shutdown().unwrap();
}

#[test]
fn unavailable_platform_fails_cleanly_for_every_class() {
    let log = TestLogger::new("unavailable_platform_fails_cleanly_for_every_class");
    let machine = TestMachine::with_platform(MemoryPlatform::unavailable());
    let mut orchestrator = machine.open();
    let classes = [
        IdentifierClass::AdapterAddress,
        IdentifierClass::NetworkAddress,
        IdentifierClass::MachineId,
        IdentifierClass::ReportingOverride("BIOS.SerialNumber".to_string()),
    ];

    let summary = orchestrator.mutate_batch(
        &classes,
        &MutationOptions::default(),
        &mut |_| {},
        &idswap::worker::CancelToken::new(),
    );
    log.log_actual(&summary);

    assert_eq!(summary.summary, "completed with issues");
    for outcome in &summary.outcomes[..3] {
        assert!(!outcome.success, "{outcome:?}");
        assert_eq!(
            outcome.error.as_ref().unwrap().code,
            ErrorCode::PlatformUnavailable
        );
    }
    assert!(summary.outcomes[3].success);
    assert!(summary.revert_error.is_none());
    assert!(orchestrator.journal().pending_intents().unwrap().is_empty());
    assert_eq!(orchestrator.status().unwrap().pending_originals, 0);
    assert_eq!(orchestrator.revert_state(), RevertState::NoPendingRevert);
    assert!(!orchestrator.scheduler().script_path().exists());
    log.pass();
}
