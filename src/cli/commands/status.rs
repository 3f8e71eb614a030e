//! idswap status / inventory

use crate::app::AppContext;
use crate::cli::output::{emit_human, emit_robot, robot_ok, HumanLayout};
use crate::error::Result;

use super::mutate::revert_line;

pub fn run(ctx: &mut AppContext) -> Result<()> {
    let status = ctx.orchestrator()?.status()?;
    if ctx.robot_mode {
        return emit_robot(&robot_ok(&status));
    }

    let mut layout = HumanLayout::new();
    layout
        .title("idswap status")
        .kv("Root", &ctx.root.display().to_string())
        .kv("Platform", &status.platform)
        .kv("Elevated", if status.elevated { "yes" } else { "no" })
        .kv("Mode", &status.mode.to_string())
        .kv("Session", &status.session_id)
        .kv("Schema version", &status.schema_version.to_string())
        .kv("Open sessions", &status.open_sessions.to_string())
        .kv("Originals held", &status.pending_originals.to_string())
        .kv("Overrides", &status.overrides.to_string())
        .kv("Boot revert", &revert_line(&status.revert));
    if let crate::revert::RevertState::PendingRevert {
        digest: Some(digest),
        ..
    } = &status.revert
    {
        layout.kv("Script sha256", digest);
    }
    let last_backup = status.last_backup.as_ref().map_or_else(
        || "never".to_string(),
        |b| format!("{} ({})", b.created_at.to_rfc3339(), b.file_path.display()),
    );
    layout.kv("Last backup", &last_backup);
    if status.startup.unclean_shutdown() {
        layout.blank().section("Previous run");
        layout
            .kv("Stale sessions", &status.startup.stale_sessions.to_string())
            .kv("Interrupted writes", &status.startup.recovered_intents.to_string());
    }
    if status.startup.boot_revert_applied {
        layout.bullet("A boot-time revert ran since the last start; originals were cleared.");
    }
    emit_human(layout);
    Ok(())
}

pub fn run_inventory(ctx: &mut AppContext) -> Result<()> {
    let inventory = ctx.orchestrator()?.inventory()?;
    if ctx.robot_mode {
        return emit_robot(&robot_ok(&inventory));
    }

    let mut layout = HumanLayout::new();
    layout.title(&format!("Inventory ({})", inventory.platform));
    layout.section("Adapters");
    if inventory.adapters.is_empty() {
        layout.push_line("no active adapters");
    }
    for adapter in &inventory.adapters {
        layout.push_line(format!("{} ({})", adapter.description, adapter.stable_id));
        layout
            .kv(
                "  Address",
                adapter.current_address.as_deref().unwrap_or("unknown"),
            )
            .kv("  IPv4", &adapter.ip_addresses.join(", "))
            .kv("  Mask", adapter.subnet_mask.as_deref().unwrap_or("-"))
            .kv("  Gateway", adapter.gateway.as_deref().unwrap_or("-"))
            .kv("  DHCP", if adapter.dhcp_enabled { "yes" } else { "no" });
    }
    layout.blank().section("Machine");
    for (key, value) in &inventory.metadata {
        layout.kv(key, value);
    }
    emit_human(layout);
    Ok(())
}
