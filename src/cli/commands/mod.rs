//! CLI command implementations
//!
//! Each subcommand has its own module with:
//! - Args struct for command-line arguments
//! - `run()` function to execute the command

use crate::app::AppContext;
use crate::cli::Commands;
use crate::error::Result;
use crate::mutator::IdentifierClass;

pub mod backup;
pub mod history;
pub mod mode;
pub mod mutate;
pub mod restore;
pub mod revert;
pub mod status;

/// Dispatch a command to its handler
pub fn run(ctx: &mut AppContext, command: &Commands) -> Result<()> {
    match command {
        Commands::Mutate(args) => mutate::run(ctx, args),
        Commands::Plan(args) => mutate::run_plan(ctx, args),
        Commands::Restore => restore::run(ctx),
        Commands::Backup(args) => backup::run(ctx, args),
        Commands::Stats => history::run_stats(ctx),
        Commands::History(args) => history::run(ctx, args),
        Commands::Status => status::run(ctx),
        Commands::Mode(args) => mode::run(ctx, args),
        Commands::Inventory => status::run_inventory(ctx),
        Commands::Prune(args) => history::run_prune(ctx, args),
        Commands::Revert(args) => revert::run(ctx, args),
    }
}

/// Parse positional classes plus `--override` fields, in that order.
pub(crate) fn parse_classes(
    classes: &[String],
    overrides: &[String],
) -> Result<Vec<IdentifierClass>> {
    classes
        .iter()
        .map(|c| c.parse())
        .chain(
            overrides
                .iter()
                .map(|field| format!("override:{field}").parse()),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{run_table_tests, TestCase};

    #[test]
    fn test_parse_classes() {
        let cases = vec![
            TestCase::new(
                "aliases",
                (vec!["mac", "guid", "ip"], vec![]),
                Some(vec![
                    IdentifierClass::AdapterAddress,
                    IdentifierClass::MachineId,
                    IdentifierClass::NetworkAddress,
                ]),
            ),
            TestCase::new(
                "overrides follow classes",
                (vec!["guid"], vec!["bios.serialnumber"]),
                Some(vec![
                    IdentifierClass::MachineId,
                    IdentifierClass::ReportingOverride("BIOS.SerialNumber".to_string()),
                ]),
            ),
            TestCase::new("unknown class", (vec!["hostname"], vec![]), None),
            TestCase::new("unknown override", (vec![], vec!["GPU.Serial"]), None),
        ];
        run_table_tests(cases, |(classes, overrides): (Vec<&str>, Vec<&str>)| {
            let classes: Vec<String> = classes.into_iter().map(String::from).collect();
            let overrides: Vec<String> = overrides.into_iter().map(String::from).collect();
            parse_classes(&classes, &overrides).ok()
        });
    }
}
