use std::fmt::Write as _;
use std::process::ExitCode;

use anyhow::{Context, Result};

use mediaflow::catalog::StageCatalog;

/// Execute the `list-stages` command: print the built-in stage catalog.
pub fn execute() -> Result<ExitCode> {
    let catalog = StageCatalog::media_default().context("Built-in stage catalog is invalid")?;
    print!("{}", render(&catalog));
    Ok(ExitCode::SUCCESS)
}

/// Formats the catalog as a fixed-width table in canonical order.
pub fn render(catalog: &StageCatalog) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<18} {:<18} {:>8}  {:<8}  {:<11}  FLAG",
        "STAGE", "NEXT", "TIMEOUT", "CRITICAL", "RESOURCES"
    );
    for stage in catalog.stages() {
        let flag = stage.flag.as_ref().map_or_else(
            || "-".to_string(),
            |f| format!("{} (default {})", f.name, if f.default_enabled { "on" } else { "off" }),
        );
        let _ = writeln!(
            out,
            "{:<18} {:<18} {:>7}s  {:<8}  {:<11}  {}",
            stage.name,
            stage.canonical_next.as_deref().unwrap_or("-"),
            stage.timeout_secs,
            if stage.critical { "yes" } else { "no" },
            stage.resource_class.to_string(),
            flag,
        );
    }
    out
}
