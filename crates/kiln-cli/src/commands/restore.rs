use super::{json_pretty, EXIT_SUCCESS};
use kiln_core::{CoreError, Engine};

pub fn run(engine: &Engine, json: bool) -> Result<u8, CoreError> {
    let report = engine.restore()?;
    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "restore: {} restored, {} metadata only, {} missed, {} failed",
            report.restored.len(),
            report.metadata_only.len(),
            report.missed.len(),
            report.failed.len()
        );
        for layer in &report.failed {
            println!("  failed: {layer}");
        }
    }
    Ok(EXIT_SUCCESS)
}
