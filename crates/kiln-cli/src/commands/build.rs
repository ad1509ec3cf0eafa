use super::{json_pretty, EXIT_SUCCESS};
use kiln_core::{CoreError, Engine};

pub fn run(engine: &Engine, json: bool) -> Result<u8, CoreError> {
    let metadata = engine.build()?;
    if json {
        println!("{}", json_pretty(&metadata)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("built with {} buildpacks", metadata.buildpacks.len());
    for process in &metadata.processes {
        println!("  {}: {}", process.kind, process.command);
    }
    Ok(EXIT_SUCCESS)
}
