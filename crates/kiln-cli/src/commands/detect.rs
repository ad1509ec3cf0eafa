use super::{json_pretty, EXIT_SUCCESS};
use kiln_core::{CoreError, Engine};
use kiln_schema::{read_record, Order};
use std::path::Path;

pub fn run(engine: &Engine, order_path: &Path, json: bool) -> Result<u8, CoreError> {
    let order: Order = read_record(order_path)?;
    let result = engine.detect(&order)?;
    if json {
        let payload = serde_json::json!({
            "group": result.group,
            "plan": result.plan,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("detected group:");
        for entry in &result.group {
            println!("  {entry}");
        }
        println!("plan entries: {}", result.plan.len());
    }
    Ok(EXIT_SUCCESS)
}
