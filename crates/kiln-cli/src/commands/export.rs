use super::{json_pretty, parse_ref, parse_refs, EXIT_SUCCESS};
use kiln_core::{CoreError, Engine, ExportOptions};
use kiln_schema::ExportReport;

pub fn run(engine: &Engine, images: &[String], run_image: &str, json: bool) -> Result<u8, CoreError> {
    let opts = ExportOptions {
        images: parse_refs(images)?,
        run_image: parse_ref(run_image)?,
    };
    let report = engine.export(&opts)?;
    print_report(&report, json)?;
    Ok(EXIT_SUCCESS)
}

pub fn print_report(report: &ExportReport, json: bool) -> Result<(), CoreError> {
    if json {
        println!("{}", json_pretty(report)?);
        return Ok(());
    }
    for tag in &report.image.tags {
        println!("exported {tag}");
    }
    println!("digest: {}", report.image.digest);
    if let Some(e) = &report.cache_error {
        eprintln!("warning: cache not saved: {e}");
    }
    Ok(())
}
