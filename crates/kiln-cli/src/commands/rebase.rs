use super::{json_pretty, parse_ref, parse_refs, EXIT_SUCCESS};
use kiln_core::{CoreError, Engine, RebaseOptions};

/// Rebase the first image onto `run_image` and write the result under every
/// given reference.
pub fn run(engine: &Engine, images: &[String], run_image: &str, json: bool) -> Result<u8, CoreError> {
    let outputs = parse_refs(images)?;
    let Some(image) = outputs.first().cloned() else {
        return Err(CoreError::InvalidInput("no image to rebase".to_owned()));
    };
    let report = engine.rebase(&RebaseOptions {
        image,
        new_base: parse_ref(run_image)?,
        outputs,
    })?;
    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        for tag in &report.image.tags {
            println!("rebased {tag}");
        }
        println!("digest: {}", report.image.digest);
        println!("base layers: {}", report.base_layer_count);
    }
    Ok(EXIT_SUCCESS)
}
