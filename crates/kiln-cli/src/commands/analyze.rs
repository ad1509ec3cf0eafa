use super::{json_pretty, parse_ref, EXIT_SUCCESS};
use kiln_core::{CoreError, Engine};

pub fn run(engine: &Engine, previous_image: Option<&str>, json: bool) -> Result<u8, CoreError> {
    let previous = previous_image.map(parse_ref).transpose()?;
    let analyzed = engine.analyze(previous.as_ref())?;
    if json {
        println!("{}", json_pretty(&analyzed)?);
        return Ok(EXIT_SUCCESS);
    }
    match &analyzed.image {
        Some(image) => println!("previous image: {} ({})", image.reference, image.digest),
        None => println!("previous image: none"),
    }
    let layers: usize = analyzed.metadata.buildpacks.iter().map(|bp| bp.layers.len()).sum();
    println!("known layers: {layers}");
    Ok(EXIT_SUCCESS)
}
