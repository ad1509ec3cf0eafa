use super::{export::print_report, parse_ref, parse_refs, EXIT_SUCCESS};
use kiln_core::{CoreError, CreateOptions, Engine, ExportOptions};
use kiln_schema::{read_record, Order};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct CreateArgs<'a> {
    pub order: &'a Path,
    pub images: &'a [String],
    pub previous_image: Option<&'a str>,
    pub run_image: &'a str,
}

pub fn run(engine: &Engine, args: CreateArgs<'_>, json: bool) -> Result<u8, CoreError> {
    let order: Order = read_record(args.order)?;
    let opts = CreateOptions {
        order,
        previous_image: args.previous_image.map(parse_ref).transpose()?,
        export: ExportOptions {
            images: parse_refs(args.images)?,
            run_image: parse_ref(args.run_image)?,
        },
    };
    let report = engine.create(&opts)?;
    print_report(&report, json)?;
    Ok(EXIT_SUCCESS)
}
