//! Program loading for a domain
//!
//! Structural validation lives in [`ProgramImage::from_bytes`]; this adds the
//! per-domain policy the host supplies.

use progs_vm_bytecode::{ProgramFormatError, ProgramImage};
use tracing::{debug, warn};

use crate::config::LoadOptions;
use crate::domain::Domain;
use crate::error::VmResult;

/// Decode, validate and check an image for `domain`
pub fn load_program(domain: Domain, bytes: &[u8], options: &LoadOptions) -> VmResult<ProgramImage> {
    let result = ProgramImage::from_bytes(bytes).and_then(|image| {
        check_image(&image, options)?;
        Ok(image)
    });

    match result {
        Ok(image) => {
            debug!(
                %domain,
                checksum = image.checksum(),
                statements = image.statements().len(),
                functions = image.functions().len(),
                globals = image.initial_globals().len(),
                entity_cells = image.entity_cells(),
                "loaded program"
            );
            Ok(image)
        }
        Err(e) => {
            warn!(%domain, error = %e, "program rejected");
            Err(e.into())
        }
    }
}

fn check_image(image: &ProgramImage, options: &LoadOptions) -> Result<(), ProgramFormatError> {
    if let Some(expected) = options.expected_checksum
        && expected != image.checksum()
    {
        return Err(ProgramFormatError::ChecksumMismatch {
            expected,
            found: image.checksum(),
        });
    }

    let missing = |kind: &'static str, name: &String| ProgramFormatError::MissingRequired {
        kind,
        name: name.clone(),
    };
    if let Some(name) = options
        .required_functions
        .iter()
        .find(|name| image.find_function(name).is_none())
    {
        return Err(missing("function", name));
    }
    if let Some(name) = options
        .required_fields
        .iter()
        .find(|name| image.find_field(name).is_none())
    {
        return Err(missing("field", name));
    }
    if let Some(name) = options
        .required_globals
        .iter()
        .find(|name| image.find_global(name).is_none())
    {
        return Err(missing("global", name));
    }
    Ok(())
}
