//! Output-path guards.
//!
//! Both binaries overwrite their targets in place, and the worst possible
//! target is one of our own state files or the file being read. The
//! protected list is derived from the store layout in [`crate::config`]
//! rather than maintained by hand, so a renamed state file stays guarded.

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::{MAPPINGS_DB_FILE, OFFLINE_DB_FILE};

/// Refuse to write `output` unless it is not an application state file,
/// differs from every input path, and its filename carries the caller's
/// `marker`.
///
/// A state file is exempt only for the caller that owns it: the marker
/// must be part of the state filename itself, which is how the DB builder
/// (marker "optimized") is allowed to produce [`OFFLINE_DB_FILE`] while no
/// export writer can touch either database.
pub fn check_output_path(output: &Path, marker: &str, inputs: &[&Path]) -> Result<()> {
    let name = output.file_name().and_then(|n| n.to_str()).unwrap_or("");

    for state_file in [OFFLINE_DB_FILE, MAPPINGS_DB_FILE] {
        if name == state_file && !state_file.contains(marker) {
            bail!(
                "refusing to overwrite the application state file {}",
                output.display()
            );
        }
    }
    if !name.contains(marker) {
        bail!(
            "refusing to write {}: the filename must contain '{marker}'",
            output.display()
        );
    }
    for input in inputs {
        if output == *input {
            bail!(
                "refusing to overwrite the input file {} with its own output",
                input.display()
            );
        }
    }
    Ok(())
}
