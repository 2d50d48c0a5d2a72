use anyhow::{bail, Context, Result};
use covhmm::track::{read_contig_blocks, ContigBlocks, CoverageHeader};
use std::path::Path;

/// Extensions accepted for coverage tracks.
const TRACK_EXTENSIONS: [&str; 2] = ["cov", "cov.gz"];

/// Checks the extension and reads a whole coverage track.
pub fn read_track(input: &Path) -> Result<(CoverageHeader, Vec<ContigBlocks>)> {
    let name = input
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if !TRACK_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(&format!(".{ext}")))
    {
        bail!(
            "input '{}' must have one of the extensions {:?}",
            input.display(),
            TRACK_EXTENSIONS
        );
    }
    read_contig_blocks(input).with_context(|| format!("unable to read '{}'", input.display()))
}

/// Requires a `.tsv` output path.
pub fn check_tsv_output(output: &Path) -> Result<()> {
    if output.extension().map_or(true, |ext| ext != "tsv") {
        bail!("output '{}' must have the tsv extension", output.display());
    }
    Ok(())
}
