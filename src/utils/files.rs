// backuptool/src/utils/files.rs
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::errors::Result;

/// Compares two files line by line.
///
/// The files are equal iff every line matches and both readers reach
/// end-of-content together. Line terminators are not part of the comparison,
/// so a trailing-newline or CRLF difference does not register as a change,
/// while a single character of content drift does.
pub fn files_equal(file: &Path, other: &Path) -> Result<bool> {
    let mut lines1 = BufReader::new(File::open(file)?).lines();
    let mut lines2 = BufReader::new(File::open(other)?).lines();

    loop {
        match (lines1.next(), lines2.next()) {
            (None, None) => return Ok(true),
            (Some(line1), Some(line2)) => {
                if line1? != line2? {
                    return Ok(false);
                }
            }
            // One file ended before the other.
            _ => return Ok(false),
        }
    }
}
