//! README badge substitution.
//!
//! Replaces the three numbers in
//! `➕ 增加行数: N ➖ 删除行数: N 🖼️ 图片贡献: N` with the run totals. Everything
//! else in the file is left byte-for-byte intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use tracing::{info, warn};

use crate::{StatsError, Totals};

const STATS_PATTERN: &str = r"(➕ 增加行数: )\d+( ➖ 删除行数: )\d+( 🖼️ 图片贡献: )\d+";

/// Substitute `totals` into every stats line. Returns the new text and the
/// number of lines replaced.
pub fn render(content: &str, totals: &Totals) -> Result<(String, usize), StatsError> {
    let re = Regex::new(STATS_PATTERN)
        .map_err(|e| StatsError::InvalidArgs(format!("Invalid stats pattern: {}", e)))?;

    let count = re.find_iter(content).count();
    let rendered = re.replace_all(content, |caps: &Captures| {
        format!(
            "{}{}{}{}{}{}",
            &caps[1], totals.additions, &caps[2], totals.deletions, &caps[3], totals.images
        )
    });
    Ok((rendered.into_owned(), count))
}

/// Rewrite the stats line(s) of the file at `path` in place (atomically).
///
/// Returns how many lines were replaced. A file without a stats line is left
/// untouched.
pub fn update(path: &Path, totals: &Totals) -> Result<usize, StatsError> {
    let content = fs::read_to_string(path)?;
    let (rendered, count) = render(&content, totals)?;

    if count == 0 {
        warn!(path = %path.display(), "No stats line found in README");
        return Ok(0);
    }
    if rendered != content {
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(rendered.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
    }

    info!(
        path = %path.display(),
        additions = totals.additions,
        deletions = totals.deletions,
        images = totals.images,
        "README updated"
    );
    Ok(count)
}
