use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::error::PanelResult;

fn stamped_line(value: f64) -> String {
    format!("{}\t{value:.2}\n", Local::now().format("%Y-%m-%d %H:%M:%S"))
}

fn overwrite(dir: &Path, file_name: String, value: f64) -> PanelResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    fs::write(&path, stamped_line(value))?;
    Ok(path)
}

/// Writes `<base_dir>/adjustments/<basename>_adj.txt`, replacing any
/// previous value.
pub fn save_adjustment(base_dir: &Path, basename: &str, value: f64) -> PanelResult<PathBuf> {
    let path = overwrite(&base_dir.join("adjustments"), format!("{basename}_adj.txt"), value)?;
    info!(path = %path.display(), value, "adjustment saved");
    Ok(path)
}

/// Writes `<save_dir>/<basename>_wgt.txt` next to the recordings.
pub fn save_weight(save_dir: &Path, basename: &str, value: f64) -> PanelResult<PathBuf> {
    let path = overwrite(save_dir, format!("{basename}_wgt.txt"), value)?;
    info!(path = %path.display(), value, "weight saved");
    Ok(path)
}
