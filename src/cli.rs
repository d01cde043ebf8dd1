use std::path::PathBuf;

use clap::Parser;

use crate::error::{Result, StrataError};

#[derive(Parser, Debug)]
#[command(name = "stratafs")]
#[command(
    about = "Mount an ordered stack of layer directories as a single filesystem; the topmost layer is writable"
)]
pub struct Args {
    #[arg(help = "Colon-separated layer directories, topmost (writable) first")]
    pub layers: String,

    #[arg(help = "Where to mount the merged filesystem")]
    pub mountpoint: PathBuf,
}

/// Split the colon-separated layer list. A trailing empty segment (as in
/// `/u:/l:`) is dropped; any other empty segment is a usage error.
pub fn parse_layers(list: &str) -> Result<Vec<PathBuf>> {
    let mut segments: Vec<&str> = list.split(':').collect();
    if segments.last() == Some(&"") {
        segments.pop();
    }
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(StrataError::Usage(format!("invalid layer list: {:?}", list)));
    }
    Ok(segments.into_iter().map(PathBuf::from).collect())
}
