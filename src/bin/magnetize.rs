//! magnetize - prints a magnet URI for each local file argument.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::Parser;

use radc::net::url_encode;
use radc::treehash;

#[derive(Parser, Debug)]
#[command(
    name = "magnetize",
    version,
    about = "Prints tiger-tree magnet URIs for local files"
)]
struct Args {
    /// Files to hash.
    files: Vec<PathBuf>,

    /// Exact source appended as xs= (an adc/adcs hub URL).
    #[clap(short, long)]
    source: Option<String>,
}

fn main() {
    let args = Args::parse();
    if args.files.is_empty() {
        eprintln!("magnetize: no files given");
        std::process::exit(1);
    }

    let mut failed = false;
    for path in &args.files {
        match emit(path, args.source.as_deref()) {
            Ok(Some(line)) => println!("{line}"),
            Ok(None) => {}
            Err(e) => {
                eprintln!("magnetize: {}: {e}", path.display());
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}

/// Hashes one file into its magnet line. Directories and empty files
/// are skipped with a note rather than treated as errors.
fn emit(path: &Path, source: Option<&str>) -> std::io::Result<Option<String>> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_dir() {
        eprintln!("magnetize: skipping directory {}", path.display());
        return Ok(None);
    }
    if metadata.len() == 0 {
        eprintln!("magnetize: skipping empty file {}", path.display());
        return Ok(None);
    }

    let reader = BufReader::new(File::open(path)?);
    let (root, size) = treehash::hash_reader(reader)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut uri = format!(
        "magnet:?dn={}&xl={}&xt=urn:tree:tiger:{}",
        url_encode(&name),
        size,
        root
    );
    if let Some(source) = source {
        uri.push_str(&format!("&xs={}", url_encode(source)));
    }
    Ok(Some(uri))
}
