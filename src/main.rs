use clap::error::ErrorKind;
use clap::Parser;

use stratafs::cli::{self, Args};
use stratafs::error::Result;
use stratafs::overlay::mount;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("STRATAFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return Ok(0);
        }
        Err(e) => {
            let _ = e.print();
            return Ok(1);
        }
    };

    let layers = cli::parse_layers(&args.layers)?;
    mount::serve(layers, &args.mountpoint)?;
    Ok(0)
}
