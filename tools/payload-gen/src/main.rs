// Licensed under the Apache-2.0 license

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hss_payload_generator::{generate_file, ImageSummary};
use log::LevelFilter;
use simple_logger::SimpleLogger;

#[derive(Parser)]
#[command(version, about = "Hart Software Services boot image generator", long_about = None)]
struct Cli {
    /// Increase verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a boot image from a TOML configuration
    Generate {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Replace the set name from the configuration
        #[arg(short = 'n', long)]
        set_name: Option<String>,

        output: PathBuf,
    },
    /// Validate a boot image and print its tables
    Dump {
        image: PathBuf,

        /// Print as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new().with_level(level).init()?;

    match cli.command {
        Commands::Generate {
            config,
            set_name,
            output,
        } => {
            let len = generate_file(&config, &output, set_name.as_deref())?;
            println!("Wrote {} bytes to {}", len, output.display());
        }
        Commands::Dump { image, json } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("cannot read {}", image.display()))?;
            let summary = ImageSummary::from_image(&bytes)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render());
            }
        }
    }
    Ok(())
}
