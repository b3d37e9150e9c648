use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use bootimg_builder::fs::build_time;
use bootimg_builder::pipeline;
use bootimg_builder::registry::DRIVERS;

#[derive(Parser, Debug)]
#[command(
    name = "bootimg-builder",
    about = "Build bootable disk images without host tools",
    long_about = "Build initrds, boot partitions and hybrid GPT/ISO9660 disk images from a JSON or TOML config"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identify a kernel executable
    Check {
        kernel: PathBuf,
    },

    /// List the supported filesystem and archive formats
    Formats,

    /// Build an image from a config file
    ///
    /// An output named initrd.rom, initrd.bin or bootpart.bin produces only
    /// that piece; any other name produces a full disk image.
    Build {
        config: PathBuf,
        output: PathBuf,

        /// Also write <output>.sha256
        #[arg(long)]
        sha256: bool,
    },
}

fn formats() {
    println!("{:<8} {:<38} initrd", "name", "partition type");
    for driver in DRIVERS {
        let guid = driver
            .type_guid
            .map(|g| g.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<38} {}",
            driver.name,
            guid,
            if driver.initrd { "yes" } else { "no" }
        );
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Check { kernel } => pipeline::check_kernel(&kernel).map(|_| ()),
        Command::Formats => {
            formats();
            Ok(())
        }
        Command::Build {
            config,
            output,
            sha256,
        } => pipeline::run_build(&config, &output, sha256, build_time()).map(|_| ()),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bootimg-builder: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
