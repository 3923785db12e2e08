use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};

use clap::{App, Arg, ArgMatches, SubCommand};
use fern;

use bam_dedup::{run_mark_duplicates, MarkDupConfig};

fn setup_logging(verbosity: u64, log_file: &Path) -> Result<(), fern::InitError> {
    let mut base_config = fern::Dispatch::new();

    base_config = match verbosity {
        0 => base_config.level(log::LevelFilter::Info),
        1 => base_config.level(log::LevelFilter::Debug),
        _ => base_config.level(log::LevelFilter::Trace),
    };

    let file_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(fern::log_file(log_file)?);

    let stdout_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%H:%M"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(io::stdout());

    base_config
        .chain(file_config)
        .chain(stdout_config)
        .apply()?;

    Ok(())
}

fn log_level_arg() -> Arg<'static, 'static> {
    Arg::<'static, 'static>::with_name("log_level")
        .short("l")
        .long("log-level")
        .value_name("NUM")
        .takes_value(true)
        .required(false)
        .help("Verbosity of logging (0 - 3)")
}

fn markdup_command(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = PathBuf::from(matches.value_of("input").expect("input bam must be provided"));
    let output = PathBuf::from(matches.value_of("output").expect("output bam must be provided"));
    let metrics = PathBuf::from(matches.value_of("metrics").expect("metrics file must be provided"));

    let mut cfg = MarkDupConfig::new(input, output, metrics);
    match matches.value_of("read_name_regex") {
        Some("null") => cfg.disable_optical = true,
        Some(pattern) => cfg.read_name_regex = Some(String::from(pattern)),
        None => {}
    }
    if let Some(value) = matches.value_of("pixel_distance") {
        cfg.pixel_distance = value.parse::<i32>()?;
    }
    if let Some(value) = matches.value_of("max_in_ram") {
        cfg.max_in_ram = value.parse::<usize>()?;
    }
    cfg.tmp_root = matches.value_of("tmp_root").map(PathBuf::from);

    run_mark_duplicates(&cfg)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let matches = App::new("bam-dedup")
        .version("0.1.0")
        .about("bam-dedup flags PCR and optical duplicates in coordinate sorted bam files.")
        .subcommand(
            SubCommand::with_name("markdup")
                .about("Find duplicates and write a flagged copy of the input.")
                .arg(
                    Arg::with_name("input")
                        .short("i")
                        .long("input")
                        .value_name("FILE")
                        .takes_value(true)
                        .required(true)
                        .help("Path to the coordinate sorted input bam.")
                )
                .arg(
                    Arg::with_name("output")
                        .short("o")
                        .long("output")
                        .value_name("FILE")
                        .takes_value(true)
                        .required(true)
                        .help("Path to the flagged output bam.")
                )
                .arg(
                    Arg::with_name("metrics")
                        .short("m")
                        .long("metrics")
                        .value_name("FILE")
                        .takes_value(true)
                        .required(true)
                        .help("Path to the duplication metrics file.")
                )
                .arg(
                    Arg::with_name("read_name_regex")
                        .long("read-name-regex")
                        .value_name("REGEX")
                        .takes_value(true)
                        .help("Three-capture regex for tile/x/y, or null to disable optical detection.")
                )
                .arg(
                    Arg::with_name("pixel_distance")
                        .long("pixel-distance")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Maximum pixel offset between optical duplicates.")
                )
                .arg(
                    Arg::with_name("max_in_ram")
                        .long("max-in-ram")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Records held in memory before spilling to disk.")
                )
                .arg(
                    Arg::with_name("tmp_root")
                        .long("tmp-root")
                        .value_name("PATH")
                        .takes_value(true)
                        .help("Directory for temporary spill files.")
                )
                .arg( log_level_arg() )
        )
        .get_matches();

    match matches.subcommand() {
        ("markdup", Some(sub_matches)) => {
            let verbosity =
                sub_matches.value_of("log_level").and_then(|v| v.parse().ok()).unwrap_or(0);
            setup_logging(verbosity, "markdup.log".as_ref())
                .expect("failed to initialize logging.");
            markdup_command(sub_matches)?;
        }
        ("", None) => eprintln!("No subcommands were provided. See help for available one."),
        _ => unreachable!(),
    };
    Ok(())
}
