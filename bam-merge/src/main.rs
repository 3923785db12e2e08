use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};

use clap::{App, Arg, ArgMatches, SubCommand};
use fern;

use bam_merge::{
    run_merge_alignment, run_merge_files, MergeConfig, MergeFilesConfig, PairOrientation,
    PrimaryStrategy, ProgramRecord, SortOrder,
};

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

fn output_arg() -> Arg<'static, 'static> {
    Arg::<'static, 'static>::with_name("output")
        .short("o")
        .long("output")
        .value_name("FILE")
        .takes_value(true)
        .required(true)
        .help("Path to the output bam file.")
}

fn verbosity_of(matches: &ArgMatches) -> u64 {
    matches.value_of("log_level").and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn paths_of(matches: &ArgMatches, name: &str) -> Vec<PathBuf> {
    matches
        .values_of(name)
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default()
}

fn parse_num<T: std::str::FromStr>(matches: &ArgMatches, name: &str, default: T) -> Result<T, Box<dyn Error>>
where
    T::Err: Error + 'static,
{
    match matches.value_of(name) {
        Some(value) => Ok(value.parse::<T>()?),
        None => Ok(default),
    }
}

fn merge_alignment_command(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let unmapped = PathBuf::from(matches.value_of("unmapped").expect("unmapped bam must be provided"));
    let output = PathBuf::from(matches.value_of("output").expect("output bam must be provided"));
    let reference = PathBuf::from(matches.value_of("reference").expect("reference must be provided"));

    let mut cfg = MergeConfig::new(unmapped, output, reference);
    cfg.aligned = paths_of(matches, "aligned");
    cfg.r1_aligned = paths_of(matches, "r1_aligned");
    cfg.r2_aligned = paths_of(matches, "r2_aligned");
    if cfg.aligned.is_empty() && cfg.r1_aligned.is_empty() {
        return Err("Either --aligned or --r1-aligned/--r2-aligned must be provided.".into());
    }

    if let Some(id) = matches.value_of("program_id") {
        cfg.program = Some(ProgramRecord {
            id: String::from(id),
            name: matches.value_of("program_name").map(String::from),
            version: matches.value_of("program_version").map(String::from),
            command: matches.value_of("program_command").map(String::from),
        });
    }

    if let Some(values) = matches.values_of("expected_orientations") {
        cfg.expected_orientations =
            values.map(PairOrientation::parse).collect::<io::Result<Vec<_>>>()?;
    } else if matches.is_present("jump_size") {
        // jumping libraries read outward
        cfg.expected_orientations = vec![PairOrientation::Rf];
    }

    if let Some(value) = matches.value_of("paired") {
        cfg.paired_run = Some(value.parse::<bool>()?);
    }
    cfg.clip_adapters = !matches.is_present("no_clip_adapters");
    cfg.bisulfite = matches.is_present("bisulfite");
    cfg.aligned_reads_only = matches.is_present("aligned_only");
    cfg.clip_overlapping = !matches.is_present("no_clip_overlaps");
    cfg.write_index = matches.is_present("write_index");
    cfg.attributes_to_retain = matches
        .values_of("retain_attr")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();
    cfg.r1_trim = parse_num(matches, "r1_trim", 0u32)?;
    cfg.r2_trim = parse_num(matches, "r2_trim", 0u32)?;
    cfg.max_gaps = parse_num(matches, "max_gaps", 1i32)?;
    cfg.max_in_ram = parse_num(matches, "max_in_ram", cfg.max_in_ram)?;
    cfg.seed = parse_num(matches, "seed", 1u64)?;
    if let Some(value) = matches.value_of("sort_order") {
        cfg.sort_order = SortOrder::parse(value)?;
    }
    if let Some(value) = matches.value_of("primary_strategy") {
        cfg.strategy = PrimaryStrategy::parse(value)?;
    }
    cfg.tmp_root = matches.value_of("tmp_root").map(PathBuf::from);

    let stats = matches.value_of("stats").map(PathBuf::from);
    run_merge_alignment(&cfg, stats.as_deref())?;
    Ok(())
}

fn merge_files_command(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let cfg = MergeFilesConfig {
        inputs: paths_of(matches, "input"),
        output: PathBuf::from(matches.value_of("output").expect("output bam must be provided")),
        sort_order: match matches.value_of("sort_order") {
            Some(value) => SortOrder::parse(value)?,
            None => SortOrder::Coordinate,
        },
        assume_sorted: matches.is_present("assume_sorted"),
        merge_dicts: matches.is_present("merge_dicts"),
        use_threading: matches.is_present("threads"),
        comments: matches
            .values_of("comment")
            .map(|values| values.map(String::from).collect())
            .unwrap_or_default(),
        max_in_ram: parse_num(matches, "max_in_ram", bam_merge::pipeline::DEFAULT_MAX_IN_RAM)?,
        tmp_root: matches.value_of("tmp_root").map(PathBuf::from),
    };
    run_merge_files(&cfg)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let matches = App::new("bam-merge")
        .version("0.1.0")
        .about("bam-merge joins unmapped bam templates with aligner output and \
                merges several bam files into one.")
        .subcommand(
            SubCommand::with_name("merge-alignment")
                .about("Merge an unmapped bam with aligned bam files.")
                .arg(
                    Arg::with_name("unmapped")
                        .short("u")
                        .long("unmapped")
                        .value_name("FILE")
                        .takes_value(true)
                        .required(true)
                        .help("Path to the query-name sorted unmapped bam.")
                )
                .arg(
                    Arg::with_name("aligned")
                        .short("a")
                        .long("aligned")
                        .value_name("FILE")
                        .takes_value(true)
                        .multiple(true)
                        .conflicts_with_all(&["r1_aligned", "r2_aligned"])
                        .help("Path to aligner output. May be given several times.")
                )
                .arg(
                    Arg::with_name("r1_aligned")
                        .long("r1-aligned")
                        .value_name("FILE")
                        .takes_value(true)
                        .multiple(true)
                        .requires("r2_aligned")
                        .help("Aligner output for read one of each pair.")
                )
                .arg(
                    Arg::with_name("r2_aligned")
                        .long("r2-aligned")
                        .value_name("FILE")
                        .takes_value(true)
                        .multiple(true)
                        .requires("r1_aligned")
                        .help("Aligner output for read two of each pair.")
                )
                .arg( output_arg() )
                .arg(
                    Arg::with_name("reference")
                        .short("r")
                        .long("reference")
                        .value_name("FASTA")
                        .takes_value(true)
                        .required(true)
                        .help("Reference fasta, indexed with a .fai next to it.")
                )
                .arg(
                    Arg::with_name("program_id")
                        .long("program-id")
                        .value_name("STR")
                        .takes_value(true)
                        .help("Program record id to add to the header.")
                )
                .arg(
                    Arg::with_name("program_name")
                        .long("program-name")
                        .value_name("STR")
                        .takes_value(true)
                        .requires("program_id")
                        .help("Program name for the added program record.")
                )
                .arg(
                    Arg::with_name("program_version")
                        .long("program-version")
                        .value_name("STR")
                        .takes_value(true)
                        .requires("program_id")
                        .help("Program version for the added program record.")
                )
                .arg(
                    Arg::with_name("program_command")
                        .long("program-command")
                        .value_name("STR")
                        .takes_value(true)
                        .requires("program_id")
                        .help("Command line for the added program record.")
                )
                .arg(
                    Arg::with_name("paired")
                        .long("paired")
                        .value_name("BOOL")
                        .takes_value(true)
                        .help("Declare whether the run is paired, checked against the input.")
                )
                .arg(
                    Arg::with_name("expected_orientations")
                        .long("expected-orientations")
                        .value_name("STR")
                        .takes_value(true)
                        .multiple(true)
                        .conflicts_with("jump_size")
                        .help("Orientations that count as proper: FR, RF or TANDEM.")
                )
                .arg(
                    Arg::with_name("jump_size")
                        .long("jump-size")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Legacy jumping library switch, implies RF orientation.")
                )
                .arg(
                    Arg::with_name("no_clip_adapters")
                        .long("no-clip-adapters")
                        .help("Do not soft clip adapter sequence marked by the XT tag.")
                )
                .arg(
                    Arg::with_name("bisulfite")
                        .long("bisulfite")
                        .help("Treat the data as bisulfite converted when recomputing NM/UQ.")
                )
                .arg(
                    Arg::with_name("aligned_only")
                        .long("aligned-only")
                        .help("Drop templates without any alignment instead of keeping them unmapped.")
                )
                .arg(
                    Arg::with_name("max_gaps")
                        .long("max-gaps")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Drop hits with more than this many insertions or deletions, -1 disables.")
                )
                .arg(
                    Arg::with_name("retain_attr")
                        .long("retain-attr")
                        .value_name("TAG")
                        .takes_value(true)
                        .multiple(true)
                        .help("Reserved aligner tags to copy anyway.")
                )
                .arg(
                    Arg::with_name("r1_trim")
                        .long("r1-trim")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Bases trimmed from read one before alignment.")
                )
                .arg(
                    Arg::with_name("r2_trim")
                        .long("r2-trim")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Bases trimmed from read two before alignment.")
                )
                .arg(
                    Arg::with_name("sort_order")
                        .short("s")
                        .long("sort-order")
                        .value_name("STR")
                        .takes_value(true)
                        .help("Output sort order: coordinate, queryname or unsorted.")
                )
                .arg(
                    Arg::with_name("no_clip_overlaps")
                        .long("no-clip-overlaps")
                        .help("Do not clip pair ends that read past their mate.")
                )
                .arg(
                    Arg::with_name("max_in_ram")
                        .long("max-in-ram")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Records held in memory before spilling to disk.")
                )
                .arg(
                    Arg::with_name("primary_strategy")
                        .long("primary-strategy")
                        .value_name("STR")
                        .takes_value(true)
                        .help("Primary hit selection: best-mapq or earliest-fragment.")
                )
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .value_name("NUM")
                        .takes_value(true)
                        .help("Seed for tie breaking in primary selection.")
                )
                .arg(
                    Arg::with_name("write_index")
                        .long("write-index")
                        .help("Build a bai index for the coordinate sorted output.")
                )
                .arg(
                    Arg::with_name("stats")
                        .long("stats")
                        .value_name("FILE")
                        .takes_value(true)
                        .help("Path to the merge statistics file.")
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
        .subcommand(
            SubCommand::with_name("merge-files")
                .about("Merge several bam files into one sorted output.")
                .arg(
                    Arg::with_name("input")
                        .short("i")
                        .long("input")
                        .value_name("FILE")
                        .takes_value(true)
                        .multiple(true)
                        .required(true)
                        .help("Input bam file. May be given several times.")
                )
                .arg( output_arg() )
                .arg(
                    Arg::with_name("sort_order")
                        .short("s")
                        .long("sort-order")
                        .value_name("STR")
                        .takes_value(true)
                        .help("Output sort order: coordinate, queryname or unsorted.")
                )
                .arg(
                    Arg::with_name("assume_sorted")
                        .long("assume-sorted")
                        .help("Trust the inputs to be sorted whatever their headers say.")
                )
                .arg(
                    Arg::with_name("merge_dicts")
                        .long("merge-dicts")
                        .help("Merge differing sequence dictionaries instead of failing.")
                )
                .arg(
                    Arg::with_name("threads")
                        .short("t")
                        .long("threads")
                        .help("Read and write on separate threads.")
                )
                .arg(
                    Arg::with_name("comment")
                        .long("comment")
                        .value_name("STR")
                        .takes_value(true)
                        .multiple(true)
                        .help("Comment line to add to the output header.")
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
        ("merge-alignment", Some(sub_matches)) => {
            setup_logging(verbosity_of(sub_matches), "merge_alignment.log".as_ref())
                .expect("failed to initialize logging.");
            merge_alignment_command(sub_matches)?;
        }
        ("merge-files", Some(sub_matches)) => {
            setup_logging(verbosity_of(sub_matches), "merge_files.log".as_ref())
                .expect("failed to initialize logging.");
            merge_files_command(sub_matches)?;
        }
        ("", None) => eprintln!("No subcommands were provided. See help for available one."),
        _ => unreachable!(),
    };
    Ok(())
}
