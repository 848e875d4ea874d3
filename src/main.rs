use clap::*;
use clap_num::maybe_hex;
use inhume_disk::{
    create_flat_vmdk, create_raw_copy, create_sparse_vmdk, enumerate_resume_records, JobOptions,
    ResumeRecord, GRAIN_SIZE,
};
use log::{error, info, LevelFilter};
use signal_hook::consts::SIGINT;
use std::path::PathBuf;

fn list_records(log_dir: &PathBuf) {
    let records = enumerate_resume_records(log_dir);
    if records.is_empty() {
        println!("No resume records in '{}'.", log_dir.display());
        return;
    }
    for (path, record) in records {
        match record {
            ResumeRecord::RawCopy(r) => println!(
                "{}: DD copy of '{}' (serial {}) into {}/{} - {}/{} sectors",
                path.display(),
                r.device,
                r.serial,
                r.out_dir,
                r.out_name,
                r.sectors_written,
                r.total_sectors
            ),
            ResumeRecord::Sparse(r) => println!(
                "{}: sparse VMDK of '{}' (serial {}) into {}/{}.vmdk - {}/{} grains",
                path.display(),
                r.device,
                r.serial,
                r.out_dir,
                r.out_name,
                r.grains_read,
                r.total_grains
            ),
        }
    }
}

fn main() {
    let matches = Command::new("inhume_disk")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Inhume a body of data: archive a device into a DD or VMDK image.")
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The source device or file to archive."),
        )
        .arg(
            Arg::new("serial")
                .short('s')
                .long("serial")
                .value_parser(value_parser!(String))
                .default_value("")
                .help("Serial number of the source device."),
        )
        .arg(
            Arg::new("output_dir")
                .short('o')
                .long("output-dir")
                .value_parser(value_parser!(PathBuf))
                .default_value(".")
                .help("Directory the image is written into."),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_parser(value_parser!(String))
                .required(false)
                .help("Base name of the output image."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(["dd", "sparse", "flat"])
                .default_value("dd")
                .help("The image format: 'dd', 'sparse' or 'flat'."),
        )
        .arg(
            Arg::new("capacity")
                .short('c')
                .long("capacity")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Source capacity in 512-byte sectors."),
        )
        .arg(
            Arg::new("buffer_size")
                .short('b')
                .long("buffer-size")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("I/O buffer size in bytes (defaults: 4096 for dd/flat, 65536 for sparse)."),
        )
        .arg(
            Arg::new("log_dir")
                .long("log-dir")
                .value_parser(value_parser!(PathBuf))
                .default_value(".")
                .help("Directory holding resume records."),
        )
        .arg(
            Arg::new("cid")
                .long("cid")
                .value_parser(value_parser!(u32))
                .required(false)
                .help("Fixed VMDK content identifier (for reproducible output)."),
        )
        .arg(
            Arg::new("resume")
                .short('r')
                .long("resume")
                .action(ArgAction::SetTrue)
                .help("Continue from a matching resume record if one exists."),
        )
        .arg(
            Arg::new("list_resume")
                .long("list-resume")
                .action(ArgAction::SetTrue)
                .help("List resume records in the log directory and exit."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let log_dir = matches.get_one::<PathBuf>("log_dir").unwrap();
    if matches.get_flag("list_resume") {
        list_records(log_dir);
        return;
    }

    let (Some(device), Some(name), Some(capacity)) = (
        matches.get_one::<String>("device"),
        matches.get_one::<String>("name"),
        matches.get_one::<u64>("capacity"),
    ) else {
        error!("--device, --name and --capacity are required to create an image.");
        std::process::exit(1);
    };

    let format = matches.get_one::<String>("format").unwrap();
    let buffer_size = *matches
        .get_one::<u64>("buffer_size")
        .unwrap_or(if format.as_str() == "sparse" { &GRAIN_SIZE } else { &4096 });

    let mut opts = JobOptions::new(
        device.clone(),
        matches.get_one::<String>("serial").unwrap().clone(),
        matches.get_one::<PathBuf>("output_dir").unwrap().clone(),
        name.clone(),
        *capacity,
    );
    opts.buffer_size = buffer_size;
    opts.log_dir = log_dir.clone();
    opts.cid = matches.get_one::<u32>("cid").copied();

    // Ctrl-C flips the cancel flag; the running engine writes its resume
    // record and unwinds.
    if let Err(e) = signal_hook::flag::register(SIGINT, opts.cancel.clone()) {
        error!("Cannot install the SIGINT handler: {}", e);
    }

    let resume = matches.get_flag("resume");
    info!(
        "Archiving '{}' as a {} image named '{}'...",
        device, format, name
    );
    let result = match format.as_str() {
        "dd" => create_raw_copy(&opts, resume),
        "sparse" => create_sparse_vmdk(&opts, resume),
        "flat" => create_flat_vmdk(&opts, resume),
        _ => {
            error!(
                "Invalid format '{}'. Supported formats are 'dd', 'sparse' and 'flat'.",
                format
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        error!("Imaging failed: {}", e);
        std::process::exit(1);
    }
}
