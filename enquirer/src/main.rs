//! Command line front-end of the series enquirer.
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dicom_dump::DumpOptions;
use dicom_enquirer::{
    PacsConfiguration, RetrieveMethod, SeriesEnquirer, SeriesFilter, SeriesRetriever,
};
use indicatif::{ProgressBar, ProgressStyle};
use snafu::{OptionExt, Report, ResultExt, Snafu};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// DICOM series enquirer: find, retrieve and store series on a PACS
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address of the PACS (example: "127.0.0.1:104")
    addr: String,

    /// verbose mode
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "ENQUIRER", global = true)]
    calling_ae_title: String,
    /// the called AE title
    #[arg(long = "called-ae-title", default_value = "ANY-SCP", global = true)]
    called_ae_title: String,
    /// the C-MOVE destination AE title
    #[arg(long = "move-destination", global = true)]
    move_destination: Option<String>,
    /// the maximum PDU length
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072)),
        global = true
    )]
    max_pdu_length: u32,
    /// only propose native/uncompressed transfer syntaxes
    #[arg(long, global = true)]
    uncompressed_only: bool,
    /// output directory for retrieved series
    /// (default: "dicom" in the temporary directory)
    #[arg(short = 'o', long = "out-dir", global = true)]
    out_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the PACS answers
    Echo,
    /// Search for series
    Find {
        /// text to find in any attribute
        #[arg(long)]
        search: Option<String>,
        /// part of the patient name
        #[arg(long)]
        patient_name: Option<String>,
        /// part of the patient ID
        #[arg(long)]
        patient_id: Option<String>,
        /// patient birth date (YYYYMMDD)
        #[arg(long)]
        birth_date: Option<String>,
        /// part of the series instance UID
        #[arg(long)]
        series_uid: Option<String>,
        /// part of the series description
        #[arg(long)]
        description: Option<String>,
        /// modality
        #[arg(long)]
        modality: Option<String>,
        /// first study date (YYYYMMDD)
        #[arg(long, requires = "to")]
        from: Option<String>,
        /// last study date (YYYYMMDD)
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    /// Retrieve series with C-GET
    Get {
        /// series instance UIDs
        #[arg(required = true)]
        series: Vec<String>,
        /// retrieve only this SOP instance of the (single) series
        #[arg(long)]
        instance: Option<String>,
    },
    /// Retrieve series with C-MOVE
    Move {
        /// series instance UIDs
        #[arg(required = true)]
        series: Vec<String>,
        /// retrieve only this SOP instance of the (single) series
        #[arg(long)]
        instance: Option<String>,
        /// receive the objects here, listening on this port
        #[arg(long)]
        listen: Option<u16>,
    },
    /// Store DICOM files, or directories of DICOM files
    Push {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("invalid address `{addr}`, expected HOST:PORT"))]
    InvalidAddress { addr: String },
    #[snafu(display("{operation} failed"))]
    Enquirer {
        operation: &'static str,
        source: dicom_enquirer::Error,
    },
    #[snafu(display("C-MOVE destination AE title is required"))]
    MissingMoveDestination,
    #[snafu(display("--instance takes exactly one series"))]
    InstanceOfManySeries,
    /// Could not dump a search result
    DumpOutput { source: std::io::Error },
}

fn main() {
    let app = App::parse();

    let directive = if app.verbose {
        "dicom_enquirer=debug"
    } else {
        "dicom_enquirer=info"
    };
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = directive.parse() {
        filter = filter.add_directive(directive);
    }
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_env_filter(filter)
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    run(app).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(-2);
    });
}

fn parse_address(addr: &str) -> Result<(String, u16), Error> {
    let (host, port) = addr
        .rsplit_once(':')
        .context(InvalidAddressSnafu { addr })?;
    let port = port
        .parse()
        .ok()
        .context(InvalidAddressSnafu { addr })?;
    Ok((host.to_string(), port))
}

fn configuration(app: &App) -> Result<PacsConfiguration, Error> {
    let (host, port) = parse_address(&app.addr)?;
    let mut config = PacsConfiguration::new(
        app.calling_ae_title.as_str(),
        host,
        port,
        app.called_ae_title.as_str(),
    )
    .with_max_pdu_length(app.max_pdu_length)
    .with_uncompressed_only(app.uncompressed_only);
    if let Some(move_destination) = &app.move_destination {
        config = config.with_move_ae_title(move_destination.as_str());
    }
    if let Some(out_dir) = &app.out_dir {
        config = config.with_working_directory(out_dir);
    }
    Ok(config)
}

fn progress_bar(len: Option<usize>) -> ProgressBar {
    let (pb, template) = match len {
        Some(len) => (
            ProgressBar::new(len as u64),
            "[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}",
        ),
        None => (ProgressBar::new_spinner(), "[{elapsed_precise}] {spinner} {pos} {wide_msg}"),
    };
    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(480));
    pb
}

fn reporter(pb: &ProgressBar) -> dicom_enquirer::ProgressCallback {
    let pb = pb.clone();
    Box::new(move |series: &str, index: usize, path: &str| {
        pb.set_position(index as u64);
        if path.is_empty() {
            pb.set_message(series.to_string());
        } else {
            pb.set_message(path.to_string());
        }
    })
}

fn run(app: App) -> Result<(), Error> {
    let mut config = configuration(&app)?;
    let mut enquirer = SeriesEnquirer::new();

    let pb = match &app.command {
        Command::Get { .. } | Command::Move { .. } => Some(progress_bar(None)),
        Command::Push { .. } => Some(progress_bar(Some(0))),
        _ => None,
    };

    if let Command::Move { listen: Some(port), .. } = &app.command {
        let ae_title = app
            .move_destination
            .clone()
            .context(MissingMoveDestinationSnafu)?;
        let mut retriever =
            SeriesRetriever::bind(ae_title, ("0.0.0.0", *port), &config.working_directory)
                .context(EnquirerSnafu {
                    operation: "Listening for C-MOVE sub-operations",
                })?;
        if let Some(pb) = &pb {
            retriever = retriever.with_progress(reporter(pb));
        }
        std::thread::spawn(move || {
            if let Err(e) = retriever.serve() {
                error!("{}", Report::from_error(e));
            }
        });
    }

    match &app.command {
        Command::Get { .. } => config = config.with_retrieve_method(RetrieveMethod::Get),
        Command::Move { .. } => config = config.with_retrieve_method(RetrieveMethod::Move),
        _ => {}
    }

    enquirer
        .initialize_with(&config, pb.as_ref().map(reporter))
        .context(EnquirerSnafu {
            operation: "Initialization",
        })?;
    enquirer.connect().context(EnquirerSnafu {
        operation: "Connection",
    })?;

    match app.command {
        Command::Echo => {
            if enquirer.ping_pacs() {
                info!("{} answered C-ECHO", config.peer_ae_title);
            } else {
                warn!("{} did not answer C-ECHO", config.peer_ae_title);
            }
        }
        Command::Find {
            search,
            patient_name,
            patient_id,
            birth_date,
            series_uid,
            description,
            modality,
            from,
            to,
        } => {
            let mut filter = SeriesFilter {
                search: search.unwrap_or_default(),
                patient_name: patient_name.unwrap_or_default(),
                patient_birth_date: birth_date.unwrap_or_default(),
                patient_id: patient_id.unwrap_or_default(),
                series_uid: series_uid.unwrap_or_default(),
                series_description: description.unwrap_or_default(),
                modality: modality.unwrap_or_default(),
                study_date_range: None,
            };
            if let (Some(from), Some(to)) = (from, to) {
                filter = filter.with_study_date_range(from, to);
            }
            let results = filter.search(&mut enquirer).context(EnquirerSnafu {
                operation: "C-FIND",
            })?;
            for result in &results {
                DumpOptions::new()
                    .dump_object(result)
                    .context(DumpOutputSnafu)?;
            }
            info!("{} series found", results.len());
        }
        Command::Get { series, instance } | Command::Move { series, instance, .. } => {
            let result = match instance {
                Some(instance) => {
                    let [series] = series.as_slice() else {
                        return InstanceOfManySeriesSnafu.fail();
                    };
                    match config.retrieve_method {
                        RetrieveMethod::Get => {
                            enquirer.pull_instance_using_get_retrieve_method(series, &instance)
                        }
                        RetrieveMethod::Move => {
                            enquirer.pull_instance_using_move_retrieve_method(series, &instance)
                        }
                    }
                }
                None => enquirer.pull_series(&series),
            };
            result.context(EnquirerSnafu {
                operation: "Retrieval",
            })?;
            if let Some(pb) = &pb {
                pb.finish_with_message("done");
            }
            info!(
                "Series stored under {}",
                enquirer.working_directory().display()
            );
        }
        Command::Push { paths } => {
            let mut files = Vec::new();
            for path in paths {
                if path.is_dir() {
                    for entry in WalkDir::new(&path)
                        .into_iter()
                        .filter_map(Result::ok)
                        .filter(|f| !f.file_type().is_dir())
                    {
                        files.push(entry.into_path());
                    }
                } else {
                    files.push(path);
                }
            }
            if let Some(pb) = &pb {
                pb.set_length(files.len() as u64);
            }
            enquirer.push_series(&files).context(EnquirerSnafu {
                operation: "C-STORE",
            })?;
            if let Some(pb) = &pb {
                pb.finish_with_message("done");
            }
            info!("{} file(s) stored", files.len());
        }
    }

    enquirer.disconnect();
    Ok(())
}
