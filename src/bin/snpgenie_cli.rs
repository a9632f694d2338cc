use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use serde::Serialize;
use snpgenie::{
    Pipeline, Stage, about,
    pipeline::RunAllFailure,
    project::ProjectStore,
    scheduler::TaskFailure,
    settings::PipelineSettings,
    stages::StageReport,
    tool_overrides::{apply_tool_overrides, resolution_table},
    tools::Toolkit,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

const DEFAULT_PROJECT_PATH: &str = ".snpgenie_state.snpgenie";

#[derive(Parser)]
#[command(
    name = "snpgenie_cli",
    about = "Trim, align, call variants and build SNP alignments for bacterial NGS reads"
)]
struct Cli {
    /// Print version and build information
    #[arg(short = 'V', long)]
    version: bool,
    /// Project file holding the working session
    #[arg(long, default_value = DEFAULT_PROJECT_PATH)]
    project: PathBuf,
    /// JSON settings file
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Override the thread count from the settings
    #[arg(long)]
    threads: Option<usize>,
    /// Re-run tools even when their outputs exist
    #[arg(long)]
    overwrite: bool,
    /// Folder holding the preset reference genomes
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start an empty project
    New,
    /// Add FASTQ files to the sample table
    AddFiles { files: Vec<PathBuf> },
    /// Add every FASTQ file in a folder
    AddFolder { dir: PathBuf },
    /// Set (and create) the output folder
    SetOutput { dir: PathBuf },
    /// Set the reference genome FASTA
    SetReference { path: PathBuf },
    /// Set the GenBank annotation of the reference
    SetAnnotation { path: PathBuf },
    /// Use a named reference preset from the data folder
    Preset { name: String },
    /// Left-join a CSV/TSV table into the sample table
    MergeMetadata {
        table: PathBuf,
        /// Sample table column to join on
        #[arg(long, default_value = "sample")]
        local_key: String,
        /// External table column to join on
        #[arg(long)]
        external_key: String,
    },
    /// Print the annotation feature table
    Annotation,
    /// Run a single stage
    Run {
        #[arg(value_enum)]
        stage: Stage,
    },
    /// Trim, align and call variants in sequence
    RunAll,
    /// Remove intermediate files from the output folder
    Cleanup,
    /// Print the session as JSON
    Summary,
    /// Print how each external tool resolves
    Tools,
    /// Save the session to another project file
    SaveAs { path: PathBuf },
}

#[derive(Serialize)]
struct SampleSummary {
    name: String,
    sample: String,
    filename: PathBuf,
    read_length: Option<u64>,
    trimmed: Option<PathBuf>,
    bam_file: Option<PathBuf>,
}

#[derive(Serialize)]
struct SessionSummary {
    sample_count: usize,
    samples: Vec<SampleSummary>,
    reference: Option<PathBuf>,
    annotation: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    project_file: Option<PathBuf>,
    results: Vec<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Could not serialize JSON output: {e}"))?;
    println!("{text}");
    Ok(())
}

fn summarize(pipeline: &Pipeline) -> SessionSummary {
    pipeline.with_session(|session| {
        let samples: Vec<SampleSummary> = session
            .samples
            .iter()
            .map(|s| SampleSummary {
                name: s.name.clone(),
                sample: s.sample.clone(),
                filename: s.filename.clone(),
                read_length: s.read_length,
                trimmed: s.trimmed().map(Path::to_path_buf),
                bam_file: s.bam_file().map(Path::to_path_buf),
            })
            .collect();
        SessionSummary {
            sample_count: samples.len(),
            samples,
            reference: session.reference.sequence_path.clone(),
            annotation: session.reference.annotation_path.clone(),
            output_dir: session.output_dir.clone(),
            project_file: session.project_file.clone(),
            results: session.results.keys().cloned().collect(),
        }
    })
}

fn load_settings(cli: &Cli) -> Result<PipelineSettings, String> {
    let mut settings = match &cli.settings {
        Some(path) => PipelineSettings::load_from_path(path).map_err(|e| e.to_string())?,
        None => PipelineSettings::default(),
    };
    if let Some(threads) = cli.threads {
        settings.threads = threads;
    }
    if cli.overwrite {
        settings.overwrite = true;
    }
    settings.validate().map_err(|e| e.to_string())?;
    Ok(settings)
}

fn print_progress(message: &str) {
    println!("{message}");
}

fn run_stage(pipeline: &Pipeline, stage: Stage) -> Result<StageReport, String> {
    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    pipeline
        .run_stage(stage, print_progress, move |result| {
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(result);
            }
        })
        .map_err(|e| e.to_string())?;
    pipeline.wait(None);
    let result = outcome
        .lock()
        .map_err(|_| "Stage outcome lock poisoned".to_string())?
        .take()
        .ok_or_else(|| format!("{stage} finished without reporting an outcome"))?;
    result.map_err(|failure: TaskFailure| {
        debug!("{}", failure.trace);
        failure.to_string()
    })
}

fn run_all(pipeline: &Pipeline) -> Result<Vec<StageReport>, String> {
    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    pipeline
        .run_all(print_progress, move |result| {
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(result);
            }
        })
        .map_err(|e| e.to_string())?;
    pipeline.wait(None);
    let result = outcome
        .lock()
        .map_err(|_| "Run-all outcome lock poisoned".to_string())?
        .take()
        .ok_or_else(|| "run-all finished without reporting an outcome".to_string())?;
    result.map_err(|failure: RunAllFailure| {
        format!(
            "run-all stopped at {} after {} stage(s): {}",
            failure.stage,
            failure.completed.len(),
            failure.failure
        )
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", about::version_cli_text());
        return Ok(());
    }
    let Some(command) = &cli.command else {
        return Err("Missing command; see --help".to_string());
    };

    let project = ProjectStore::normalized_path(&cli.project);
    let pipeline = Pipeline::new(Toolkit::system(), load_settings(&cli)?)
        .map_err(|e| e.to_string())?;
    if project.exists() && !matches!(command, Command::New) {
        pipeline.load_project(&project).map_err(|e| e.to_string())?;
    }
    let save = |pipeline: &Pipeline| -> Result<(), String> {
        pipeline
            .save_project(Some(&project))
            .map(|_| ())
            .map_err(|e| e.to_string())
    };

    match command {
        Command::New => {
            pipeline.new_project().map_err(|e| e.to_string())?;
            save(&pipeline)?;
            println!("Started a new project in '{}'", project.display());
            Ok(())
        }
        Command::AddFiles { files } => {
            let added = pipeline.add_samples(files).map_err(|e| e.to_string())?;
            save(&pipeline)?;
            println!("Added {added} sample(s)");
            Ok(())
        }
        Command::AddFolder { dir } => {
            let added = pipeline.add_folder(dir).map_err(|e| e.to_string())?;
            save(&pipeline)?;
            println!("Added {added} sample(s) from '{}'", dir.display());
            Ok(())
        }
        Command::SetOutput { dir } => {
            pipeline.set_output_dir(dir).map_err(|e| e.to_string())?;
            save(&pipeline)?;
            println!("Output folder set to '{}'", dir.display());
            Ok(())
        }
        Command::SetReference { path } => {
            let change = pipeline.set_reference(path).map_err(|e| e.to_string())?;
            save(&pipeline)?;
            if change.stale_alignments {
                eprintln!("Existing alignments were made against another reference; re-run align");
            }
            print_json(&change)
        }
        Command::SetAnnotation { path } => {
            let result = pipeline.set_annotation(path);
            // the path is kept even when parsing fails
            save(&pipeline)?;
            let count = result.map_err(|e| e.to_string())?;
            println!("Annotation has {count} feature(s)");
            Ok(())
        }
        Command::Preset { name } => {
            let change = pipeline
                .apply_preset(name, cli.data_dir.as_deref())
                .map_err(|e| e.to_string())?;
            save(&pipeline)?;
            print_json(&change)
        }
        Command::MergeMetadata {
            table,
            local_key,
            external_key,
        } => {
            let merged = pipeline
                .merge_metadata(table, local_key, external_key)
                .map_err(|e| e.to_string())?;
            save(&pipeline)?;
            println!("Merged metadata into {merged} sample(s)");
            Ok(())
        }
        Command::Annotation => {
            let table = pipeline.annotation_table().map_err(|e| e.to_string())?;
            print_json(&table)
        }
        Command::Run { stage } => {
            let result = run_stage(&pipeline, *stage);
            // rows written before a failure are kept
            save(&pipeline)?;
            print_json(&result?)
        }
        Command::RunAll => {
            let result = run_all(&pipeline);
            save(&pipeline)?;
            print_json(&result?)
        }
        Command::Cleanup => {
            let report = pipeline.cleanup().map_err(|e| e.to_string())?;
            save(&pipeline)?;
            print_json(&report)
        }
        Command::Summary => {
            print_json(&summarize(&pipeline))
        }
        Command::Tools => {
            apply_tool_overrides(&pipeline.settings().tools);
            let table: Vec<_> = resolution_table()
                .into_iter()
                .map(|(tool, resolved)| {
                    serde_json::json!({ "tool": tool, "resolved": resolved })
                })
                .collect();
            print_json(&table)
        }
        Command::SaveAs { path } => {
            let written = pipeline
                .save_project(Some(path))
                .map_err(|e| e.to_string())?;
            println!("Saved project to '{}'", written.display());
            Ok(())
        }
    }
}
