mod cluster;
mod config;
mod dssp;
mod fasta;
mod report;
mod runners;

use crate::cluster::ClusterParams;
use crate::config::{ProjectConfig, SystemDefaults};
use crate::runners::{CondaRunner, StageRunner};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(version, about = "Segment-redesign pipeline orchestrator", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the project configuration and run every activated stage.
    Run {
        #[arg(short, long, default_value = "./config/project.json")]
        config: PathBuf,
        #[arg(short, long, default_value = "./config/settings.json")]
        settings: PathBuf,
    },
    /// Build the design-stage report from a folder of design FASTA files.
    Report {
        #[arg(long)]
        seq_folder: PathBuf,
        #[arg(long)]
        output_folder: PathBuf,
        #[arg(long)]
        final_report_folder: Option<PathBuf>,
        #[arg(long, default_value_t = 0.5)]
        top_percent: f64,
        /// Redesigned region, e.g. "A346-394"; enables clustering when
        /// given together with --min-seq-id.
        #[arg(long)]
        position_list: Option<String>,
        #[arg(long)]
        diffusion_report_path: Option<PathBuf>,
        #[arg(long)]
        min_seq_id: Option<f64>,
        #[arg(short, long, default_value_t = 8)]
        threads: u32,
        #[arg(long, default_value_t = 0)]
        cov_mode: u32,
        #[arg(short, long, default_value_t = 0.8)]
        coverage: f64,
        #[arg(long)]
        sensitivity: Option<f64>,
        #[arg(long, default_value = "mmseqs")]
        mmseqs_path: String,
    },
    /// Cluster the designed region of every per-backbone CSV in a folder.
    Cluster {
        #[arg(short, long)]
        input_folder: PathBuf,
        #[arg(short, long)]
        output_folder: PathBuf,
        #[arg(short, long)]
        start: usize,
        #[arg(short, long)]
        end: usize,
        #[arg(short, long, default_value_t = 8)]
        threads: u32,
        #[arg(long, default_value_t = 0.5)]
        min_seq_id: f64,
        #[arg(long, default_value_t = 0)]
        cov_mode: u32,
        #[arg(short, long, default_value_t = 0.8)]
        coverage: f64,
        #[arg(long, default_value = "mmseqs")]
        mmseqs_path: String,
    },
    /// Convert a DSSP file into the structured per-residue CSV.
    DsspCsv {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Commands::Run { config, settings } => run_pipeline(&config, &settings).await,
        Commands::Report {
            seq_folder,
            output_folder,
            final_report_folder,
            top_percent,
            position_list,
            diffusion_report_path,
            min_seq_id,
            threads,
            cov_mode,
            coverage,
            sensitivity,
            mmseqs_path,
        } => {
            let clustering = min_seq_id.map(|min_seq_id| ClusterParams {
                threads,
                min_seq_id,
                cov_mode,
                coverage,
                sensitivity,
                mmseqs_path,
            });
            let final_report_folder = final_report_folder.unwrap_or_else(|| {
                output_folder
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| output_folder.clone())
            });
            design_report(&DesignReportOptions {
                seq_folder,
                output_folder,
                final_report_folder,
                top_percent,
                position_list,
                diffusion_report_path,
                clustering,
            })
            .await
        }
        Commands::Cluster {
            input_folder,
            output_folder,
            start,
            end,
            threads,
            min_seq_id,
            cov_mode,
            coverage,
            mmseqs_path,
        } => {
            let params = ClusterParams {
                threads,
                min_seq_id,
                cov_mode,
                coverage,
                sensitivity: None,
                mmseqs_path,
            };
            cluster::cluster_folder(&input_folder, &output_folder, start, end, &params).await?;
            Ok(())
        }
        Commands::DsspCsv { input, output } => dssp::dssp_to_csv(&input, &output),
    }
}

async fn run_pipeline(config_path: &Path, settings_path: &Path) -> Result<()> {
    let project = ProjectConfig::from_file(config_path)?;
    let defaults = SystemDefaults::from_file(settings_path)?;

    // Fail fast: the whole stage set resolves before anything runs.
    let stages = config::resolve(&project, &defaults)?;
    if stages.is_empty() {
        warn!("No stages activated by {:?}, nothing to do", config_path);
        return Ok(());
    }
    info!(
        "Pipeline stages: {}",
        stages
            .iter()
            .map(|s| s.name)
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let output_dir = PathBuf::from(&project.project.output_dir);
    std::fs::create_dir_all(&output_dir)
        .context(format!("Failed to create output directory {:?}", output_dir))?;
    std::fs::copy(config_path, output_dir.join("project.json"))
        .context("Failed to copy project config into the output directory")?;

    let runner = CondaRunner::new(project.project.conda_root.clone(), &defaults.modules);
    for stage in &stages {
        // The design report (and its clustering post-pass) is native; all
        // other stages cross the process boundary.
        if stage.name == "design_report" {
            let options = DesignReportOptions::from_stage_args(&stage.args)?;
            design_report(&options).await?;
        } else {
            runner.run(stage).await?;
        }
        info!("Stage `{}` finished", stage.name);
    }

    info!("All {} stages completed", stages.len());
    Ok(())
}

struct DesignReportOptions {
    seq_folder: PathBuf,
    output_folder: PathBuf,
    final_report_folder: PathBuf,
    top_percent: f64,
    position_list: Option<String>,
    diffusion_report_path: Option<PathBuf>,
    clustering: Option<ClusterParams>,
}

impl DesignReportOptions {
    fn from_stage_args(args: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            args.get(key)
                .cloned()
                .context(format!("design_report stage is missing `{}`", key))
        };
        let clustering = if args.contains_key("min_seq_id") {
            Some(ClusterParams {
                threads: args
                    .get("threads")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8),
                min_seq_id: args
                    .get("min_seq_id")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.8),
                cov_mode: args
                    .get("cov_mode")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                coverage: args
                    .get("coverage")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.8),
                sensitivity: args.get("sensitivity").and_then(|v| v.parse().ok()),
                mmseqs_path: args
                    .get("mmseqs_path")
                    .cloned()
                    .unwrap_or_else(|| "mmseqs".to_string()),
            })
        } else {
            None
        };

        Ok(Self {
            seq_folder: PathBuf::from(get("seq_folder")?),
            output_folder: PathBuf::from(get("output_folder")?),
            final_report_folder: PathBuf::from(get("final_report_folder")?),
            top_percent: args
                .get("top_percent")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5),
            position_list: args.get("position_list").cloned(),
            diffusion_report_path: args.get("diffusion_report_path").map(PathBuf::from),
            clustering,
        })
    }
}

/// Strips the leading chain letter from a position list: "A346-394"
/// becomes "346-394".
fn segment_label(position_list: &str) -> &str {
    position_list.trim_start_matches(|c: char| c.is_ascii_alphabetic())
}

/// The design-report pipeline: per-backbone CSVs, top-percentile
/// filtering, optional clustering of the top set, final unified report,
/// and the whether_pass annotation when clustering results exist.
async fn design_report(options: &DesignReportOptions) -> Result<()> {
    let diffusion_report = options
        .diffusion_report_path
        .clone()
        .unwrap_or_else(|| options.final_report_folder.join("diffusion_report.csv"));
    let region = options
        .position_list
        .as_deref()
        .and_then(report::parse_position_range);

    let outcome = report::build_stage_report(
        &options.seq_folder,
        &options.output_folder,
        options.top_percent,
        region,
        &diffusion_report,
    )?;
    info!(
        "Stage report built: {} backbone CSVs, {} top CSVs",
        outcome.seqs_csv_files.len(),
        outcome.top_csv_files.len()
    );

    if let Some(params) = &options.clustering {
        match region {
            Some((start, end)) => {
                cluster::cluster_folder(
                    &outcome.top_folder,
                    &options.output_folder,
                    start,
                    end,
                    params,
                )
                .await?;
            }
            None => warn!("Clustering requested but no usable position_list, skipping"),
        }
    }

    let segment = options
        .position_list
        .as_deref()
        .map(segment_label)
        .unwrap_or_default();
    let report_path = report::write_final_report(
        &outcome.seqs_csv_files,
        segment,
        &options.final_report_folder,
    )?;

    let results_folder = options.output_folder.join("results");
    if !report::annotate_whether_pass(&report_path, &results_folder)? {
        info!("whether_pass column omitted (no clustering results yet)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_label_strips_chain_letter() {
        assert_eq!(segment_label("A346-394"), "346-394");
        assert_eq!(segment_label("346-394"), "346-394");
    }

    #[test]
    fn stage_args_round_trip_into_options() {
        let mut args = BTreeMap::new();
        args.insert("seq_folder".to_string(), "./out/design_out/seqs".to_string());
        args.insert("output_folder".to_string(), "./out/design_out".to_string());
        args.insert("final_report_folder".to_string(), "./out".to_string());
        args.insert("top_percent".to_string(), "0.2".to_string());
        args.insert("position_list".to_string(), "A346-394".to_string());
        args.insert("min_seq_id".to_string(), "0.9".to_string());

        let options = DesignReportOptions::from_stage_args(&args).unwrap();
        assert_eq!(options.top_percent, 0.2);
        assert_eq!(options.position_list.as_deref(), Some("A346-394"));
        let clustering = options.clustering.unwrap();
        assert_eq!(clustering.min_seq_id, 0.9);
        assert_eq!(clustering.threads, 8);
    }

    #[test]
    fn missing_required_stage_arg_is_an_error() {
        let args = BTreeMap::new();
        assert!(DesignReportOptions::from_stage_args(&args).is_err());
    }
}
