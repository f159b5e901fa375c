use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised during stage resolution. All of them abort the run before
/// any stage executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("stage `{stage}` is missing required setting `{key}`")]
    MissingKey { stage: String, key: String },
    #[error("no execution environment configured for stage `{0}` and no `main` fallback")]
    MissingEnvironment(String),
    #[error("diffusion stage must request exactly one of `helix` or `strand`")]
    AmbiguousStructuralClass,
}

fn default_chain() -> String {
    "A".to_string()
}

fn default_output_dir() -> String {
    "./output".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ProjectSection {
    pub input_pdb: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    /// 1-based inclusive residue range under redesign, e.g. "346-394".
    /// Its presence gates the diffusion, design and fold stages.
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub sequence_length: Option<u64>,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub conda_root: Option<String>,
}

/// The user-authored project description. A present per-stage section,
/// even an empty one, activates its stage.
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    #[serde(default)]
    pub profile: Option<Map<String, Value>>,
    #[serde(default)]
    pub diffusion: Option<Map<String, Value>>,
    #[serde(default)]
    pub design: Option<Map<String, Value>>,
    #[serde(default)]
    pub clustering: Option<Map<String, Value>>,
    #[serde(default)]
    pub fold: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StageDefaults {
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// System-side defaults: environment names per stage (with a `main`
/// fallback), script locations per stage and default argument maps.
#[derive(Debug, Deserialize, Default)]
pub struct SystemDefaults {
    #[serde(default)]
    pub environments: HashMap<String, String>,
    #[serde(default)]
    pub modules: HashMap<String, String>,
    #[serde(default)]
    pub profile: StageDefaults,
    #[serde(default)]
    pub diffusion: StageDefaults,
    #[serde(default)]
    pub design: StageDefaults,
    #[serde(default)]
    pub clustering: StageDefaults,
    #[serde(default)]
    pub fold: StageDefaults,
}

impl ProjectConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read project config: {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse project config JSON")
    }
}

impl SystemDefaults {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read settings file: {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse settings JSON")
    }

    fn env_for(&self, stage: &str) -> Result<String, ConfigError> {
        self.environments
            .get(stage)
            .or_else(|| self.environments.get("main"))
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnvironment(stage.to_string()))
    }
}

/// One fully resolved pipeline stage: environment plus flattened argument
/// mapping ready for `--key value` expansion.
#[derive(Debug, Clone)]
pub struct ResolvedStage {
    pub name: &'static str,
    pub env_name: String,
    pub args: BTreeMap<String, String>,
}

/// The structural class requested for the diffusion stage. Exactly one of
/// the two flags must be set; anything else leaves the downstream report
/// label undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralClass {
    Helix,
    Strand,
}

impl StructuralClass {
    pub fn label(self) -> &'static str {
        match self {
            Self::Helix => "helix",
            Self::Strand => "strand",
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes"),
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => false,
    }
}

/// Merged argument map for one stage: system defaults overlaid with the
/// user's section, user values winning key by key.
struct StageArgs {
    stage: &'static str,
    merged: Map<String, Value>,
}

impl StageArgs {
    fn merge(stage: &'static str, defaults: &StageDefaults, user: &Map<String, Value>) -> Self {
        let mut merged = defaults.args.clone();
        for (key, value) in user {
            merged.insert(key.clone(), value.clone());
        }
        Self { stage, merged }
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.merged.get(key)
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.merged
            .get(key)
            .map(scalar_to_string)
            .unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.merged
            .get(key)
            .map(scalar_to_string)
            .ok_or_else(|| ConfigError::MissingKey {
                stage: self.stage.to_string(),
                key: key.to_string(),
            })
    }

    fn structural_class(&self) -> Result<StructuralClass, ConfigError> {
        let helix = is_truthy(self.get("helix"));
        let strand = is_truthy(self.get("strand"));
        match (helix, strand) {
            (true, false) => Ok(StructuralClass::Helix),
            (false, true) => Ok(StructuralClass::Strand),
            _ => Err(ConfigError::AmbiguousStructuralClass),
        }
    }
}

fn join(base: &str, tail: impl AsRef<Path>) -> String {
    PathBuf::from(base).join(tail).to_string_lossy().to_string()
}

/// Resolves the ordered stage set for one project. Ordering is fixed:
/// profile, diffusion (+report), design (+report), fold (+report). Any
/// error aborts resolution before anything has run.
pub fn resolve(
    project: &ProjectConfig,
    defaults: &SystemDefaults,
) -> Result<Vec<ResolvedStage>, ConfigError> {
    let mut stages = Vec::new();
    let p = &project.project;
    let chain = p.chain.as_str();
    let output_dir = p.output_dir.as_str();
    let structure_name = Path::new(&p.input_pdb)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    if let Some(user) = &project.profile {
        let args = StageArgs::merge("profile", &defaults.profile, user);
        let mut resolved = BTreeMap::new();
        resolved.insert("input_pdb".into(), p.input_pdb.clone());
        resolved.insert("select_chain".into(), chain.to_string());
        resolved.insert(
            "output_folder".into(),
            join(output_dir, args.string_or("output_folder", "profile_out")),
        );
        resolved.insert("bitscore".into(), args.string_or("bitscore", "0.3"));
        resolved.insert("n_iter".into(), args.string_or("n_iter", "5"));
        resolved.insert("database".into(), args.string_or("database", ""));
        resolved.insert("cpu".into(), args.string_or("cpu", "10"));
        resolved.insert(
            "minimum_sequence_coverage".into(),
            args.string_or("minimum_sequence_coverage", "50"),
        );
        resolved.insert(
            "minimum_column_coverage".into(),
            args.string_or("minimum_column_coverage", "70"),
        );
        resolved.insert("final_report_folder".into(), output_dir.to_string());
        stages.push(ResolvedStage {
            name: "profile",
            env_name: defaults.env_for("profile")?,
            args: resolved,
        });
    }

    let Some(segment) = &p.segment else {
        // Without a designed segment only the profile search can run.
        return Ok(stages);
    };
    let inpaint = format!("[{}{}]", chain, segment);
    let position_list = format!("{}{}", chain, segment);
    let diffusion_out = join(output_dir, "diffusion_out");
    let design_out = join(output_dir, "design_out");

    if let Some(user) = &project.diffusion {
        let args = StageArgs::merge("diffusion", &defaults.diffusion, user);
        let sequence_length = p.sequence_length.ok_or_else(|| ConfigError::MissingKey {
            stage: "diffusion".to_string(),
            key: "sequence_length".to_string(),
        })?;
        let class = args.structural_class()?;
        let out_folder = join(output_dir, args.string_or("output_folder", "diffusion_out"));
        let output_prefix = join(&out_folder, format!("sample/{}_{}", structure_name, chain));

        let mut resolved = BTreeMap::new();
        resolved.insert(
            "run_inference_path".into(),
            args.required("run_inference_path")?,
        );
        resolved.insert("inference.input_pdb".into(), p.input_pdb.clone());
        resolved.insert("inference.output_prefix".into(), output_prefix.clone());
        resolved.insert(
            "inference.num_designs".into(),
            args.string_or("num_designs", "10"),
        );
        resolved.insert(
            "contigmap.contigs".into(),
            format!("[{}1-{}]", chain, sequence_length),
        );
        resolved.insert("contigmap.inpaint_str".into(), inpaint.clone());
        resolved.insert(
            "diffuser.partial_T".into(),
            args.required("diffuser.partial_T")?,
        );
        if let Some(seq) = args.get("contigmap.inpaint_seq") {
            resolved.insert("contigmap.inpaint_seq".into(), scalar_to_string(seq));
        }
        match class {
            StructuralClass::Helix => {
                resolved.insert("contigmap.inpaint_str_helix".into(), inpaint.clone());
            }
            StructuralClass::Strand => {
                resolved.insert("contigmap.inpaint_str_strand".into(), inpaint.clone());
            }
        }
        stages.push(ResolvedStage {
            name: "diffusion",
            env_name: defaults.env_for("diffusion")?,
            args: resolved,
        });

        let mut report = BTreeMap::new();
        report.insert("sample_prefix".into(), output_prefix);
        report.insert("inpaint_str".into(), inpaint.clone());
        report.insert("threshold".into(), args.string_or("threshold", "0.6"));
        report.insert("ss".into(), class.label().to_string());
        report.insert("final_report_folder".into(), output_dir.to_string());
        stages.push(ResolvedStage {
            name: "diffusion_report",
            env_name: defaults.env_for("diffusion_report")?,
            args: report,
        });
    }

    if let Some(user) = &project.design {
        let args = StageArgs::merge("design", &defaults.design, user);
        let out_folder = join(output_dir, args.string_or("output_folder", "design_out"));
        let pdb_folder = args.string_or("pdb_folder", &join(&diffusion_out, "filter_results"));

        let mut resolved = BTreeMap::new();
        for key in [
            "parse_multiple_chains_path",
            "assign_fixed_chains_path",
            "make_fixed_positions_dict_path",
            "protein_mpnn_run_path",
        ] {
            resolved.insert(key.into(), args.required(key)?);
        }
        resolved.insert("pdb_folder".into(), pdb_folder);
        resolved.insert("output_folder".into(), out_folder.clone());
        resolved.insert("chain_list".into(), chain.to_string());
        resolved.insert("position_list".into(), position_list.clone());
        resolved.insert(
            "num_seq_per_target".into(),
            args.string_or("num_seq_per_target", "20"),
        );
        resolved.insert(
            "sampling_temp".into(),
            args.string_or("sampling_temp", "0.3"),
        );
        resolved.insert("seed".into(), args.string_or("seed", "42"));
        stages.push(ResolvedStage {
            name: "design",
            env_name: defaults.env_for("design")?,
            args: resolved,
        });

        let mut report = BTreeMap::new();
        report.insert("seq_folder".into(), join(&out_folder, "seqs"));
        report.insert("output_folder".into(), out_folder);
        report.insert("top_percent".into(), args.string_or("top_percent", "0.5"));
        report.insert("position_list".into(), position_list.clone());
        report.insert("final_report_folder".into(), output_dir.to_string());
        if let Some(path) = args.get("diffusion_report_path") {
            report.insert("diffusion_report_path".into(), scalar_to_string(path));
        }

        // Clustering is a post-processing step of the design report, never
        // a standalone stage.
        if let Some(cluster_user) = &project.clustering {
            let cluster = StageArgs::merge("clustering", &defaults.clustering, cluster_user);
            report.insert("threads".into(), cluster.string_or("threads", "8"));
            report.insert("min_seq_id".into(), cluster.string_or("min_seq_id", "0.8"));
            report.insert("cov_mode".into(), cluster.string_or("cov_mode", "0"));
            report.insert("coverage".into(), cluster.string_or("coverage", "0.8"));
            report.insert(
                "mmseqs_path".into(),
                cluster.string_or("mmseqs_path", "mmseqs"),
            );
            report.insert(
                "sensitivity".into(),
                cluster.string_or("sensitivity", "4.0"),
            );
        }
        stages.push(ResolvedStage {
            name: "design_report",
            env_name: defaults.env_for("design_report")?,
            args: report,
        });
    }

    if let Some(user) = &project.fold {
        let args = StageArgs::merge("fold", &defaults.fold, user);
        let input_folder = args.string_or("input_folder", &join(&design_out, "results"));
        let out_folder = join(output_dir, args.string_or("output_folder", "fold_out"));

        let mut resolved = BTreeMap::new();
        resolved.insert("input_folder".into(), input_folder.clone());
        resolved.insert("output_folder".into(), out_folder.clone());
        stages.push(ResolvedStage {
            name: "fold",
            env_name: defaults.env_for("fold")?,
            args: resolved,
        });

        let default_chain_pdb = join(
            &join(output_dir, "profile_out/target_chain_pdb"),
            format!("{}_{}.pdb", structure_name, chain),
        );
        let mut report = BTreeMap::new();
        report.insert("fasta_folder".into(), input_folder);
        report.insert("fold_folder".into(), out_folder);
        report.insert(
            "plddt_threshold".into(),
            args.string_or("plddt_threshold", "70"),
        );
        report.insert(
            "original_protein_chain_path".into(),
            args.string_or("original_protein_chain_path", &default_chain_pdb),
        );
        report.insert(
            "seq_range_str".into(),
            args.string_or("seq_range_str", segment),
        );
        stages.push(ResolvedStage {
            name: "fold_report",
            env_name: defaults.env_for("fold_report")?,
            args: report,
        });
    }

    info!("Resolved {} pipeline stages", stages.len());
    Ok(stages)
}
