use crate::fasta::{write_fasta, FastaRecord, SequenceSource};
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use uuid::Uuid;

/// Parameters forwarded to the external `mmseqs easy-cluster` call.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    pub threads: u32,
    pub min_seq_id: f64,
    pub cov_mode: u32,
    pub coverage: f64,
    pub sensitivity: Option<f64>,
    pub mmseqs_path: String,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            threads: 8,
            min_seq_id: 0.8,
            cov_mode: 0,
            coverage: 0.8,
            sensitivity: None,
            mmseqs_path: "mmseqs".to_string(),
        }
    }
}

/// Extracts the 1-based inclusive region `[start, end]` from every sequence
/// in the source and returns the sub-region records together with the
/// sub-id to original-id mapping.
///
/// Table sources reuse the original ids as sub ids and must therefore carry
/// unique ids; FASTA sources get fresh counter ids since their headers are
/// not guaranteed to be usable as keys. Sequences shorter than the region
/// are skipped with a warning and contribute no mapping entry.
pub fn extract_regions(
    source: &SequenceSource,
    start: usize,
    end: usize,
) -> Result<(Vec<FastaRecord>, HashMap<String, String>)> {
    let mut sub_to_orig = HashMap::new();
    let mut sub_records = Vec::new();
    let mut counter = 0usize;

    for entry in source.entries() {
        let sub_id = if source.is_table() {
            if sub_to_orig.contains_key(&entry.id) {
                anyhow::bail!(
                    "Duplicate sequence id `{}` in table source; ids must be unique",
                    entry.id
                );
            }
            entry.id.clone()
        } else {
            counter += 1;
            counter.to_string()
        };
        sub_to_orig.insert(sub_id.clone(), entry.id.clone());

        let start_idx = start.saturating_sub(1);
        let end_idx = end.min(entry.sequence.len());
        if start_idx >= end_idx {
            warn!(
                "Sequence `{}` (length {}) is shorter than region {}-{}, skipping",
                entry.id,
                entry.sequence.len(),
                start,
                end
            );
            sub_to_orig.remove(&sub_id);
            continue;
        }

        sub_records.push(FastaRecord::new(sub_id, &entry.sequence[start_idx..end_idx]));
    }

    Ok((sub_records, sub_to_orig))
}

/// Runs `mmseqs easy-cluster` on the sub-region FASTA and returns the path
/// of the representative-sequence file it produced.
///
/// The child process runs with the output directory as its working
/// directory so tool-relative outputs land there; our own process cwd is
/// never touched. The uuid-named scratch directory is removed afterwards.
pub async fn run_clustering(
    input_fasta: &Path,
    output_prefix: &Path,
    params: &ClusterParams,
) -> Result<PathBuf> {
    let work_dir = output_prefix
        .parent()
        .context("Cluster output prefix has no parent directory")?;
    tokio::fs::create_dir_all(work_dir).await?;
    let prefix_name = output_prefix
        .file_name()
        .context("Cluster output prefix has no file name")?
        .to_string_lossy()
        .to_string();
    let scratch_name = format!("tmp_mmseqs_{}", Uuid::new_v4().simple());

    // The child runs inside work_dir, so the input path must survive the
    // working-directory change.
    let input_fasta = std::fs::canonicalize(input_fasta)
        .context(format!("Cluster input not found: {:?}", input_fasta))?;

    let mut cmd = Command::new(&params.mmseqs_path);
    cmd.arg("easy-cluster")
        .arg(&input_fasta)
        .arg(&prefix_name)
        .arg(&scratch_name)
        .args(["--threads", &params.threads.to_string()])
        .args(["--min-seq-id", &params.min_seq_id.to_string()])
        .args(["--cov-mode", &params.cov_mode.to_string()])
        .args(["-c", &params.coverage.to_string()]);
    if let Some(sensitivity) = params.sensitivity {
        cmd.args(["-s", &sensitivity.to_string()]);
    }
    cmd.current_dir(work_dir);

    info!(
        "Running clustering: {} easy-cluster {:?} {} in {:?}",
        params.mmseqs_path, input_fasta, prefix_name, work_dir
    );
    let output = cmd
        .output()
        .await
        .context(format!("Failed to execute {}", params.mmseqs_path))?;

    let scratch_dir = work_dir.join(&scratch_name);
    if scratch_dir.exists() {
        let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "mmseqs easy-cluster failed with status {}: {}",
            output.status,
            stderr
        );
    }

    let rep_file = work_dir.join(format!("{}_rep_seq.fasta", prefix_name));
    if !rep_file.exists() {
        anyhow::bail!(
            "Clustering finished but representative file {:?} was not produced",
            rep_file
        );
    }
    Ok(rep_file)
}

/// Writes the original full-length sequences for every representative sub
/// id, keyed by original id. Table sources keep their original row order;
/// FASTA sources keep the representative-file order. A representative with
/// no mapping entry is a fatal inconsistency.
pub fn write_representatives(
    source: &SequenceSource,
    rep_ids: &[String],
    sub_to_orig: &HashMap<String, String>,
    output: &Path,
) -> Result<usize> {
    let mut orig_rep_ids = HashSet::new();
    for rep_id in rep_ids {
        let orig_id = sub_to_orig.get(rep_id).context(format!(
            "Representative id `{}` has no mapping back to an original sequence",
            rep_id
        ))?;
        orig_rep_ids.insert(orig_id.clone());
    }

    let records: Vec<FastaRecord> = if source.is_table() {
        source
            .entries()
            .into_iter()
            .filter(|e| orig_rep_ids.contains(&e.id))
            .map(|e| FastaRecord::new(e.id, e.sequence))
            .collect()
    } else {
        let by_id: HashMap<String, String> = source
            .entries()
            .into_iter()
            .map(|e| (e.id, e.sequence))
            .collect();
        let mut records = Vec::new();
        for rep_id in rep_ids {
            let orig_id = &sub_to_orig[rep_id];
            let sequence = by_id.get(orig_id).context(format!(
                "Original sequence `{}` missing from source",
                orig_id
            ))?;
            records.push(FastaRecord::new(orig_id.clone(), sequence.clone()));
        }
        records
    };

    write_fasta(output, &records)?;
    info!("Wrote {} representative sequences to {:?}", records.len(), output);
    Ok(records.len())
}

/// Full clustering pass over one sequence file: extract the region, cluster
/// it, and reconcile representatives back into original coordinates.
pub async fn cluster_and_reconcile(
    input_file: &Path,
    scratch_dir: &Path,
    final_output: &Path,
    start: usize,
    end: usize,
    params: &ClusterParams,
) -> Result<PathBuf> {
    let source = SequenceSource::load(input_file)?;
    let (sub_records, sub_to_orig) = extract_regions(&source, start, end)?;
    if sub_records.is_empty() {
        anyhow::bail!(
            "No sequences in {:?} cover region {}-{}",
            input_file,
            start,
            end
        );
    }

    tokio::fs::create_dir_all(scratch_dir).await?;
    let subregion_fasta = scratch_dir.join("subregion_sequences.fasta");
    write_fasta(&subregion_fasta, &sub_records)?;

    let rep_file =
        run_clustering(&subregion_fasta, &scratch_dir.join("cluster_output"), params).await?;
    let rep_ids: Vec<String> = crate::fasta::read_fasta(&rep_file)?
        .into_iter()
        .map(|r| r.id)
        .collect();

    if let Some(parent) = final_output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_representatives(&source, &rep_ids, &sub_to_orig, final_output)?;
    Ok(final_output.to_path_buf())
}

/// Strips the per-backbone CSV naming conventions down to the backbone
/// name: `top_design_Dusp4_A_2.csv` and `design_Dusp4_A_2.csv` both map to
/// `Dusp4_A_2`.
pub fn backbone_name(file_stem: &str) -> &str {
    file_stem
        .strip_prefix("top_design_")
        .or_else(|| file_stem.strip_prefix("design_"))
        .unwrap_or(file_stem)
}

/// Clusters every per-backbone CSV in `input_folder`. Intermediate files go
/// to `<output_folder>/cluster_data/<backbone>/`, final representative
/// FASTAs to `<output_folder>/results/<backbone>.fa`.
pub async fn cluster_folder(
    input_folder: &Path,
    output_folder: &Path,
    start: usize,
    end: usize,
    params: &ClusterParams,
) -> Result<Vec<PathBuf>> {
    let results_folder = output_folder.join("results");
    let cluster_data_folder = output_folder.join("cluster_data");
    tokio::fs::create_dir_all(&results_folder).await?;
    tokio::fs::create_dir_all(&cluster_data_folder).await?;

    let pattern = input_folder.join("*.csv");
    let mut csv_files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("Invalid cluster input pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    csv_files.sort();

    if csv_files.is_empty() {
        warn!("No CSV files found in {:?}, nothing to cluster", input_folder);
        return Ok(Vec::new());
    }

    let mut outputs = Vec::new();
    for csv_file in &csv_files {
        let stem = csv_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let backbone = backbone_name(&stem).to_string();
        info!("Clustering backbone `{}` from {:?}", backbone, csv_file);

        let scratch = cluster_data_folder.join(&backbone);
        let final_output = results_folder.join(format!("{}.fa", backbone));
        let path =
            cluster_and_reconcile(csv_file, &scratch, &final_output, start, end, params).await?;
        outputs.push(path);
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fasta::SequenceEntry;

    fn table(rows: &[(&str, &str)]) -> SequenceSource {
        SequenceSource::Table(
            rows.iter()
                .map(|(id, seq)| SequenceEntry {
                    id: id.to_string(),
                    sequence: seq.to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn table_extraction_uses_identity_ids() {
        let source = table(&[("a", "MKVLAT"), ("b", "MKAAGT"), ("c", "MKTTGS")]);
        let (records, mapping) = extract_regions(&source, 2, 4).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "a");
        assert_eq!(records[0].sequence, "KVL");
        assert_eq!(records[1].sequence, "KAA");
        assert_eq!(records[2].sequence, "KTT");
        assert_eq!(mapping["a"], "a");
        assert_eq!(mapping["c"], "c");
    }

    #[test]
    fn fasta_extraction_generates_counter_ids() {
        let source = SequenceSource::Fasta(vec![
            FastaRecord::new("long header one", "MKVLAT"),
            FastaRecord::new("long header two", "MKAAGT"),
        ]);
        let (records, mapping) = extract_regions(&source, 1, 3).unwrap();
        assert_eq!(records[0].id, "1");
        assert_eq!(records[1].id, "2");
        assert_eq!(mapping["1"], "long header one");
        assert_eq!(mapping["2"], "long header two");
    }

    #[test]
    fn short_sequences_are_skipped_without_mapping() {
        let source = table(&[("a", "MKVLAT"), ("short", "MK")]);
        let (records, mapping) = extract_regions(&source, 3, 6).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "a");
        assert!(!mapping.contains_key("short"));
    }

    #[test]
    fn duplicate_table_ids_are_rejected() {
        let source = table(&[("a", "MKVLAT"), ("a", "MKAAGT")]);
        assert!(extract_regions(&source, 1, 3).is_err());
    }

    #[test]
    fn representatives_keep_table_order_and_full_length() {
        let source = table(&[("a", "MKVLAT"), ("b", "MKAAGT"), ("c", "MKTTGS")]);
        let (_, mapping) = extract_regions(&source, 2, 4).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reps.fa");
        // Clustering returned c before a; table order must win.
        let reps = vec!["c".to_string(), "a".to_string()];
        let count = write_representatives(&source, &reps, &mapping, &out).unwrap();
        assert_eq!(count, 2);

        let written = crate::fasta::read_fasta(&out).unwrap();
        assert_eq!(written[0].id, "a");
        assert_eq!(written[0].sequence, "MKVLAT");
        assert_eq!(written[1].id, "c");
        assert_eq!(written[1].sequence, "MKTTGS");
    }

    #[test]
    fn unknown_representative_is_fatal() {
        let source = table(&[("a", "MKVLAT")]);
        let (_, mapping) = extract_regions(&source, 1, 3).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reps.fa");
        let reps = vec!["ghost".to_string()];
        assert!(write_representatives(&source, &reps, &mapping, &out).is_err());
    }

    #[test]
    fn fasta_representatives_follow_rep_order() {
        let source = SequenceSource::Fasta(vec![
            FastaRecord::new("one", "MKVLAT"),
            FastaRecord::new("two", "MKAAGT"),
        ]);
        let (_, mapping) = extract_regions(&source, 1, 3).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reps.fa");
        let reps = vec!["2".to_string(), "1".to_string()];
        write_representatives(&source, &reps, &mapping, &out).unwrap();
        let written = crate::fasta::read_fasta(&out).unwrap();
        assert_eq!(written[0].id, "two");
        assert_eq!(written[1].id, "one");
    }

    #[test]
    fn backbone_names_strip_csv_prefixes() {
        assert_eq!(backbone_name("top_design_Dusp4_A_2"), "Dusp4_A_2");
        assert_eq!(backbone_name("design_Dusp4_A_2"), "Dusp4_A_2");
        assert_eq!(backbone_name("Dusp4_A_2"), "Dusp4_A_2");
    }
}
