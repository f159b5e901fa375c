use crate::fasta::read_fasta;
use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// One row of the design-stage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    pub index: String,
    pub backbone: String,
    #[serde(default)]
    pub ss8: String,
    #[serde(default)]
    pub ss3: String,
    #[serde(rename = "H_prop", default)]
    pub h_prop: String,
    #[serde(rename = "E_prop", default)]
    pub e_prop: String,
    #[serde(rename = "C_prop", default)]
    pub c_prop: String,
    #[serde(default)]
    pub backbone_pdb: String,
    pub score: f64,
    pub global_score: f64,
    #[serde(default)]
    pub region: String,
    pub sequence: String,
}

/// Upstream metadata for one backbone, read from the diffusion-stage
/// report.
#[derive(Debug, Clone, Default)]
pub struct BackboneMeta {
    pub ss8: String,
    pub ss3: String,
    pub h_prop: String,
    pub e_prop: String,
    pub c_prop: String,
    pub backbone: String,
    pub success_backbone: String,
}

impl BackboneMeta {
    /// The provenance pdb path: the relaxed backbone when one exists, the
    /// raw backbone otherwise.
    fn pdb_path(&self) -> String {
        if self.success_backbone.is_empty() || self.success_backbone == "-" {
            self.backbone.clone()
        } else {
            self.success_backbone.clone()
        }
    }
}

/// Loads per-backbone metadata from the diffusion report CSV, keyed by the
/// backbone index. A missing file degrades to an empty map with a warning.
pub fn load_backbone_metadata(report_path: &Path) -> HashMap<String, BackboneMeta> {
    let mut metadata = HashMap::new();
    if !report_path.exists() {
        warn!("Diffusion report not found at {:?}", report_path);
        return metadata;
    }

    let mut reader = match csv::Reader::from_path(report_path) {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to read diffusion report {:?}: {}", report_path, e);
            return metadata;
        }
    };
    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(_) => return metadata,
    };
    let col = |name: &str| headers.iter().position(|h| h == name);
    let Some(index_col) = col("index") else {
        warn!("Diffusion report {:?} has no `index` column", report_path);
        return metadata;
    };
    let field = |record: &csv::StringRecord, name: &str| -> String {
        col(name)
            .and_then(|i| record.get(i))
            .unwrap_or_default()
            .to_string()
    };

    for record in reader.records().flatten() {
        let Some(index) = record.get(index_col) else {
            continue;
        };
        metadata.insert(
            index.to_string(),
            BackboneMeta {
                ss8: field(&record, "design_ss8"),
                ss3: field(&record, "design_ss3"),
                h_prop: field(&record, "H_prop"),
                e_prop: field(&record, "E_prop"),
                c_prop: field(&record, "C_prop"),
                backbone: field(&record, "backbone"),
                success_backbone: field(&record, "success_backbone"),
            },
        );
    }
    info!("Loaded metadata for {} backbones", metadata.len());
    metadata
}

/// Parses `key=value` attribute pairs from a sequence-design FASTA header
/// of the form `>name, score=1.23, global_score=1.5`.
pub fn parse_attribute_header(header: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    for part in header.split(", ") {
        if let Some((key, value)) = part.split_once('=') {
            attributes.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    attributes
}

/// Builds report rows for one backbone's design FASTA. The first record of
/// the file is the native sequence and is excluded. Missing upstream
/// metadata degrades to empty fields.
pub fn rows_from_design_fasta(
    path: &Path,
    backbone_id: &str,
    meta: Option<&BackboneMeta>,
    region: Option<(usize, usize)>,
) -> Result<Vec<ReportRow>> {
    let records = read_fasta(path)?;
    if records.len() < 2 {
        warn!("No generated sequences in {:?}", path);
        return Ok(Vec::new());
    }

    let meta = meta.cloned().unwrap_or_default();
    let mut rows = Vec::new();
    for (ordinal, record) in records[1..].iter().enumerate() {
        let attributes = parse_attribute_header(&record.description);
        let score = attributes
            .get("score")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let global_score = attributes
            .get("global_score")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        let region_text = match region {
            Some((start, end)) if record.sequence.len() >= end => {
                record.sequence[start.saturating_sub(1)..end].to_string()
            }
            _ => record.sequence.clone(),
        };

        rows.push(ReportRow {
            index: format!("{}_design_{}", backbone_id, ordinal),
            backbone: backbone_id.to_string(),
            ss8: meta.ss8.clone(),
            ss3: meta.ss3.clone(),
            h_prop: meta.h_prop.clone(),
            e_prop: meta.e_prop.clone(),
            c_prop: meta.c_prop.clone(),
            backbone_pdb: meta.pdb_path(),
            score,
            global_score,
            region: region_text,
            sequence: record.sequence.clone(),
        });
    }
    Ok(rows)
}

/// Keeps the `max(1, ceil(n * top_percent))` lowest-scoring rows by
/// `global_score`, returned in their original input order. Ranking is a
/// selection criterion only, never an output order.
pub fn filter_top(rows: &[ReportRow], top_percent: f64) -> Vec<ReportRow> {
    if rows.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<&ReportRow> = rows.iter().collect();
    ranked.sort_by(|a, b| {
        a.global_score
            .partial_cmp(&b.global_score)
            .unwrap_or(Ordering::Equal)
    });
    let keep = ((rows.len() as f64 * top_percent).ceil() as usize).max(1);
    let kept_indices: HashSet<&str> = ranked
        .iter()
        .take(keep)
        .map(|r| r.index.as_str())
        .collect();

    rows.iter()
        .filter(|r| kept_indices.contains(r.index.as_str()))
        .cloned()
        .collect()
}

fn write_rows(path: &Path, rows: &[ReportRow]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).context(format!("Failed to create CSV: {:?}", path))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_rows(path: &Path) -> Result<Vec<ReportRow>> {
    let mut reader =
        csv::Reader::from_path(path).context(format!("Failed to read CSV: {:?}", path))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Sort key that treats embedded numbers numerically, so `x_10` sorts
/// after `x_2`.
fn natural_key(name: &str) -> Vec<(u64, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+|\D+").unwrap());
    re.find_iter(name)
        .map(|m| {
            let part = m.as_str();
            match part.parse::<u64>() {
                Ok(n) => (n, String::new()),
                Err(_) => (u64::MAX, part.to_string()),
            }
        })
        .collect()
}

pub struct StageReportOutcome {
    pub seqs_csv_files: Vec<PathBuf>,
    pub top_csv_files: Vec<PathBuf>,
    pub top_folder: PathBuf,
}

/// Turns every design FASTA in `seq_folder` into a per-backbone CSV and an
/// independently top-filtered CSV.
pub fn build_stage_report(
    seq_folder: &Path,
    output_folder: &Path,
    top_percent: f64,
    region: Option<(usize, usize)>,
    diffusion_report: &Path,
) -> Result<StageReportOutcome> {
    let metadata = load_backbone_metadata(diffusion_report);

    let pattern = seq_folder.join("*.fa");
    let mut fasta_files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("Invalid sequence folder pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    fasta_files.sort_by_key(|p| {
        let stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        natural_key(&stem)
    });

    if fasta_files.is_empty() {
        anyhow::bail!("No FASTA files found in {:?}", seq_folder);
    }
    info!("Found {} design FASTA files", fasta_files.len());

    let seqs_csv_folder = output_folder.join("seqs_csv");
    let top_folder = output_folder.join(format!("top_{:.1}%", top_percent * 100.0));
    std::fs::create_dir_all(&seqs_csv_folder)?;
    std::fs::create_dir_all(&top_folder)?;

    let mut seqs_csv_files = Vec::new();
    let mut top_csv_files = Vec::new();
    for fasta in &fasta_files {
        let backbone = fasta
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let rows =
            rows_from_design_fasta(fasta, &backbone, metadata.get(&backbone), region)?;
        if rows.is_empty() {
            continue;
        }

        let csv_path = seqs_csv_folder.join(format!("design_{}.csv", backbone));
        write_rows(&csv_path, &rows)?;
        seqs_csv_files.push(csv_path);

        let top_rows = filter_top(&rows, top_percent);
        let top_path = top_folder.join(format!("top_design_{}.csv", backbone));
        write_rows(&top_path, &top_rows)?;
        top_csv_files.push(top_path);
        info!(
            "Backbone `{}`: {} sequences, {} in top {:.1}%",
            backbone,
            rows.len(),
            top_rows.len(),
            top_percent * 100.0
        );
    }

    Ok(StageReportOutcome {
        seqs_csv_files,
        top_csv_files,
        top_folder,
    })
}

#[derive(Debug, Serialize)]
struct FinalReportRow {
    index: String,
    backbone: String,
    segment: String,
    ss8: String,
    ss3: String,
    #[serde(rename = "H_prop")]
    h_prop: String,
    #[serde(rename = "E_prop")]
    e_prop: String,
    #[serde(rename = "C_prop")]
    c_prop: String,
    backbone_pdb: String,
    score: f64,
    global_score: f64,
    region: String,
    sequence: String,
}

/// Merges every per-backbone CSV into the unified design report, annotated
/// with the designed segment.
pub fn write_final_report(
    seqs_csv_files: &[PathBuf],
    segment: &str,
    final_report_folder: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(final_report_folder)?;
    let report_path = final_report_folder.join("design_report.csv");
    let mut writer = csv::Writer::from_path(&report_path)
        .context(format!("Failed to create report: {:?}", report_path))?;

    let mut total = 0usize;
    for csv_path in seqs_csv_files {
        for row in read_rows(csv_path)? {
            writer.serialize(FinalReportRow {
                index: row.index,
                backbone: row.backbone,
                segment: segment.to_string(),
                ss8: row.ss8,
                ss3: row.ss3,
                h_prop: row.h_prop,
                e_prop: row.e_prop,
                c_prop: row.c_prop,
                backbone_pdb: row.backbone_pdb,
                score: row.score,
                global_score: row.global_score,
                region: row.region,
                sequence: row.sequence,
            })?;
            total += 1;
        }
    }
    writer.flush()?;
    info!("Final design report with {} rows at {:?}", total, report_path);
    Ok(report_path)
}

/// Collects the representative-sequence ids from every FASTA in the
/// clustering results folder.
fn representative_ids(results_folder: &Path) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    for pattern in ["*.fa", "*.fasta"] {
        let full = results_folder.join(pattern);
        for entry in glob::glob(&full.to_string_lossy())? {
            let path = entry?;
            for record in read_fasta(&path)? {
                ids.insert(record.description);
            }
        }
    }
    Ok(ids)
}

/// Adds (or overwrites) the boolean `whether_pass` column: true iff the
/// row's index is one of the clustering representatives. When the results
/// folder does not exist yet the report is left untouched and `false` is
/// returned so the caller knows the column was omitted.
pub fn annotate_whether_pass(report_path: &Path, results_folder: &Path) -> Result<bool> {
    if !results_folder.exists() {
        info!(
            "Clustering results folder {:?} not found, whether_pass column omitted",
            results_folder
        );
        return Ok(false);
    }

    let representatives = representative_ids(results_folder)?;
    info!("Found {} representative sequences", representatives.len());

    let mut reader = csv::Reader::from_path(report_path)
        .context(format!("Failed to read report: {:?}", report_path))?;
    let headers = reader.headers()?.clone();
    let index_col = headers
        .iter()
        .position(|h| h == "index")
        .context("Report has no `index` column")?;
    let pass_col = headers.iter().position(|h| h == "whether_pass");

    let mut out_headers: Vec<String> = headers.iter().map(str::to_string).collect();
    if pass_col.is_none() {
        out_headers.push("whether_pass".to_string());
    }

    let mut out_records = Vec::new();
    for record in reader.records() {
        let record = record?;
        let passes = record
            .get(index_col)
            .map_or(false, |idx| representatives.contains(idx));
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        match pass_col {
            Some(col) => fields[col] = passes.to_string(),
            None => fields.push(passes.to_string()),
        }
        out_records.push(fields);
    }

    let mut writer = csv::Writer::from_path(report_path)
        .context(format!("Failed to rewrite report: {:?}", report_path))?;
    writer.write_record(&out_headers)?;
    for record in &out_records {
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(true)
}

/// Extracts the 1-based start and end of a segment written as
/// `"346-394"`, `"A346-394"`, `"346 350 394"` or a single position.
pub fn parse_position_range(input: &str) -> Option<(usize, usize)> {
    let input = input.trim();
    if input.contains(' ') {
        let numbers: Vec<usize> = input
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        return Some((*numbers.first()?, *numbers.last()?));
    }

    static RANGE: OnceLock<Regex> = OnceLock::new();
    let range = RANGE.get_or_init(|| Regex::new(r"^[A-Za-z]*(\d+)(?:-(\d+))?$").unwrap());
    let caps = range.captures(input)?;
    let start: usize = caps[1].parse().ok()?;
    let end: usize = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => start,
    };
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: &str, global_score: f64) -> ReportRow {
        ReportRow {
            index: index.to_string(),
            backbone: "bb".to_string(),
            ss8: String::new(),
            ss3: String::new(),
            h_prop: String::new(),
            e_prop: String::new(),
            c_prop: String::new(),
            backbone_pdb: String::new(),
            score: 0.0,
            global_score,
            region: String::new(),
            sequence: "MKVL".to_string(),
        }
    }

    #[test]
    fn top_filter_keeps_lowest_scores_in_input_order() {
        let rows = vec![
            row("r0", 5.0),
            row("r1", 1.0),
            row("r2", 3.0),
            row("r3", 2.0),
            row("r4", 4.0),
        ];
        let kept = filter_top(&rows, 0.4);
        assert_eq!(kept.len(), 2);
        // The two lowest scores, in original input positions.
        assert_eq!(kept[0].index, "r1");
        assert_eq!(kept[1].index, "r3");
    }

    #[test]
    fn top_filter_keeps_at_least_one() {
        let rows = vec![row("r0", 9.0), row("r1", 2.0)];
        let kept = filter_top(&rows, 0.01);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].index, "r1");
    }

    #[test]
    fn top_filter_edge_cases() {
        assert!(filter_top(&[], 0.5).is_empty());
        let rows = vec![row("r0", 2.0), row("r1", 1.0), row("r2", 3.0)];
        let all = filter_top(&rows, 1.0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].index, "r0");
        assert_eq!(all[2].index, "r2");
    }

    #[test]
    fn attribute_headers_parse_key_value_pairs() {
        let attrs =
            parse_attribute_header("Dusp4_A_2, T=0.3, sample=1, score=1.1489, global_score=1.2817");
        assert_eq!(attrs["score"], "1.1489");
        assert_eq!(attrs["global_score"], "1.2817");
        assert_eq!(attrs["T"], "0.3");
    }

    #[test]
    fn design_fasta_rows_skip_native_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dusp4_A_2.fa");
        std::fs::write(
            &path,
            ">Dusp4_A_2, score=0.9, global_score=0.9\nMKVLATGG\n\
             >T=0.3, sample=1, score=1.1, global_score=1.2\nMKAAATGG\n\
             >T=0.3, sample=2, score=0.8, global_score=0.7\nMKTTATGG\n",
        )
        .unwrap();

        let rows = rows_from_design_fasta(&path, "Dusp4_A_2", None, Some((2, 4))).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].index, "Dusp4_A_2_design_0");
        assert_eq!(rows[1].index, "Dusp4_A_2_design_1");
        assert_eq!(rows[0].global_score, 1.2);
        assert_eq!(rows[0].region, "KAA");
        assert_eq!(rows[0].sequence, "MKAAATGG");
        // Empty metadata degrades to empty strings, not an error.
        assert_eq!(rows[0].ss3, "");
    }

    #[test]
    fn whether_pass_column_reflects_representatives() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("design_report.csv");
        std::fs::write(
            &report,
            "index,score\nbb_design_0,1.0\nbb_design_1,2.0\n",
        )
        .unwrap();
        let results = dir.path().join("results");
        std::fs::create_dir_all(&results).unwrap();
        std::fs::write(results.join("bb.fa"), ">bb_design_1\nMKVL\n").unwrap();

        let annotated = annotate_whether_pass(&report, &results).unwrap();
        assert!(annotated);
        let content = std::fs::read_to_string(&report).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "index,score,whether_pass");
        assert_eq!(lines[1], "bb_design_0,1.0,false");
        assert_eq!(lines[2], "bb_design_1,2.0,true");
    }

    #[test]
    fn missing_results_folder_omits_column() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("design_report.csv");
        std::fs::write(&report, "index,score\nbb_design_0,1.0\n").unwrap();
        let annotated =
            annotate_whether_pass(&report, &dir.path().join("nowhere")).unwrap();
        assert!(!annotated);
        let content = std::fs::read_to_string(&report).unwrap();
        assert!(!content.contains("whether_pass"));
    }

    #[test]
    fn position_ranges_parse_all_forms() {
        assert_eq!(parse_position_range("346-394"), Some((346, 394)));
        assert_eq!(parse_position_range("A346-394"), Some((346, 394)));
        assert_eq!(parse_position_range("346 350 394"), Some((346, 394)));
        assert_eq!(parse_position_range("A12"), Some((12, 12)));
        assert_eq!(parse_position_range("nope"), None);
    }

    #[test]
    fn natural_key_orders_numeric_suffixes() {
        let mut names = vec!["bb_10", "bb_2", "bb_1"];
        names.sort_by_key(|n| natural_key(n));
        assert_eq!(names, vec!["bb_1", "bb_2", "bb_10"]);
    }
}
