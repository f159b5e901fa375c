use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// One record of a multi-record FASTA file. `id` is the first whitespace
/// delimited token of the header, `description` the full header line without
/// the leading `>`.
#[derive(Debug, Clone, PartialEq)]
pub struct FastaRecord {
    pub id: String,
    pub description: String,
    pub sequence: String,
}

impl FastaRecord {
    pub fn new(id: impl Into<String>, sequence: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            description: id.clone(),
            id,
            sequence: sequence.into(),
        }
    }
}

pub fn read_fasta(path: impl AsRef<Path>) -> Result<Vec<FastaRecord>> {
    let path = path.as_ref();
    let file =
        File::open(path).context(format!("Failed to open FASTA file: {:?}", path))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut header: Option<String> = None;
    let mut sequence = String::new();

    for line in reader.lines() {
        let line = line?;
        if let Some(rest) = line.strip_prefix('>') {
            if let Some(prev) = header.take() {
                records.push(record_from(prev, std::mem::take(&mut sequence)));
            }
            header = Some(rest.trim().to_string());
        } else if header.is_some() {
            sequence.push_str(line.trim());
        }
    }
    if let Some(prev) = header {
        records.push(record_from(prev, sequence));
    }

    Ok(records)
}

fn record_from(description: String, sequence: String) -> FastaRecord {
    let id = description
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches(',')
        .to_string();
    FastaRecord {
        id,
        description,
        sequence,
    }
}

pub fn write_fasta(path: impl AsRef<Path>, records: &[FastaRecord]) -> Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).context(format!("Failed to create FASTA file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        writeln!(writer, ">{}", record.description)?;
        writeln!(writer, "{}", record.sequence)?;
    }
    Ok(())
}

/// One labelled sequence, the shape-independent view both source kinds
/// reduce to.
#[derive(Debug, Clone)]
pub struct SequenceEntry {
    pub id: String,
    pub sequence: String,
}

/// A collection of labelled sequences, resolved once at the boundary from
/// either a delimited table (`index`/`sequence` columns) or a multi-record
/// FASTA file. File order is preserved in both cases.
#[derive(Debug)]
pub enum SequenceSource {
    Table(Vec<SequenceEntry>),
    Fasta(Vec<FastaRecord>),
}

impl SequenceSource {
    /// Detects the source shape by extension: `.csv` is a table, anything
    /// else is treated as FASTA.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_table = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"));
        if is_table {
            Ok(Self::Table(read_sequence_table(path)?))
        } else {
            Ok(Self::Fasta(read_fasta(path)?))
        }
    }

    pub fn entries(&self) -> Vec<SequenceEntry> {
        match self {
            Self::Table(rows) => rows.clone(),
            Self::Fasta(records) => records
                .iter()
                .map(|r| SequenceEntry {
                    id: r.description.clone(),
                    sequence: r.sequence.clone(),
                })
                .collect(),
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Self::Table(_))
    }
}

fn read_sequence_table(path: &Path) -> Result<Vec<SequenceEntry>> {
    let mut reader = csv::Reader::from_path(path)
        .context(format!("Failed to open sequence table: {:?}", path))?;
    let headers = reader.headers()?.clone();
    let id_col = headers
        .iter()
        .position(|h| h == "index")
        .context(format!("Sequence table {:?} has no `index` column", path))?;
    let seq_col = headers
        .iter()
        .position(|h| h == "sequence")
        .context(format!("Sequence table {:?} has no `sequence` column", path))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(SequenceEntry {
            id: record.get(id_col).unwrap_or_default().to_string(),
            sequence: record.get(seq_col).unwrap_or_default().to_string(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fasta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqs.fa");
        let records = vec![
            FastaRecord::new("a", "MKVLAT"),
            FastaRecord::new("b", "MKAAGT"),
        ];
        write_fasta(&path, &records).unwrap();
        let parsed = read_fasta(&path).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn fasta_multiline_bodies_and_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqs.fa");
        std::fs::write(&path, ">s1 sample sequence\nMKV\nLAT\n>s2\nGG\n").unwrap();
        let parsed = read_fasta(&path).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "s1");
        assert_eq!(parsed[0].description, "s1 sample sequence");
        assert_eq!(parsed[0].sequence, "MKVLAT");
        assert_eq!(parsed[1].sequence, "GG");
    }

    #[test]
    fn table_source_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqs.csv");
        std::fs::write(
            &path,
            "index,score,sequence\nb_0,1.0,MKVL\na_0,0.5,MKAA\n",
        )
        .unwrap();
        let source = SequenceSource::load(&path).unwrap();
        assert!(source.is_table());
        let entries = source.entries();
        assert_eq!(entries[0].id, "b_0");
        assert_eq!(entries[1].id, "a_0");
    }

    #[test]
    fn table_without_sequence_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqs.csv");
        std::fs::write(&path, "index,score\nb_0,1.0\n").unwrap();
        assert!(SequenceSource::load(&path).is_err());
    }
}
