use anyhow::{Context, Result};
use log::info;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Per-residue secondary structure assignment extracted from one DSSP data
/// line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsRecord {
    pub residue_number: u32,
    pub chain: char,
    pub amino_acid: char,
    /// 8-state DSSP code; a blank assignment column is normalized to `C`.
    pub ss8: char,
    /// Reduced 3-state class: H, E or C.
    pub ss3: char,
    pub description: &'static str,
}

fn data_line_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Residue number, PDB number, chain, amino acid, then the structure
    // letter which may be a blank column.
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+\d+\s+([A-Z])\s+([A-Z])\s+([A-Z ])").unwrap())
}

fn describe_ss8(code: char) -> &'static str {
    match code {
        'H' => "α-helix",
        'E' => "β-strand",
        'B' => "β-bridge",
        'G' => "3/10-helix",
        'I' => "π-helix",
        'P' => "κ-helix",
        'T' => "Turn",
        'S' => "Bend",
        'C' => "Loop",
        _ => "Unknown",
    }
}

/// Fixed 8-state to 3-state reduction: helix family to H, strand family to
/// E, everything else (turn, bend, loop) to C.
pub fn reduce_ss8(code: char) -> char {
    match code {
        'H' | 'G' | 'I' | 'P' => 'H',
        'E' | 'B' => 'E',
        _ => 'C',
    }
}

/// Parses DSSP output text into per-residue records. Comment and header
/// lines are skipped by prefix; lines that do not match the data-line shape
/// are skipped silently.
pub fn parse_dssp(content: &str) -> Vec<SsRecord> {
    let pattern = data_line_pattern();
    let mut records = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#')
            || trimmed.starts_with("HEADER")
            || trimmed.starts_with("COMPND")
            || trimmed.starts_with("SOURCE")
            || trimmed.starts_with('!')
        {
            continue;
        }

        let Some(caps) = pattern.captures(line) else {
            continue;
        };
        let Ok(residue_number) = caps[1].parse::<u32>() else {
            continue;
        };
        let chain = caps[2].chars().next().unwrap();
        let amino_acid = caps[3].chars().next().unwrap();
        let raw_ss8 = caps[4].chars().next().unwrap();

        // A blank assignment column is a valid state: loop.
        let ss8 = if raw_ss8 == ' ' { 'C' } else { raw_ss8 };
        records.push(SsRecord {
            residue_number,
            chain,
            amino_acid,
            ss8,
            ss3: reduce_ss8(ss8),
            description: describe_ss8(ss8),
        });
    }

    records
}

/// Reads a DSSP file and writes the structured CSV rendition.
pub fn dssp_to_csv(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
    let input = input.as_ref();
    let content = std::fs::read_to_string(input)
        .context(format!("Failed to read DSSP file: {:?}", input))?;
    let records = parse_dssp(&content);

    let output = output.as_ref();
    let mut writer = csv::Writer::from_path(output)
        .context(format!("Failed to create CSV file: {:?}", output))?;
    writer.write_record([
        "Residue_Number",
        "Chain",
        "Amino_Acid",
        "SS_8",
        "SS_3",
        "SS_Description",
    ])?;
    for r in &records {
        writer.write_record([
            r.residue_number.to_string(),
            r.chain.to_string(),
            r.amino_acid.to_string(),
            r.ss8.to_string(),
            r.ss3.to_string(),
            r.description.to_string(),
        ])?;
    }
    writer.flush()?;

    info!(
        "Extracted secondary structure for {} residues to {:?}",
        records.len(),
        output
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_lines_and_skips_headers() {
        let content = "\
HEADER    something
  #  RESIDUE AA STRUCTURE
    1    4 A  M  H  alpha
    2    5 A  K  E  strand
    3    6 A  V     coil
  !  chain break
garbage line
";
        let records = parse_dssp(content);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].residue_number, 1);
        assert_eq!(records[0].chain, 'A');
        assert_eq!(records[0].amino_acid, 'M');
        assert_eq!(records[0].ss8, 'H');
        assert_eq!(records[0].ss3, 'H');
        assert_eq!(records[1].ss3, 'E');
        // Blank assignment column means loop.
        assert_eq!(records[2].ss8, 'C');
        assert_eq!(records[2].ss3, 'C');
        assert_eq!(records[2].description, "Loop");
    }

    #[test]
    fn helix_and_strand_families_reduce_correctly() {
        for code in ['H', 'G', 'I', 'P'] {
            assert_eq!(reduce_ss8(code), 'H');
        }
        for code in ['E', 'B'] {
            assert_eq!(reduce_ss8(code), 'E');
        }
        for code in ['T', 'S', 'C', 'X'] {
            assert_eq!(reduce_ss8(code), 'C');
        }
    }

    #[test]
    fn descriptions_cover_the_eight_states() {
        let content = "    7   10 B  G  T  turn\n";
        let records = parse_dssp(content);
        assert_eq!(records[0].description, "Turn");
        assert_eq!(records[0].chain, 'B');
    }

    #[test]
    fn csv_output_has_expected_header() {
        let dir = tempfile::tempdir().unwrap();
        let dssp_path = dir.path().join("t.dssp");
        let csv_path = dir.path().join("t.csv");
        std::fs::write(&dssp_path, "    1    1 A  M  H\n").unwrap();
        dssp_to_csv(&dssp_path, &csv_path).unwrap();
        let content = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Residue_Number,Chain,Amino_Acid,SS_8,SS_3,SS_Description"
        );
        assert_eq!(lines.next().unwrap(), "1,A,M,H,H,α-helix");
    }
}
