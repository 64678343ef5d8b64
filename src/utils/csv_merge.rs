use crate::utils::error::{Result, WkeError};
use std::fs;
use std::path::Path;

const CONSTANTS_PREFIX: &str = "# constants:";

fn extract_constants(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .find(|line| line.starts_with(CONSTANTS_PREFIX))
        .map(str::to_string)
        .ok_or_else(|| WkeError::invalid(format!("No constants found in file {}", path.display())))
}

struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn read_table(path: &Path) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }

    Ok(Table { headers, rows })
}

/// Merges `infile1` and `infile2` into `outfile`.
///
/// The output columns are the union of both headers, in order of first
/// appearance. Cells missing from a file are left empty. Both files must
/// carry the same `# constants: ...` line.
pub fn merge_csv(infile1: &Path, infile2: &Path, outfile: &Path) -> Result<()> {
    let consts1 = extract_constants(infile1)?;
    let consts2 = extract_constants(infile2)?;

    if consts1 != consts2 {
        return Err(WkeError::invalid(
            "Cannot merge CSV files: Constants do not match!",
        ));
    }

    let first = read_table(infile1)?;
    let second = read_table(infile2)?;

    let mut headers = first.headers.clone();
    for header in &second.headers {
        if !headers.contains(header) {
            headers.push(header.clone());
        }
    }

    let mut output = Vec::new();
    output.extend_from_slice(consts1.as_bytes());
    output.push(b'\n');

    {
        let mut writer = csv::Writer::from_writer(&mut output);
        writer.write_record(&headers)?;

        for table in [&first, &second] {
            for row in &table.rows {
                let merged: Vec<&str> = headers
                    .iter()
                    .map(|header| {
                        table
                            .headers
                            .iter()
                            .position(|h| h == header)
                            .and_then(|pos| row.get(pos))
                            .map(String::as_str)
                            .unwrap_or("")
                    })
                    .collect();
                writer.write_record(&merged)?;
            }
        }

        writer.flush()?;
    }

    fs::write(outfile, output)?;
    tracing::debug!("Merged CSV files into {}", outfile.display());
    Ok(())
}
