//! Optional per-run data dumps.
//!
//! Plain whitespace-separated `seq_no nonce timestamp` rows, one file per
//! run, named by wall-clock timestamp. These are a debugging aid, not part
//! of the protocol; failures to write are the caller's to downgrade to a
//! warning.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Write one row per record to `<UTC timestamp>_<suffix>.txt` under `dir`.
/// Returns the path written.
pub fn write_rows(
    dir: &Path,
    suffix: &str,
    rows: impl Iterator<Item = (u32, u32, u64)>,
) -> std::io::Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let path = dir.join(format!("{stamp}_{suffix}.txt"));
    let mut out = BufWriter::new(std::fs::File::create(&path)?);
    for (seq_no, nonce, timestamp) in rows {
        writeln!(out, "{seq_no} {nonce} {timestamp}")?;
    }
    out.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_written() {
        let dir = std::env::temp_dir().join(format!("mbm-logfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let rows = vec![(0u32, 11u32, 100u64), (1, 22, 200)];
        let path = write_rows(&dir, "clientdata", rows.into_iter()).unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("_clientdata.txt"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "0 11 100\n1 22 200\n");

        std::fs::remove_dir_all(&dir).ok();
    }
}
