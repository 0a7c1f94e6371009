use std::io;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Default chunk size for backward reading: 8KB.
const CHUNK_SIZE: u64 = 8 * 1024;

/// Read the last non-blank line of a file without loading the whole file.
///
/// Seeks to EOF and reads backwards in 8KB chunks until a line that is
/// not all whitespace has been fully delimited (or the start of the file
/// is reached). The returned line is trimmed. Returns `None` for an empty
/// or all-blank file.
pub async fn read_last_line(path: &Path) -> io::Result<Option<String>> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_len = file.metadata().await?.len();

    let mut collected: Vec<u8> = Vec::new();
    let mut remaining = file_len;

    while remaining > 0 {
        let chunk_len = remaining.min(CHUNK_SIZE);
        let offset = remaining - chunk_len;

        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; chunk_len as usize];
        file.read_exact(&mut buf).await?;

        buf.append(&mut collected);
        collected = buf;
        remaining = offset;

        // A content line is complete once a newline precedes it.
        if let Some(line) = last_delimited_line(&collected) {
            return Ok(Some(line));
        }
    }

    Ok(last_line(&collected))
}

/// Last non-blank line that has a `\n` before it in `bytes`.
fn last_delimited_line(bytes: &[u8]) -> Option<String> {
    let mut end = bytes.len();
    while let Some(pos) = bytes[..end].iter().rposition(|&b| b == b'\n') {
        let candidate = &bytes[pos + 1..end];
        if !candidate.iter().all(u8::is_ascii_whitespace) {
            return Some(String::from_utf8_lossy(candidate).trim().to_string());
        }
        end = pos;
    }
    None
}

/// Last non-blank line of the complete buffer, including the first line.
fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
