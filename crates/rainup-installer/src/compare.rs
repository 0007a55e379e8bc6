use std::io::{self, ErrorKind, Read};

const COMPARE_CHUNK: usize = 64 * 1024;

/// Returns `true` when both readers yield the same bytes through to EOF.
///
/// Each side keeps its own read count, so a length mismatch (one side hitting
/// EOF first) counts as a difference.
pub fn contents_match(live: &mut dyn Read, archived: &mut dyn Read) -> io::Result<bool> {
    let mut live_buf = vec![0_u8; COMPARE_CHUNK];
    let mut archived_buf = vec![0_u8; COMPARE_CHUNK];

    loop {
        let live_read = read_full(live, &mut live_buf)?;
        let archived_read = read_full(archived, &mut archived_buf)?;
        if live_read != archived_read || live_buf[..live_read] != archived_buf[..archived_read] {
            return Ok(false);
        }
        if live_read == 0 {
            return Ok(true);
        }
    }
}

/// Fills `buf` unless EOF comes first; returns the byte count.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
