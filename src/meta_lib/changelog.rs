/// Append-only changelog of metadata mutations.
///
/// The master formats one line per mutation as `<version>: <ts>|OP(args)[:result]`,
/// appends it to `changelog.mfs` and keeps the same bytes queued for
/// broadcast to metaloggers and shadow masters. Rotation happens at every
/// image dump so replay never needs more than the latest files.
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::*;

pub const CHANGELOG_FILENAME: &str = "changelog.mfs";

/// A parsed changelog line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogEntry {
    pub version: u64,
    pub ts: u32,
    pub op: String,
    pub args: Vec<String>,
    pub result: Option<String>,
}

impl ChangelogEntry {
    /// Parses `<version>: <ts>|OP(a,b,c):result`.
    pub fn parse(line: &str) -> Result<Self> {
        let (version_part, payload) = match line.split_once(": ") {
            Some(parts) => parts,
            None => bail!("changelog line without version prefix: {:?}", line),
        };
        let version: u64 = version_part
            .trim()
            .parse()
            .with_context(|| format!("bad version in changelog line {:?}", line))?;
        let (ts_part, rest) = match payload.split_once('|') {
            Some(parts) => parts,
            None => bail!("changelog line without timestamp: {:?}", line),
        };
        let ts: u32 = ts_part
            .parse()
            .with_context(|| format!("bad timestamp in changelog line {:?}", line))?;
        let open = match rest.find('(') {
            Some(pos) => pos,
            None => bail!("changelog line without operation: {:?}", line),
        };
        let close = match rest.rfind(')') {
            Some(pos) if pos >= open => pos,
            _ => bail!("unbalanced parentheses in changelog line: {:?}", line),
        };
        let op = rest[..open].to_string();
        if op.is_empty() || !op.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            bail!("bad operation name in changelog line: {:?}", line);
        }
        let args_str = &rest[open + 1..close];
        let args = if args_str.is_empty() {
            Vec::new()
        } else {
            args_str.split(',').map(str::to_string).collect()
        };
        let result = rest[close + 1..].strip_prefix(':').map(str::to_string);
        Ok(ChangelogEntry { version, ts, op, args, result })
    }
}

pub struct ChangelogWriter {
    /// `None` keeps everything in memory (shadow personality and tests).
    path: Option<PathBuf>,
    file: Option<File>,
    /// Lines written since the last `drain_pending` call, for broadcast.
    pending: Vec<(u64, String)>,
}

impl ChangelogWriter {
    pub fn in_memory() -> Self {
        ChangelogWriter { path: None, file: None, pending: Vec::new() }
    }

    pub fn new(data_path: &Path) -> Self {
        ChangelogWriter {
            path: Some(data_path.join(CHANGELOG_FILENAME)),
            file: None,
            pending: Vec::new(),
        }
    }

    /// Appends one already-formatted record. `payload` starts at the timestamp.
    pub fn append(&mut self, version: u64, payload: &str) {
        let line = format!("{}: {}", version, payload);
        if let Some(path) = &self.path {
            if self.file.is_none() {
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(f) => self.file = Some(f),
                    Err(e) => error!("cannot open {}: {}", path.display(), e),
                }
            }
            if let Some(f) = &mut self.file {
                if let Err(e) = writeln!(f, "{}", line) {
                    error!("changelog write failed: {}", e);
                }
            }
        }
        self.pending.push((version, line));
    }

    /// Hands off buffered lines to the metalogger broadcast.
    pub fn drain_pending(&mut self) -> Vec<(u64, String)> {
        std::mem::take(&mut self.pending)
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(f) = &mut self.file {
            f.flush().context("flushing changelog")?;
        }
        Ok(())
    }

    /// Shifts changelog.mfs -> changelog.mfs.1 -> changelog.mfs.2.
    /// Called when a new image dump starts so fresh records land in a new file.
    pub fn rotate(&mut self) -> Result<()> {
        self.flush()?;
        self.file = None;
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let first = path.with_extension("mfs.1");
        let second = path.with_extension("mfs.2");
        if first.exists() {
            std::fs::rename(&first, &second)
                .with_context(|| format!("rotating {} -> {}", first.display(), second.display()))?;
        }
        if path.exists() {
            std::fs::rename(&path, &first)
                .with_context(|| format!("rotating {} -> {}", path.display(), first.display()))?;
        }
        debug!("changelog rotated");
        Ok(())
    }
}

/// Reads every entry of a changelog file in order.
pub fn read_changelog(path: &Path) -> Result<Vec<ChangelogEntry>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut entries = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.is_empty() {
            continue;
        }
        let entry = ChangelogEntry::parse(&line)
            .with_context(|| format!("{}:{}", path.display(), lineno + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_record() {
        let e = ChangelogEntry::parse("17: 1000|UNLINK(5,name.txt):9").unwrap();
        assert_eq!(e.version, 17);
        assert_eq!(e.ts, 1000);
        assert_eq!(e.op, "UNLINK");
        assert_eq!(e.args, vec!["5", "name.txt"]);
        assert_eq!(e.result.as_deref(), Some("9"));
    }

    #[test]
    fn parse_record_without_result() {
        let e = ChangelogEntry::parse("3: 55|ACCESS(42)").unwrap();
        assert_eq!(e.op, "ACCESS");
        assert_eq!(e.args, vec!["42"]);
        assert!(e.result.is_none());
    }

    #[test]
    fn parse_empty_args() {
        let e = ChangelogEntry::parse("8: 55|SESSION():12").unwrap();
        assert!(e.args.is_empty());
        assert_eq!(e.result.as_deref(), Some("12"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ChangelogEntry::parse("no version").is_err());
        assert!(ChangelogEntry::parse("1: 2|lowercase(1)").is_err());
        assert!(ChangelogEntry::parse("1: 2|OP").is_err());
        assert!(ChangelogEntry::parse("x: 2|OP(1)").is_err());
    }

    #[test]
    fn in_memory_writer_buffers_lines() {
        let mut w = ChangelogWriter::in_memory();
        w.append(5, "100|PURGE(3)");
        w.append(6, "101|PURGE(4)");
        let pending = w.drain_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1, "5: 100|PURGE(3)");
        assert!(w.drain_pending().is_empty());
    }

    #[test]
    fn escaped_name_with_comma_stays_one_argument() {
        use crate::meta_lib::codec::escape_name;
        let line = format!("1: 2|UNLINK(5,{}):6", escape_name(b"a,b"));
        let e = ChangelogEntry::parse(&line).unwrap();
        assert_eq!(e.args.len(), 2);
        assert_eq!(e.args[1], "a%2Cb");
    }
}
