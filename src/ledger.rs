/// Append-only ledger of main-chain blocks found by this pool
///
/// One whitespace-delimited record per line:
/// `<unix ts> <height> <64-hex id> <block difficulty> <cumulative hashes>`.
/// A crash can leave the final record truncated; loading stops at the last
/// complete record and the file is trimmed back to it so later appends start
/// on a clean line.

use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::{BlockId, Difficulty, FoundBlock};

pub const FOUND_BLOCKS_FILE: &str = "p2pool.blocks";

pub struct FoundBlocks {
    path: PathBuf,
    blocks: Mutex<Vec<FoundBlock>>,
}

fn parse_records(contents: &str) -> Vec<FoundBlock> {
    let mut blocks = Vec::new();

    let mut tokens = contents.split_whitespace();
    loop {
        let record: Option<FoundBlock> = (|| {
            let timestamp = tokens.next()?.parse::<i64>().ok()?;
            let height = tokens.next()?.parse::<u64>().ok()?;
            let id = BlockId::from_hex(tokens.next()?)?;
            let block_diff = tokens.next()?.parse::<Difficulty>().ok()?;
            let total_hashes = tokens.next()?.parse::<Difficulty>().ok()?;
            Some(FoundBlock {
                timestamp,
                height,
                id,
                block_diff,
                total_hashes,
            })
        })();

        match record {
            Some(b) => blocks.push(b),
            None => break,
        }
    }

    blocks
}

fn render_record(b: &FoundBlock) -> String {
    format!(
        "{} {} {} {} {}\n",
        b.timestamp, b.height, b.id, b.block_diff, b.total_hashes
    )
}

impl FoundBlocks {
    /// Open the ledger, loading every complete record already on disk. A
    /// missing file is an empty ledger; a torn final record is discarded and
    /// the file rewritten without it.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut blocks = Vec::new();

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let parsed = parse_records(&contents);
                let clean: String = parsed.iter().map(render_record).collect();
                if clean.len() != contents.len() {
                    tracing::warn!(
                        "found-blocks file has a truncated final record, keeping {} complete records",
                        parsed.len()
                    );
                    if let Err(e) = std::fs::write(&path, &clean) {
                        tracing::warn!("couldn't rewrite found-blocks file: {}", e);
                    }
                }
                blocks = parsed;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("couldn't read found-blocks file {:?}: {}", path, e),
        }

        if !blocks.is_empty() {
            tracing::info!("loaded {} found blocks from {:?}", blocks.len(), path);
        }

        Self {
            path,
            blocks: Mutex::new(blocks),
        }
    }

    /// Record one found block in memory and on disk. File errors are logged
    /// and swallowed; the in-memory ledger keeps working.
    pub fn append(&self, block: FoundBlock) {
        let line = render_record(&block);
        let write: Result<()> = (|| {
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            f.write_all(line.as_bytes())?;
            Ok(())
        })();
        if let Err(e) = write {
            tracing::warn!("couldn't append to found-blocks file {:?}: {}", self.path, e);
        }

        self.blocks.lock().unwrap().push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<FoundBlock> {
        self.blocks.lock().unwrap().last().cloned()
    }

    /// Up to `n` most recent blocks, oldest first.
    pub fn recent(&self, n: usize) -> Vec<FoundBlock> {
        let blocks = self.blocks.lock().unwrap();
        let skip = blocks.len().saturating_sub(n);
        blocks[skip..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HASH_SIZE;

    fn block(n: u64) -> FoundBlock {
        FoundBlock {
            timestamp: 1_700_000_000 + n as i64,
            height: 2_800_000 + n,
            id: BlockId([n as u8; HASH_SIZE]),
            block_diff: Difficulty::from_u128(300_000_000_000 + n as u128),
            total_hashes: Difficulty::from_u128(1 << 40),
        }
    }

    #[test]
    fn append_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FOUND_BLOCKS_FILE);

        {
            let ledger = FoundBlocks::open(&path);
            for n in 0..5 {
                ledger.append(block(n));
            }
        }

        let ledger = FoundBlocks::open(&path);
        assert_eq!(ledger.len(), 5);
        assert_eq!(ledger.last(), Some(block(4)));
        assert_eq!(ledger.recent(2), vec![block(3), block(4)]);
    }

    #[test]
    fn truncated_final_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FOUND_BLOCKS_FILE);

        let mut contents = String::new();
        for n in 0..3 {
            contents.push_str(&render_record(&block(n)));
        }
        // crash mid-write: timestamp + height + half a hash
        contents.push_str("1700000099 2800099 abcdef");
        std::fs::write(&path, &contents).unwrap();

        let ledger = FoundBlocks::open(&path);
        assert_eq!(ledger.len(), 3);

        // appends after recovery keep the file parseable
        ledger.append(block(10));
        ledger.append(block(11));

        let reloaded = FoundBlocks::open(&path);
        assert_eq!(reloaded.len(), 5);
        assert_eq!(reloaded.last(), Some(block(11)));
    }

    #[test]
    fn missing_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FoundBlocks::open(dir.path().join("nope.blocks"));
        assert!(ledger.is_empty());
        assert_eq!(ledger.recent(51), Vec::new());
    }

    #[test]
    fn recent_caps_at_available() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FoundBlocks::open(dir.path().join(FOUND_BLOCKS_FILE));
        ledger.append(block(1));
        assert_eq!(ledger.recent(51).len(), 1);
    }
}
