#![forbid(unsafe_code)]
//! Trace replay harness.
//!
//! Parses a text trace of block store operations and replays it against a
//! freshly composed stack (verification over cache over statistics over a
//! raw backend). Writes use deterministic stamped payloads so both the
//! verification layer and the replay loop's own content check can catch
//! misbehaving layers.
//!
//! Trace format, one command per line (`#` starts a comment):
//!
//! ```text
//! w:<block>:<seed>     write the stamped payload for <block> with <seed>
//! r:<block>            read <block>, check it is zero or a stamped payload
//! s:<count>            resize the stack to <count> blocks
//! n:<count>            assert the current block count equals <count>
//! ```

use anyhow::{bail, Context};
use dstack_cache::{frame_buffer, CacheStats, CacheStore, ClockPolicy, EvictionPolicy, LruPolicy};
use dstack_error::Result;
use dstack_stats::{StatSnapshot, StatStore};
use dstack_store::{BlockStore, FileDisk, RamDisk};
use dstack_types::{Block, BlockIndex};
use dstack_verify::VerifyStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One parsed trace command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOp {
    Read(BlockIndex),
    Write(BlockIndex, u8),
    Resize(u64),
    ExpectCount(u64),
}

/// Parse a trace file's contents.
pub fn parse_trace(text: &str) -> anyhow::Result<Vec<TraceOp>> {
    let mut ops = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split(':');
        let cmd = fields.next().unwrap_or("");
        let parse_u64 = |field: Option<&str>, what: &str| -> anyhow::Result<u64> {
            field
                .with_context(|| format!("line {}: missing {what}", lineno + 1))?
                .trim()
                .parse::<u64>()
                .with_context(|| format!("line {}: invalid {what}", lineno + 1))
        };

        let op = match cmd.trim() {
            "r" | "R" => TraceOp::Read(BlockIndex(parse_u64(fields.next(), "block")?)),
            "w" | "W" => {
                let block = BlockIndex(parse_u64(fields.next(), "block")?);
                let seed = parse_u64(fields.next(), "seed")?;
                let seed = u8::try_from(seed)
                    .with_context(|| format!("line {}: seed must fit u8", lineno + 1))?;
                TraceOp::Write(block, seed)
            }
            "s" | "S" => TraceOp::Resize(parse_u64(fields.next(), "count")?),
            "n" | "N" => TraceOp::ExpectCount(parse_u64(fields.next(), "count")?),
            other => bail!("line {}: unknown command {other:?}", lineno + 1),
        };
        if fields.next().is_some() {
            bail!("line {}: trailing fields", lineno + 1);
        }
        ops.push(op);
    }
    Ok(ops)
}

/// Outcome counters for one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub ops: u64,
    pub reads: u64,
    pub writes: u64,
    pub resizes: u64,
    pub count_checks: u64,
    /// `n:` assertions that did not match the stack's block count.
    pub count_mismatches: u64,
    /// Reads whose content was neither zero nor a stamped payload for that
    /// index. The verification layer catches read-your-writes violations;
    /// this catches blocks stamped for the wrong index.
    pub content_mismatches: u64,
    /// Recoverable I/O failures (logged and skipped, like the original
    /// trace driver). Fatal corruption aborts the replay instead.
    pub io_errors: u64,
}

impl ReplayReport {
    #[must_use]
    pub fn clean(&self) -> bool {
        self.count_mismatches == 0 && self.content_mismatches == 0 && self.io_errors == 0
    }
}

fn stamped_content_ok(index: BlockIndex, block: &Block) -> bool {
    if *block == Block::ZERO {
        return true;
    }
    let mut front = [0_u8; 8];
    front.copy_from_slice(&block.as_slice()[..8]);
    u64::from_le_bytes(front) == index.0
}

/// Replay `ops` against `store`. Recoverable failures are logged and
/// counted; fatal errors (corruption) propagate immediately.
pub fn replay<S: BlockStore>(store: &S, ops: &[TraceOp]) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    for op in ops {
        report.ops += 1;
        match op {
            TraceOp::Read(index) => {
                report.reads += 1;
                match store.read_block(*index) {
                    Ok(block) => {
                        if !stamped_content_ok(*index, &block) {
                            tracing::warn!(index = %index, "unexpected content in replayed read");
                            report.content_mismatches += 1;
                        }
                    }
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => {
                        tracing::warn!(index = %index, %error, "read failed during replay");
                        report.io_errors += 1;
                    }
                }
            }
            TraceOp::Write(index, seed) => {
                report.writes += 1;
                let block = Block::stamped(*index, *seed);
                match store.write_block(*index, &block) {
                    Ok(()) => {}
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => {
                        tracing::warn!(index = %index, %error, "write failed during replay");
                        report.io_errors += 1;
                    }
                }
            }
            TraceOp::Resize(count) => {
                report.resizes += 1;
                match store.resize(*count) {
                    Ok(_) => {}
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => {
                        tracing::warn!(count, %error, "resize failed during replay");
                        report.io_errors += 1;
                    }
                }
            }
            TraceOp::ExpectCount(count) => {
                report.count_checks += 1;
                let actual = store.block_count();
                if actual != *count {
                    tracing::warn!(expected = count, actual, "block count assertion failed");
                    report.count_mismatches += 1;
                }
            }
        }
    }
    Ok(report)
}

/// Eviction policy selection for a replay stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    #[default]
    Clock,
    Lru,
}

impl FromStr for Policy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "clock" => Ok(Self::Clock),
            "lru" => Ok(Self::Lru),
            other => bail!("unknown policy {other:?} (expected clock or lru)"),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clock => f.write_str("clock"),
            Self::Lru => f.write_str("lru"),
        }
    }
}

/// How to assemble the stack a trace runs against.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Initial size of the raw backend, in blocks.
    pub store_blocks: u64,
    /// Cache capacity, in slots.
    pub cache_blocks: usize,
    pub policy: Policy,
    /// File-backed leaf instead of RAM when set.
    pub image: Option<PathBuf>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            store_blocks: 128,
            cache_blocks: 16,
            policy: Policy::Clock,
            image: None,
        }
    }
}

/// Everything a finished run reports: replay outcome plus the counters of
/// the cache and statistics layers in the stack.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub report: ReplayReport,
    pub cache: CacheStats,
    pub store: StatSnapshot,
}

fn run_with_policy<P: EvictionPolicy>(
    leaf: Box<dyn BlockStore>,
    config: &StackConfig,
    policy: impl FnOnce(usize) -> P,
    ops: &[TraceOp],
) -> anyhow::Result<RunSummary> {
    let counted = StatStore::new(leaf);
    let cache = CacheStore::with_policy(counted, frame_buffer(config.cache_blocks), policy)
        .context("building cache layer")?;
    let stack = VerifyStore::new(cache, "replay");

    let report = replay(&stack, ops).context("trace replay")?;
    let cache_stats = stack.inner().stats();
    let store_stats = stack.inner().inner().snapshot();
    Ok(RunSummary {
        report,
        cache: cache_stats,
        store: store_stats,
    })
}

/// Compose a stack per `config` and replay `ops` through it.
pub fn run_trace(config: &StackConfig, ops: &[TraceOp]) -> anyhow::Result<RunSummary> {
    let leaf: Box<dyn BlockStore> = match &config.image {
        Some(path) => Box::new(
            FileDisk::open(path, config.store_blocks)
                .with_context(|| format!("opening image {}", path.display()))?,
        ),
        None => Box::new(RamDisk::new(config.store_blocks)),
    };

    match config.policy {
        Policy::Clock => run_with_policy(leaf, config, ClockPolicy::with_capacity, ops),
        Policy::Lru => run_with_policy(leaf, config, LruPolicy::with_capacity, ops),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_comments_and_blanks() {
        let trace = "\
# warm up
w:3:17
r:3

n:128   # size untouched so far
s:4
N:4
";
        let ops = parse_trace(trace).expect("parse");
        assert_eq!(
            ops,
            vec![
                TraceOp::Write(BlockIndex(3), 17),
                TraceOp::Read(BlockIndex(3)),
                TraceOp::ExpectCount(128),
                TraceOp::Resize(4),
                TraceOp::ExpectCount(4),
            ]
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_trace("x:1").is_err());
        assert!(parse_trace("r").is_err());
        assert!(parse_trace("w:1").is_err());
        assert!(parse_trace("w:1:300").is_err());
        assert!(parse_trace("r:1:2").is_err());
        assert!(parse_trace("r:abc").is_err());
    }

    #[test]
    fn replay_reports_clean_run() {
        let config = StackConfig {
            store_blocks: 8,
            cache_blocks: 2,
            ..StackConfig::default()
        };
        let ops = parse_trace("w:1:9\nw:2:9\nr:1\nr:2\nn:8\ns:2\nn:2\n").expect("parse");
        let summary = run_trace(&config, &ops).expect("run");

        assert!(summary.report.clean());
        assert_eq!(summary.report.ops, 7);
        assert_eq!(summary.store.writes, 2);
        assert_eq!(summary.cache.write_misses, 2);
        assert_eq!(summary.cache.read_hits, 2);
    }

    #[test]
    fn replay_counts_recoverable_errors_and_continues() {
        let config = StackConfig {
            store_blocks: 4,
            cache_blocks: 2,
            ..StackConfig::default()
        };
        // Block 9 is out of range for a 4-block store.
        let ops = parse_trace("w:9:1\nr:9\nw:0:1\nr:0\n").expect("parse");
        let summary = run_trace(&config, &ops).expect("run");

        assert_eq!(summary.report.io_errors, 2);
        assert_eq!(summary.report.content_mismatches, 0);
        assert_eq!(summary.cache.write_misses, 1);
    }

    #[test]
    fn replay_flags_count_mismatches() {
        let config = StackConfig {
            store_blocks: 4,
            cache_blocks: 2,
            ..StackConfig::default()
        };
        let ops = parse_trace("n:5\n").expect("parse");
        let summary = run_trace(&config, &ops).expect("run");
        assert_eq!(summary.report.count_mismatches, 1);
        assert!(!summary.report.clean());
    }

    #[test]
    fn policy_parses_from_str() {
        assert_eq!("clock".parse::<Policy>().expect("clock"), Policy::Clock);
        assert_eq!("lru".parse::<Policy>().expect("lru"), Policy::Lru);
        assert!("arc".parse::<Policy>().is_err());
    }
}
