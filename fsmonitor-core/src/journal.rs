//! Append-only, token-indexed journal of changed paths.
//!
//! One journal holds one epoch at a time. Each recorded path carries the
//! `seq_nr` of its most recent change; older entries for the same path are
//! coalesced away, which keeps "changed since N" answers correct because a
//! path recorded at N+k is still returned to every query below N+k.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::ops::Bound;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::token::{Epoch, QueryRequest, Token};

/// `run_id` used when deterministic tokens are requested.
pub const DETERMINISTIC_RUN_ID: &str = "test";

/// Single entry that renders a rescan-required answer in the text format.
pub const RESCAN_MARKER: &str = "/";

/// Answer to a journal query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Current token; the client sends it back on its next query.
    pub token: Token,
    /// The client must assume everything changed. `paths` is empty.
    pub rescan: bool,
    /// Root-relative paths changed since the requested position, sorted.
    pub paths: Vec<String>,
}

impl QueryResponse {
    pub fn changed(token: Token, paths: Vec<String>) -> Self {
        Self {
            token,
            rescan: false,
            paths,
        }
    }

    pub fn rescan(token: Token) -> Self {
        Self {
            token,
            rescan: true,
            paths: Vec::new(),
        }
    }

    /// Text rendering: token header line, then every entry terminated by NUL.
    /// A rescan renders as the single entry `/`.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.token);
        if self.rescan {
            out.push_str(RESCAN_MARKER);
            out.push('\0');
        } else {
            for path in &self.paths {
                out.push_str(path);
                out.push('\0');
            }
        }
        out
    }

    /// Parse the text rendering produced by [`QueryResponse::to_wire`].
    pub fn from_wire(text: &str) -> Option<Self> {
        let (header, body) = text.split_once('\n')?;
        let token: Token = header.parse().ok()?;
        let entries: Vec<String> = body
            .split('\0')
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        if entries.len() == 1 && entries[0] == RESCAN_MARKER {
            return Some(Self::rescan(token));
        }
        Some(Self::changed(token, entries))
    }
}

/// Result of appending a batch of paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    /// Journal position after the batch.
    pub token: Token,
    /// The batch pushed the journal past its limit and a new epoch began.
    pub limit_flushed: bool,
}

#[derive(Debug)]
pub struct Journal {
    run_id: String,
    generation: u64,
    seq_nr: u64,
    by_seq: BTreeMap<u64, String>,
    latest: HashMap<String, u64>,
    limit: usize,
}

impl Journal {
    /// New journal at generation 0, `seq_nr` 0. `limit` is the number of
    /// distinct paths held before the journal flushes itself.
    pub fn new(deterministic: bool, limit: usize) -> Self {
        Self::with_run_id(generate_run_id(deterministic), limit)
    }

    pub fn with_run_id(run_id: impl Into<String>, limit: usize) -> Self {
        Self {
            run_id: run_id.into(),
            generation: 0,
            seq_nr: 0,
            by_seq: BTreeMap::new(),
            latest: HashMap::new(),
            limit: limit.max(1),
        }
    }

    pub fn current_token(&self) -> Token {
        Token::new(self.run_id.clone(), self.generation, self.seq_nr)
    }

    pub fn epoch(&self) -> Epoch {
        Epoch {
            run_id: self.run_id.clone(),
            generation: self.generation,
        }
    }

    /// Number of distinct paths recorded in the current epoch.
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Record `path` at the next `seq_nr`. Returns that `seq_nr`.
    pub fn append(&mut self, path: impl Into<String>) -> u64 {
        self.seq_nr += 1;
        let seq_nr = self.seq_nr;
        let path = path.into();
        if let Some(previous) = self.latest.insert(path.clone(), seq_nr) {
            self.by_seq.remove(&previous);
        }
        self.by_seq.insert(seq_nr, path);
        seq_nr
    }

    /// Record every path of one notification under a single borrow.
    pub fn append_batch<I, S>(&mut self, paths: I) -> Appended
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            self.append(path);
        }
        let limit_flushed = self.by_seq.len() > self.limit;
        if limit_flushed {
            self.flush();
        }
        Appended {
            token: self.current_token(),
            limit_flushed,
        }
    }

    /// Paths changed after the requested position, or rescan-required when
    /// the request cannot be answered from this epoch.
    pub fn query(&self, request: &QueryRequest) -> QueryResponse {
        let current = self.current_token();
        let since = match request {
            QueryRequest::Since(token)
                if token.same_epoch(&current) && token.seq_nr <= self.seq_nr =>
            {
                token.seq_nr
            }
            _ => return QueryResponse::rescan(current),
        };

        let mut paths: Vec<String> = self
            .by_seq
            .range((Bound::Excluded(since), Bound::Unbounded))
            .map(|(_, path)| path.clone())
            .collect();
        paths.sort();
        QueryResponse::changed(current, paths)
    }

    /// Discard the epoch and start the next one. Returns the new empty token.
    pub fn flush(&mut self) -> Token {
        self.generation += 1;
        self.seq_nr = 0;
        self.by_seq.clear();
        self.latest.clear();
        self.current_token()
    }
}

fn generate_run_id(deterministic: bool) -> String {
    if deterministic {
        return DETERMINISTIC_RUN_ID.to_string();
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{:x}.{:x}", std::process::id(), nanos)
}
