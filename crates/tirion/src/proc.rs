// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! /proc parsing for the external (`proc.*`) metrics of a monitored process.
//!
//! Four sources are supported, each read at most once per sampling tick:
//!
//! ```text
//! /proc/<pid>/stat    proc.stat.*   general process status (44 fields)
//! /proc/<pid>/io      proc.io.*     I/O counters
//! /proc/<pid>/statm   proc.statm.*  memory map summary in pages
//! /proc/*/stat        proc.all.*    rss and vsize summed over the process tree, in KB
//! ```
//!
//! Every source is parsed into a vector ordered like its field table, so an external metric is
//! resolved once at startup into a `(source, index)` pair. Fields that are not numeric (`comm`,
//! `state`) read as 0.

use std::fs;
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use nix::unistd::{sysconf, SysconfVar};
use tracing::{debug, trace};

use crate::errors::ProcError;

pub const PROC_PATH: &str = "/proc";

const DEFAULT_PAGE_SIZE: u64 = 4096;

pub const ALL_FIELDS: [&str; 2] = ["proc.all.rssize", "proc.all.vsize"];

pub const IO_FIELDS: [&str; 7] = [
    "proc.io.rchar",
    "proc.io.wchar",
    "proc.io.syscr",
    "proc.io.syscw",
    "proc.io.read_bytes",
    "proc.io.write_bytes",
    "proc.io.cancelled_write_bytes",
];

pub const STAT_FIELDS: [&str; 44] = [
    "proc.stat.pid",
    "proc.stat.comm",
    "proc.stat.state",
    "proc.stat.ppid",
    "proc.stat.pgrp",
    "proc.stat.session",
    "proc.stat.tty_nr",
    "proc.stat.tpgid",
    "proc.stat.flags",
    "proc.stat.minflt",
    "proc.stat.cminflt",
    "proc.stat.majflt",
    "proc.stat.cmajflt",
    "proc.stat.utime",
    "proc.stat.stime",
    "proc.stat.cutime",
    "proc.stat.cstime",
    "proc.stat.priority",
    "proc.stat.nice",
    "proc.stat.num_threads",
    "proc.stat.itrealvalue",
    "proc.stat.starttime",
    "proc.stat.vsize",
    "proc.stat.rss",
    "proc.stat.rsslim",
    "proc.stat.startcode",
    "proc.stat.endcode",
    "proc.stat.startstack",
    "proc.stat.kstkesp",
    "proc.stat.kstkeip",
    "proc.stat.signal",
    "proc.stat.blocked",
    "proc.stat.sigignore",
    "proc.stat.sigcatch",
    "proc.stat.wchan",
    "proc.stat.nswap",
    "proc.stat.cnswap",
    "proc.stat.exit_signal",
    "proc.stat.processor",
    "proc.stat.rt_priority",
    "proc.stat.policy",
    "proc.stat.delayacct_blkio_ticks",
    "proc.stat.guest_time",
    "proc.stat.cguest_time",
];

pub const STATM_FIELDS: [&str; 7] = [
    "proc.statm.size",
    "proc.statm.resident",
    "proc.statm.share",
    "proc.statm.text",
    "proc.statm.lib",
    "proc.statm.data",
    "proc.statm.dt",
];

const STAT_PPID: usize = 3;
const STAT_VSIZE: usize = 22;
const STAT_RSS: usize = 23;

/// The OS file (or file set) an external metric is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcSource {
    All,
    Io,
    Stat,
    Statm,
}

impl ProcSource {
    pub const ALL: [ProcSource; 4] = [
        ProcSource::All,
        ProcSource::Io,
        ProcSource::Stat,
        ProcSource::Statm,
    ];

    #[must_use]
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            ProcSource::All => &ALL_FIELDS,
            ProcSource::Io => &IO_FIELDS,
            ProcSource::Stat => &STAT_FIELDS,
            ProcSource::Statm => &STATM_FIELDS,
        }
    }
}

/// Position of an external metric inside the parsed output of its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalField {
    pub source: ProcSource,
    pub index: usize,
}

/// Resolves a `proc.*` metric name against the field tables.
#[must_use]
pub fn lookup(name: &str) -> Option<ExternalField> {
    ProcSource::ALL.iter().find_map(|source| {
        source
            .fields()
            .iter()
            .position(|field| *field == name)
            .map(|index| ExternalField {
                source: *source,
                index,
            })
    })
}

/// Reads process statistics below a `/proc`-like root.
#[derive(Debug, Clone)]
pub struct ProcReader {
    root: PathBuf,
    page_size: u64,
}

impl Default for ProcReader {
    fn default() -> Self {
        Self::new(PROC_PATH)
    }
}

impl ProcReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: page_size(),
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn pid_path(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Whether the process still has an entry under the proc root.
    #[must_use]
    pub fn exists(&self, pid: i32) -> bool {
        self.pid_path(pid).is_dir()
    }

    /// Reads one source, returning values ordered like [`ProcSource::fields`].
    pub fn read(&self, pid: i32, source: ProcSource) -> Result<Vec<f64>, ProcError> {
        match source {
            ProcSource::All => self.read_all(pid),
            ProcSource::Io => {
                let path = self.pid_path(pid).join("io");
                Ok(parse_io(&read_file(&path)?))
            }
            ProcSource::Stat => {
                let path = self.pid_path(pid).join("stat");
                let contents = read_file(&path)?;
                parse_stat(&contents).map_err(|reason| ProcError::Parse { path, reason })
            }
            ProcSource::Statm => {
                let path = self.pid_path(pid).join("statm");
                Ok(parse_statm(&read_file(&path)?))
            }
        }
    }

    /// Reads one source as a field name to value mapping.
    pub fn read_fields(
        &self,
        pid: i32,
        source: ProcSource,
    ) -> Result<FnvHashMap<&'static str, f64>, ProcError> {
        let values = self.read(pid, source)?;
        Ok(source
            .fields()
            .iter()
            .copied()
            .zip(values)
            .collect::<FnvHashMap<_, _>>())
    }

    /// Resident set size of the process tree rooted at `pid`, in KB.
    pub fn tree_rss_kb(&self, pid: i32) -> Result<f64, ProcError> {
        Ok(self.read_all(pid)?[0])
    }

    /// Sums rss and vsize over `pid` and all of its descendants, both in KB.
    fn read_all(&self, pid: i32) -> Result<Vec<f64>, ProcError> {
        let root_stat = self.pid_path(pid).join("stat");
        let root = parse_stat(&read_file(&root_stat)?).map_err(|reason| ProcError::Parse {
            path: root_stat,
            reason,
        })?;

        let mut parents: Vec<(i32, i32, f64, f64)> = Vec::new();
        for other in get_pid_list_from_path(&self.root) {
            if other == pid {
                continue;
            }
            // Processes may vanish while the tree is walked.
            let Ok(contents) = fs::read_to_string(self.pid_path(other).join("stat")) else {
                continue;
            };
            if let Ok(values) = parse_stat(&contents) {
                parents.push((
                    other,
                    values[STAT_PPID] as i32,
                    values[STAT_RSS],
                    values[STAT_VSIZE],
                ));
            }
        }

        let mut tree = vec![pid];
        let mut rss_pages = root[STAT_RSS];
        let mut vsize_bytes = root[STAT_VSIZE];
        let mut cursor = 0;
        while cursor < tree.len() {
            let parent = tree[cursor];
            for (child, ppid, rss, vsize) in &parents {
                if *ppid == parent && !tree.contains(child) {
                    tree.push(*child);
                    rss_pages += rss;
                    vsize_bytes += vsize;
                }
            }
            cursor += 1;
        }
        trace!("Process tree of {pid}: {tree:?}");

        Ok(vec![
            rss_pages * self.page_size as f64 / 1024.0,
            vsize_bytes / 1024.0,
        ])
    }
}

/// Enumerates all numeric directory names below `path`.
pub fn get_pid_list_from_path(path: &Path) -> Vec<i32> {
    let Ok(entries) = fs::read_dir(path) else {
        debug!("Could not list {}", path.display());
        return Vec::new();
    };

    entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            if entry.file_type().ok()?.is_dir() {
                entry.file_name().to_str()?.parse::<i32>().ok()
            } else {
                None
            }
        })
        .collect()
}

fn read_file(path: &Path) -> Result<String, ProcError> {
    fs::read_to_string(path).map_err(|source| ProcError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => {
            debug!("Could not query page size, defaulting to {DEFAULT_PAGE_SIZE}");
            DEFAULT_PAGE_SIZE
        }
    }
}

fn parse_number(field: &str) -> f64 {
    field.parse::<f64>().unwrap_or_default()
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and parentheses, so it is
/// delimited by the first `(` and the last `)`.
pub fn parse_stat(contents: &str) -> Result<Vec<f64>, String> {
    let open = contents
        .find('(')
        .ok_or_else(|| "missing command name".to_string())?;
    let close = contents
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| "unterminated command name".to_string())?;

    let mut values = Vec::with_capacity(STAT_FIELDS.len());
    values.push(parse_number(contents[..open].trim()));
    values.push(0.0);
    values.extend(
        contents[close + 1..]
            .split_whitespace()
            .take(STAT_FIELDS.len() - 2)
            .map(parse_number),
    );
    values.resize(STAT_FIELDS.len(), 0.0);
    Ok(values)
}

/// Parses `/proc/<pid>/io`, a list of `key: value` lines.
#[must_use]
pub fn parse_io(contents: &str) -> Vec<f64> {
    let mut values = vec![0.0; IO_FIELDS.len()];
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let field = format!("proc.io.{}", key.trim());
        if let Some(index) = IO_FIELDS.iter().position(|f| *f == field) {
            values[index] = parse_number(value.trim());
        }
    }
    values
}

/// Parses `/proc/<pid>/statm`, seven space separated page counts.
#[must_use]
pub fn parse_statm(contents: &str) -> Vec<f64> {
    let mut values: Vec<f64> = contents
        .split_whitespace()
        .take(STATM_FIELDS.len())
        .map(parse_number)
        .collect();
    values.resize(STATM_FIELDS.len(), 0.0);
    values
}
