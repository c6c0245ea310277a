//! Filter Engine (spec §4.2): rule set parsing, matching, and mtime-triggered
//! hot reload.
//!
//! Ground: the host/IP classification comments in the teacher's
//! `httproxy::start::handle_client` (CONNECT authority parsing), generalized
//! into a standalone matcher; the atomic snapshot-swap discipline follows
//! the `arc-swap` usage pattern used for hot config in this pack's
//! `agentgateway` sibling repo, since the teacher itself has no multi-reader
//! config concept.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;

/// One parsed line of a rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    ExactHost(String),
    SuffixWildcard(String),
    IpLiteral(IpAddr),
}

#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(suffix) = line.strip_prefix("*.") {
                rules.push(Rule::SuffixWildcard(suffix.to_ascii_lowercase()));
            } else if let Ok(ip) = line.parse::<IpAddr>() {
                rules.push(Rule::IpLiteral(ip));
            } else {
                rules.push(Rule::ExactHost(line.to_ascii_lowercase()));
            }
        }
        RuleSet { rules }
    }

    /// First-match-wins deny scan (spec §3 invariants, §4.2).
    pub fn is_blocked(&self, host: &str) -> bool {
        let host_lower = host.to_ascii_lowercase();
        let as_ip = host_lower.parse::<IpAddr>().ok();

        for rule in &self.rules {
            let hit = match rule {
                Rule::ExactHost(h) => as_ip.is_none() && *h == host_lower,
                Rule::SuffixWildcard(suffix) => {
                    as_ip.is_none() && matches_suffix(&host_lower, suffix)
                }
                Rule::IpLiteral(ip) => as_ip.is_some_and(|h| h == *ip),
            };
            if hit {
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rules.len()
    }
}

/// `*.D` matches any host whose DNS-label suffix is `.D`, and by convention
/// the bare host `D` itself (spec §3, §GLOSSARY).
fn matches_suffix(host: &str, suffix: &str) -> bool {
    if host == suffix {
        return true;
    }
    host.len() > suffix.len()
        && host.ends_with(suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

/// Read-mostly filter snapshot with lazy, mtime-triggered reload (spec
/// §4.2's reload policy and atomicity contract, fixed per spec §9's open
/// question).
pub struct FilterEngine {
    path: PathBuf,
    snapshot: ArcSwap<RuleSet>,
    last_mtime: AtomicU64,
    last_checked_ms: AtomicU64,
    reload_error_logged: AtomicBool,
    recheck_interval: Duration,
}

impl FilterEngine {
    /// Loads the rule file once at startup. A missing/unreadable file
    /// degrades to an empty rule set with a single `ERROR` log (spec §4.2
    /// failure mode); the caller is expected to log that via the returned
    /// `initial_load_error`.
    pub fn load(path: impl Into<PathBuf>) -> (Self, Option<std::io::Error>) {
        let path = path.into();
        let (rules, mtime, err) = match read_rule_file(&path) {
            Ok((text, mtime)) => (RuleSet::parse(&text), mtime, None),
            Err(e) => (RuleSet::default(), 0, Some(e)),
        };

        let engine = FilterEngine {
            path,
            snapshot: ArcSwap::from_pointee(rules),
            last_mtime: AtomicU64::new(mtime),
            last_checked_ms: AtomicU64::new(now_ms()),
            reload_error_logged: AtomicBool::new(err.is_some()),
            recheck_interval: Duration::from_secs(1),
        };
        (engine, err)
    }

    /// Decide allow/deny for `(host, port)`. Port is accepted for symmetry
    /// with spec §4.2's interface but rules never key on it (spec §3: rules
    /// match host/IP only).
    pub fn is_blocked(&self, host: &str, _port: u16) -> bool {
        self.maybe_reload();
        self.snapshot.load().is_blocked(host)
    }

    /// Stats the rule file on a coarse tick and swaps in a freshly parsed
    /// snapshot if its mtime advanced (spec §4.2). Readers that raced this
    /// call see either the fully-old or fully-new `Arc`, never a partial
    /// rule set (spec §8 property 5), because `ArcSwap::load` always
    /// returns one complete, immutable `Arc<RuleSet>`.
    fn maybe_reload(&self) {
        let now = now_ms();
        let last = self.last_checked_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.recheck_interval.as_millis() as u64 {
            return;
        }
        if self
            .last_checked_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        match read_rule_file(&self.path) {
            Ok((text, mtime)) => {
                if mtime != self.last_mtime.load(Ordering::Acquire) {
                    let fresh = RuleSet::parse(&text);
                    self.snapshot.store(std::sync::Arc::new(fresh));
                    self.last_mtime.store(mtime, Ordering::Release);
                    log::info!(
                        "reloaded filter rules from {} (mtime changed)",
                        self.path.display()
                    );
                }
                self.reload_error_logged.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                if !self.reload_error_logged.swap(true, Ordering::Relaxed) {
                    log::error!(
                        "rule file {} unreadable, falling back to empty (permissive) rule set: {e}",
                        self.path.display()
                    );
                }
                self.snapshot.store(std::sync::Arc::new(RuleSet::default()));
            }
        }
    }
}

fn read_rule_file(path: &Path) -> std::io::Result<(String, u64)> {
    let text = fs::read_to_string(path)?;
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    Ok((text, mtime))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
