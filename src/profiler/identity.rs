//! Context identity and lineage.
//!
//! Every monitoring context carries a 6-word identity built from the process
//! id, the thread id, a wall-clock stamp, and three PRNG words. The identity
//! keeps trace files from concurrent processes (and from forked children)
//! apart without any central coordination: it lands in the trace header's
//! genealogy record and, for template outputs, in the file name itself.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};

use crate::profiler::format::ID_WORDS;

/// Ordinal value marking a context with no recorded parent.
pub const NO_PARENT_ORDINAL: u32 = u32::MAX;

/// ANSI C linear congruential generator.
///
/// Used for the clock phase offset and the random identity words. It does
/// not need statistical quality, only cheap decorrelation between processes
/// started in the same second.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u32,
}

impl Lcg {
    /// Seed from the wall clock, millisecond resolution.
    pub fn seeded() -> Lcg {
        Lcg::from_seed(wall_clock_millis())
    }

    pub fn from_seed(seed: u32) -> Lcg {
        Lcg { state: seed }
    }

    pub fn next(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12_345)
            & 0x7fff_ffff;
        self.state
    }
}

fn wall_clock_millis() -> u32 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as u32)
            .wrapping_mul(1_000)
            .wrapping_add(d.subsec_millis()),
        Err(_) => 0,
    }
}

/// Wall-clock seconds since the epoch, truncated to 32 bits.
pub(crate) fn wall_clock_seconds() -> u32 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as u32,
        Err(_) => 0,
    }
}

pub(crate) fn current_pid() -> u32 {
    std::process::id()
}

pub(crate) fn current_tid() -> u32 {
    // SAFETY: gettid has no preconditions and cannot fail.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

/// 6-word context identity: pid, thread id, wall-clock seconds, and three
/// PRNG words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub [u32; ID_WORDS]);

impl ContextId {
    pub const ZERO: ContextId = ContextId([0; ID_WORDS]);

    /// Build a fresh identity for the given process and thread.
    pub fn generate(pid: u32, tid: u32, rng: &mut Lcg) -> ContextId {
        ContextId([
            pid,
            tid,
            wall_clock_seconds(),
            rng.next(),
            rng.next(),
            rng.next(),
        ])
    }

    pub fn words(&self) -> &[u32; ID_WORDS] {
        &self.0
    }

    /// All six words as 48 hex characters.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(ID_WORDS * 8);
        for word in &self.0 {
            out.push_str(&format!("{word:08x}"));
        }
        out
    }

    /// First four words as 32 hex characters, used in template file names.
    /// The trailing PRNG words are left out so the stamp stays a fixed,
    /// readable width while remaining unique per context in practice.
    pub fn file_stamp(&self) -> String {
        let mut out = String::with_capacity(32);
        for word in &self.0[..4] {
            out.push_str(&format!("{word:08x}"));
        }
        out
    }
}

impl Serialize for ContextId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// A dotted three-part version, as recorded in the trace header for both the
/// monitored runtime and this library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionTriple {
    pub const fn new(major: u32, minor: u32, patch: u32) -> VersionTriple {
        VersionTriple {
            major,
            minor,
            patch,
        }
    }

    /// This library's own version, from the build metadata.
    pub fn library() -> VersionTriple {
        VersionTriple {
            major: parse_env_version(env!("CARGO_PKG_VERSION_MAJOR")),
            minor: parse_env_version(env!("CARGO_PKG_VERSION_MINOR")),
            patch: parse_env_version(env!("CARGO_PKG_VERSION_PATCH")),
        }
    }
}

fn parse_env_version(component: &str) -> u32 {
    component.parse().unwrap_or(0)
}

impl std::fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity lineage carried in the trace header: which context wrote this
/// stream, which segment it is, and which context (and segment) it descends
/// from across `fork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Genealogy {
    pub id: ContextId,
    pub parent_id: ContextId,
    /// 1-based segment number within this context's output.
    pub ordinal: u32,
    /// Ordinal the parent context had when this one was created, or
    /// [`NO_PARENT_ORDINAL`] for a root context.
    pub parent_ordinal: u32,
}

impl Genealogy {
    /// Lineage for a context with no parent.
    pub fn root(id: ContextId, ordinal: u32) -> Genealogy {
        Genealogy {
            id,
            parent_id: ContextId::ZERO,
            ordinal,
            parent_ordinal: NO_PARENT_ORDINAL,
        }
    }
}

impl Default for Genealogy {
    fn default() -> Genealogy {
        Genealogy::root(ContextId::ZERO, 0)
    }
}
