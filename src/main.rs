use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use clap::Parser;
use md5::{Digest, Md5};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "Edit and/or translate capture files — select, split, de-duplicate, re-time, chop, snap, and fuzz packet records.")]
#[command(override_usage = "capedit [OPTIONS] <infile> <outfile> [<packet#>[-<packet#>]...]")]
struct Args {
    /// Input capture file
    infile: Option<PathBuf>,

    /// Output capture file ("-" writes the capture to standard output)
    outfile: Option<String>,

    /// Packet selections: a packet number or an inclusive A-B range.
    /// A range end of 0 means "to the end of the capture".
    #[arg(value_name = "packet#[-packet#]")]
    ranges: Vec<String>,

    /// Keep the selected packets; default is to delete them
    #[arg(short = 'r')]
    keep: bool,

    /// Only output packets whose timestamp is on or after the given time
    /// (format: YYYY-MM-DD HH:MM:SS, local time)
    #[arg(short = 'A', value_name = "start time")]
    starttime: Option<String>,

    /// Only output packets whose timestamp is before the given time
    #[arg(short = 'B', value_name = "stop time")]
    stoptime: Option<String>,

    /// Split the output into files of at most <packets per file> packets each
    #[arg(short = 'c', value_name = "packets per file")]
    split_packet_count: Option<u32>,

    /// Split the output into files covering at most <seconds per file> each
    #[arg(short = 'i', value_name = "seconds per file")]
    secs_per_block: Option<u32>,

    /// Chop <choplen> bytes from each packet; positive lengths chop at the
    /// beginning, negative at the end. An optional offset shifts the chopped
    /// region (positive from the start, negative from the end). May be given
    /// twice for one region at each end.
    #[arg(short = 'C', value_name = "[offset:]choplen", allow_hyphen_values = true)]
    chops: Vec<String>,

    /// Also adjust the reported frame length when chopping and/or snapping
    #[arg(short = 'L')]
    adjlen: bool,

    /// Truncate each packet to at most <snaplen> bytes of data
    #[arg(short = 's', value_name = "snaplen")]
    snaplen: Option<u32>,

    /// Shift the timestamp of each packet by <time adjustment> relative
    /// seconds (e.g. -0.5)
    #[arg(short = 't', value_name = "time adjustment", allow_hyphen_values = true)]
    time_adjustment: Option<String>,

    /// Rewrite out-of-order timestamps so output is strictly chronological;
    /// a negative value forces every delta to its absolute value
    #[arg(short = 'S', value_name = "strict adjustment", allow_hyphen_values = true)]
    strict_time_adjustment: Option<String>,

    /// Probability (0.0 to 1.0) that any particular packet byte is corrupted
    #[arg(short = 'E', value_name = "error probability")]
    error_probability: Option<f64>,

    /// With -E, leave this many bytes at the start of each packet untouched
    #[arg(short = 'o', value_name = "change offset", default_value_t = 0)]
    change_offset: u32,

    /// Ignore this many bytes at the start of the frame when hashing for
    /// duplicates; short frames are hashed whole
    #[arg(short = 'I', value_name = "bytes to ignore", default_value_t = 0)]
    ignored_bytes: u32,

    /// Remove duplicate packets (window of 5 packets)
    #[arg(short = 'd')]
    dup_detect: bool,

    /// Remove duplicate packets over a window of <dup window> packets;
    /// valid values are 0 to 1000000. A window of 0 with -v prints MD5
    /// hashes without removing anything.
    #[arg(short = 'D', value_name = "dup window")]
    dup_window: Option<u32>,

    /// Remove a packet when an identical packet occurred no more than
    /// <dup time window> seconds before it (e.g. 0.000001)
    #[arg(short = 'w', value_name = "dup time window", allow_hyphen_values = true)]
    dup_time_window: Option<String>,

    /// Add or replace the comment for the given frame number (repeatable)
    #[arg(short = 'a', value_name = "framenum:comment")]
    comments: Vec<String>,

    /// Output file type; an empty value lists the supported types
    #[arg(short = 'F', value_name = "capture type")]
    file_type: Option<String>,

    /// Output encapsulation type; default is the same as the input file.
    /// An empty value lists the supported types.
    #[arg(short = 'T', value_name = "encap type")]
    encap_type: Option<String>,

    /// Verbose output; with -d, -D or -w, per-packet lengths and MD5
    /// hashes are logged to stderr
    #[arg(short = 'v')]
    verbose: bool,

    /// Remove the VLAN tag from Linux cooked-capture packets before
    /// checking for duplicates
    #[arg(long = "novlan")]
    novlan: bool,

    /// Skip the radiotap header when hashing for duplicates; useful for
    /// captures taken by several radios on the same channel
    #[arg(long = "skip-radiotap-header")]
    skip_radiotap: bool,

    /// Seed for the -E pseudo-random stream, to repeat an error sequence
    #[arg(long = "seed", value_name = "seed")]
    seed: Option<u64>,

    /// Print the run statistics as JSON on stdout
    #[arg(long = "report")]
    report: bool,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Failure classes, each tied to the process exit code it produces.
#[derive(Debug, Error)]
enum EditError {
    /// Invalid flag value or conflicting options.
    #[error("{0}")]
    Config(String),

    /// The input capture could not be opened or read.
    #[error("{0}")]
    Read(String),

    /// An output capture could not be opened, written, or closed.
    #[error("{0}")]
    Write(String),
}

impl EditError {
    fn exit_code(&self) -> i32 {
        match self {
            EditError::Config(_) => 1,
            EditError::Read(_) | EditError::Write(_) => 2,
        }
    }
}

fn config_err<T>(msg: impl Into<String>) -> Result<T, EditError> {
    Err(EditError::Config(msg.into()))
}

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct EditStats {
    records_read:          u64,
    records_written:       u64,
    records_out_of_window: u64,
    records_deselected:    u64,
    duplicates_dropped:    u64,
    timestamps_rewritten:  u64,
    records_snapped:       u64,
    records_chopped:       u64,
    vlan_tags_removed:     u64,
    records_fuzzed:        u64,
    comments_attached:     u64,
    files_written:         u64,
}

// ─── Time values ──────────────────────────────────────────────────────────────

const ONE_BILLION: i64 = 1_000_000_000;

/// A capture timestamp or a time delta, split into whole seconds and
/// nanoseconds. Normalized values keep |nsecs| < 10⁹ with both fields
/// carrying the same sign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct TimeSpec {
    secs:  i64,
    nsecs: i64,
}

impl TimeSpec {
    fn new(secs: i64, nsecs: i64) -> Self {
        TimeSpec { secs, nsecs }
    }

    /// Signed difference `self - earlier`, normalized so that a backward
    /// step yields a negative secs and/or nsecs field.
    fn delta(self, earlier: TimeSpec) -> TimeSpec {
        let mut secs = self.secs - earlier.secs;
        let mut nsecs = self.nsecs - earlier.nsecs;
        if nsecs < 0 && secs > 0 {
            secs -= 1;
            nsecs += ONE_BILLION;
        } else if nsecs > 0 && secs < 0 {
            secs += 1;
            nsecs -= ONE_BILLION;
        }
        TimeSpec { secs, nsecs }
    }

    fn is_backward(self) -> bool {
        self.secs < 0 || self.nsecs < 0
    }
}

/// A user-supplied time amount: a non-negative magnitude plus a separate
/// sign flag. The consuming stage decides what the sign means.
#[derive(Debug, Clone, Copy, Default)]
struct TimeAdjustment {
    tv:          TimeSpec,
    is_negative: bool,
}

/// `previous + adjustment` with nanosecond carry.
fn advance_time(previous: TimeSpec, adjustment: TimeSpec) -> TimeSpec {
    let mut secs = previous.secs + adjustment.secs;
    let mut nsecs = previous.nsecs + adjustment.nsecs;
    if nsecs >= ONE_BILLION {
        secs += 1;
        nsecs -= ONE_BILLION;
    }
    TimeSpec { secs, nsecs }
}

/// Shift a timestamp by a signed adjustment, borrowing or carrying
/// between the seconds and nanoseconds fields.
fn shift_time(ts: TimeSpec, adj: &TimeAdjustment) -> TimeSpec {
    let mut out = ts;
    if adj.is_negative {
        out.secs -= adj.tv.secs;
        if out.nsecs < adj.tv.nsecs {
            out.secs -= 1;
            out.nsecs += ONE_BILLION;
        }
        out.nsecs -= adj.tv.nsecs;
    } else {
        out.secs += adj.tv.secs;
        out.nsecs += adj.tv.nsecs;
        if out.nsecs >= ONE_BILLION {
            out.secs += 1;
            out.nsecs -= ONE_BILLION;
        }
    }
    out
}

// ─── Time-spec parser ─────────────────────────────────────────────────────────
//
// Grammar: [space|tab]* [-] [digits] [. digits]
//
// The fractional part is left-aligned ("1.5" is one second and a half);
// more than nine fractional digits are truncated, not rounded. A bare "-"
// is invalid, ".5" is fine. The sign is kept apart from the magnitude.

fn parse_time_spec(input: &str, what: &str) -> Result<TimeAdjustment, EditError> {
    let bad = || EditError::Config(format!("\"{input}\" isn't a valid {what}"));

    let mut s = input.trim_start_matches(&[' ', '\t'][..]);
    let mut adj = TimeAdjustment::default();

    if let Some(rest) = s.strip_prefix('-') {
        adj.is_negative = true;
        s = rest;
    }

    let int_digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    s = &s[int_digits.len()..];

    if int_digits.is_empty() {
        // Only ".frac" is allowed to omit the seconds.
        if !s.starts_with('.') {
            return Err(bad());
        }
        adj.tv.secs = 0;
    } else {
        adj.tv.secs = int_digits.parse::<i64>().map_err(|_| bad())?;
    }

    if !s.is_empty() && !s.starts_with('.') {
        return Err(bad());
    }

    if let Some(rest) = s.strip_prefix('.') {
        let frac_digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        // Truncate to nanosecond resolution.
        let kept = &frac_digits[..frac_digits.len().min(9)];
        let mut nsecs: i64 = if kept.is_empty() { 0 } else { kept.parse().map_err(|_| bad())? };
        for _ in kept.len()..9 {
            nsecs *= 10;
        }
        adj.tv.nsecs = nsecs;
    }

    Ok(adj)
}

// ─── Wall-clock parsing and formatting ────────────────────────────────────────

/// Parse a "YYYY-MM-DD HH:MM:SS" local-time string into epoch seconds.
fn parse_wall_clock(input: &str, what: &str) -> Result<i64, EditError> {
    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| EditError::Config(format!("\"{input}\" isn't a valid {what}")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| EditError::Config(format!("\"{input}\" isn't a valid {what}")))
}

/// Default stop time when only a start time is given.
fn default_stop_time() -> i64 {
    let naive = NaiveDate::from_ymd_opt(2035, 12, 31)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("fixed date");
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or(i64::MAX)
}

/// Second-resolution local timestamp used in split file names.
fn split_time_string(ts: TimeSpec) -> String {
    Local
        .timestamp_opt(ts.secs, 0)
        .single()
        .map(|dt| dt.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_default()
}

// ─── Packet selection ─────────────────────────────────────────────────────────

const MAX_SELECTIONS: usize = 512;

#[derive(Debug, Clone, Copy)]
struct SelectItem {
    inclusive: bool,
    first:     u32,
    second:    u32,
}

/// The 1-based record numbers named on the command line, as singletons
/// and inclusive ranges. A range end of 0 means "to the end".
#[derive(Debug, Default)]
struct SelectionSet {
    items:         Vec<SelectItem>,
    max_selection: u32,
}

impl SelectionSet {
    /// Parse one `N` or `A-B` argument. Returns false once the table is
    /// full; the caller stops adding but keeps running.
    fn add(&mut self, sel: &str) -> Result<bool, EditError> {
        if self.items.len() >= MAX_SELECTIONS {
            warn!("out of room for packet selections");
            return Ok(false);
        }

        debug!("add selection: {sel}");

        let parse = |digits: &str, what: &str| -> Result<u32, EditError> {
            digits
                .parse::<u32>()
                .map_err(|_| EditError::Config(format!("\"{digits}\" isn't a valid {what}")))
        };

        match sel.split_once('-') {
            None => {
                let first = parse(sel, "packet number")?;
                self.items.push(SelectItem { inclusive: false, first, second: 0 });
                if first > self.max_selection {
                    self.max_selection = first;
                }
            }
            Some((a, b)) => {
                let first = parse(a, "beginning of packet range")?;
                let mut second = parse(b, "end of packet range")?;
                if second == 0 {
                    // An open-ended range selects everything from `first` on.
                    second = u32::MAX;
                    self.max_selection = u32::MAX;
                } else if second > self.max_selection {
                    self.max_selection = second;
                }
                self.items.push(SelectItem { inclusive: true, first, second });
            }
        }
        Ok(true)
    }

    fn selected(&self, recno: u32) -> bool {
        self.items.iter().any(|item| {
            if item.inclusive {
                item.first <= recno && item.second >= recno
            } else {
                item.first == recno
            }
        })
    }
}

// ─── Chopping engine ──────────────────────────────────────────────────────────
//
// Up to two chopping regions per packet: one anchored at the packet
// beginning (positive chop length) and one at the end (negative chop
// length). Offsets shift a region inward from its anchor; a negative
// begin offset or positive end offset counts from the opposite end and
// is folded into canonical form before anything is removed.

#[derive(Debug, Clone, Copy, Default)]
struct ChopSpec {
    len_begin:     i64,
    off_begin_pos: i64,
    off_begin_neg: i64,
    len_end:       i64,
    off_end_pos:   i64,
    off_end_neg:   i64,
}

impl ChopSpec {
    /// Accumulate one `-C [offset:]choplen` argument.
    fn add(&mut self, arg: &str) -> Result<(), EditError> {
        let bad =
            || EditError::Config(format!("\"{arg}\" isn't a valid chop length or offset:length"));

        let (chopoff, choplen): (i64, i64) = match arg.split_once(':') {
            Some((off, len)) => (off.parse().map_err(|_| bad())?, len.parse().map_err(|_| bad())?),
            None => (0, arg.parse().map_err(|_| bad())?),
        };

        if choplen > 0 {
            self.len_begin += choplen;
            if chopoff > 0 {
                self.off_begin_pos += chopoff;
            } else {
                self.off_begin_neg += chopoff;
            }
        } else if choplen < 0 {
            self.len_end += choplen;
            if chopoff > 0 {
                self.off_end_pos += chopoff;
            } else {
                self.off_end_neg += chopoff;
            }
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.len_begin != 0 || self.len_end != 0
    }
}

/// Remove the configured regions from `payload`, returning the new
/// (caplen, reported len) pair. `payload.len()` equals `caplen` on entry
/// and the returned caplen on exit.
fn handle_chopping(
    spec: ChopSpec,
    caplen: u32,
    len: u32,
    payload: &mut Vec<u8>,
    adjlen: bool,
) -> (u32, u32) {
    let mut chop = spec;
    let cap = caplen as i64;

    // An offset without a chop length on its side is meaningless.
    if chop.len_begin == 0 {
        chop.off_begin_pos = 0;
        chop.off_begin_neg = 0;
    }
    if chop.len_end == 0 {
        chop.off_end_pos = 0;
        chop.off_end_neg = 0;
    }

    // Fold offsets measured from the far end into canonical anchors.
    if chop.off_begin_neg < 0 {
        chop.off_begin_pos += cap + chop.off_begin_neg;
        chop.off_begin_neg = 0;
    }
    if chop.off_end_pos > 0 {
        chop.off_end_neg += chop.off_end_pos - cap;
        chop.off_end_pos = 0;
    }

    // If the begin region starts beyond the end region, mirror the two.
    if chop.len_begin != 0 && chop.len_end != 0 && chop.off_begin_pos > cap + chop.off_end_neg {
        let tmp_off = cap + chop.off_end_neg + chop.len_end;
        let tmp_len = -chop.len_end;

        chop.off_end_neg = chop.len_begin + chop.off_begin_pos - cap;
        chop.len_end = -chop.len_begin;

        chop.len_begin = tmp_len;
        chop.off_begin_pos = tmp_off;
    }

    // Never chop more than the packet holds.
    let off_span = chop.off_begin_pos - chop.off_end_neg;
    if off_span < 0 || cap < off_span {
        chop.len_begin = 0;
        chop.len_end = 0;
    }
    if chop.len_begin - chop.len_end > cap - (chop.off_begin_pos - chop.off_end_neg) {
        chop.len_begin = cap - (chop.off_begin_pos - chop.off_end_neg);
        chop.len_end = 0;
    }

    let mut out_caplen = caplen;
    let mut out_len = len;

    // Chop at the beginning; an offset means the leading piece survives.
    if chop.len_begin > 0 {
        let lb = chop.len_begin as usize;
        if chop.off_begin_pos > 0 {
            let off = chop.off_begin_pos as usize;
            payload.copy_within(off + lb.., off);
            payload.truncate(payload.len() - lb);
        } else {
            payload.drain(..lb);
        }
        out_caplen -= lb as u32;
        if adjlen {
            out_len = if (out_len as i64) > chop.len_begin {
                (out_len as i64 - chop.len_begin) as u32
            } else {
                0
            };
        }
    }

    // Chop at the end; an offset means the trailing piece survives.
    if chop.len_end < 0 {
        let cut = (-chop.len_end) as usize;
        if chop.off_end_neg < 0 {
            let tail = (-chop.off_end_neg) as usize;
            let end = payload.len();
            payload.copy_within(end - tail..end, end - tail - cut);
        }
        payload.truncate(payload.len() - cut);
        out_caplen -= cut as u32;
        if adjlen {
            out_len = if out_len as i64 + chop.len_end > 0 {
                (out_len as i64 + chop.len_end) as u32
            } else {
                0
            };
        }
    }

    (out_caplen, out_len)
}

// ─── Duplicate detection ──────────────────────────────────────────────────────
//
// Content-addressable cache of the most recent frames. Every frame is
// hashed and inserted; lookups either sweep a fixed-count window or walk
// backwards through a time-bounded one. The slot array is allocated at
// its maximum size once and never shrunk, whatever the active window.

const DEFAULT_DUP_DEPTH: usize = 5;
const MAX_DUP_DEPTH: usize = 1_000_000;

#[derive(Debug, Clone, Copy)]
struct DedupSlot {
    digest: [u8; 16],
    len:    u32,
    ts:     Option<TimeSpec>,
}

struct DedupCache {
    slots:         Vec<DedupSlot>,
    cursor:        usize,
    window:        usize,
    ignored_bytes: u32,
    skip_radiotap: bool,
}

impl DedupCache {
    fn new(window: usize, ignored_bytes: u32, skip_radiotap: bool) -> Self {
        let empty = DedupSlot { digest: [0; 16], len: 0, ts: None };
        DedupCache {
            slots: vec![empty; MAX_DUP_DEPTH],
            cursor: 0,
            window,
            ignored_bytes,
            skip_radiotap,
        }
    }

    /// Where digesting starts within the frame. Ignored-prefix and
    /// radiotap skipping both fall back to 0 when the frame is too short.
    fn digest_offset(&self, payload: &[u8]) -> usize {
        let len = payload.len();
        let mut offset = self.ignored_bytes as usize;
        if len <= offset {
            offset = 0;
        }
        if self.skip_radiotap {
            // Radiotap carries its own length little-endian at byte 2.
            offset = if len >= 4 {
                u16::from_le_bytes([payload[2], payload[3]]) as usize
            } else {
                0
            };
            if offset >= len {
                offset = 0;
            }
        }
        offset
    }

    /// Advance the cursor and fill its slot with this frame's digest.
    fn insert(&mut self, payload: &[u8], ts: Option<TimeSpec>) {
        let offset = self.digest_offset(payload);
        self.cursor += 1;
        if self.cursor >= self.window {
            self.cursor = 0;
        }
        let slot = &mut self.slots[self.cursor];
        slot.digest = Md5::digest(&payload[offset..]).into();
        slot.len = payload.len() as u32;
        slot.ts = ts;
    }

    /// Fixed-count window: insert, then sweep every other live slot.
    /// A window of 0 inserts without comparing.
    fn is_duplicate(&mut self, payload: &[u8]) -> bool {
        self.insert(payload, None);
        let current = self.slots[self.cursor];
        for i in 0..self.window {
            if i == self.cursor {
                continue;
            }
            let slot = &self.slots[i];
            if slot.len == current.len && slot.digest == current.digest {
                return true;
            }
        }
        false
    }

    /// Time-bounded window: insert, then walk backwards from the newest
    /// entry. The walk ends on a full lap, on an unused slot, or once the
    /// entries are older than the window; out-of-order entries are
    /// skipped rather than ending the walk.
    fn is_duplicate_rel_time(&mut self, payload: &[u8], current_ts: TimeSpec, window: TimeSpec) -> bool {
        self.insert(payload, Some(current_ts));
        let current = self.slots[self.cursor];

        let mut i = self.cursor as i64 - 1;
        loop {
            if i < 0 {
                i = self.window as i64 - 1;
            }
            if i as usize == self.cursor {
                break;
            }

            let slot = &self.slots[i as usize];
            let Some(slot_ts) = slot.ts else {
                break;
            };

            let delta = current_ts.delta(slot_ts);
            if delta.is_backward() {
                i -= 1;
                continue;
            }
            if delta > window {
                break;
            }
            if slot.len == current.len && slot.digest == current.digest {
                return true;
            }
            i -= 1;
        }
        false
    }

    /// The just-inserted frame's slot, for verbose digest logging.
    fn cursor_slot(&self) -> &DedupSlot {
        &self.slots[self.cursor]
    }
}

fn digest_hex(digest: &[u8; 16]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ─── Strict chronological adjustment ──────────────────────────────────────────

/// Rewrites timestamps so the output never steps backwards. The first
/// record always passes through untouched and seeds the comparison; a
/// non-negative adjustment only rewrites out-of-order records, while a
/// negative one forces every subsequent delta to the adjustment's
/// magnitude.
struct StrictTimeAdjuster {
    adjustment: TimeAdjustment,
    previous:   Option<TimeSpec>,
}

impl StrictTimeAdjuster {
    fn new(adjustment: TimeAdjustment) -> Self {
        StrictTimeAdjuster { adjustment, previous: None }
    }

    fn adjust(&mut self, ts: TimeSpec) -> TimeSpec {
        let out = match self.previous {
            None => ts,
            Some(prev) => {
                if self.adjustment.is_negative {
                    advance_time(prev, self.adjustment.tv)
                } else if ts.delta(prev).is_backward() {
                    advance_time(prev, self.adjustment.tv)
                } else {
                    ts
                }
            }
        };
        self.previous = Some(out);
        out
    }
}

// ─── Fuzzer ───────────────────────────────────────────────────────────────────
//
// Weighted random corruption with a reproducible stream. Each byte past
// the protected prefix is independently corrupted with probability p;
// the corruption class is drawn from a fixed inverse-CDF table.

const ERR_WT_BIT: u32 = 5;
const ERR_WT_BYTE: u32 = 5;
const ERR_WT_ALNUM: u32 = 5;
const ERR_WT_FMT: u32 = 2;
const ERR_WT_AA: u32 = 1;
const ERR_WT_TOTAL: u32 = ERR_WT_BIT + ERR_WT_BYTE + ERR_WT_ALNUM + ERR_WT_FMT + ERR_WT_AA;

const ALNUM_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    FlipBit,
    RandomByte,
    RandomAlnum,
    FormatString,
    FillAa,
}

/// Cumulative weight table; a uniform draw below an entry's bound picks
/// that class.
const ERROR_CDF: [(u32, ErrorClass); 5] = [
    (ERR_WT_BIT, ErrorClass::FlipBit),
    (ERR_WT_BIT + ERR_WT_BYTE, ErrorClass::RandomByte),
    (ERR_WT_BIT + ERR_WT_BYTE + ERR_WT_ALNUM, ErrorClass::RandomAlnum),
    (ERR_WT_TOTAL - ERR_WT_AA, ErrorClass::FormatString),
    (ERR_WT_TOTAL, ErrorClass::FillAa),
];

fn pick_error_class(roll: u32) -> ErrorClass {
    ERROR_CDF
        .iter()
        .find(|(bound, _)| roll < *bound)
        .map(|(_, class)| *class)
        .expect("roll below total weight")
}

struct Fuzzer {
    probability: f64,
    rng:         StdRng,
}

impl Fuzzer {
    fn new(probability: f64, seed: u64) -> Self {
        Fuzzer { probability, rng: StdRng::seed_from_u64(seed) }
    }

    /// Corrupt `payload[start..]` in place. Returns true if any byte was
    /// selected for corruption.
    fn mutate(&mut self, payload: &mut [u8], start: usize) -> bool {
        let caplen = payload.len();
        let mut touched = false;
        let mut i = start;
        while i < caplen {
            if self.rng.gen::<f64>() < self.probability {
                touched = true;
                match pick_error_class(self.rng.gen_range(0..ERR_WT_TOTAL)) {
                    ErrorClass::FlipBit => {
                        payload[i] ^= 1 << self.rng.gen_range(0..8);
                    }
                    ErrorClass::RandomByte => {
                        payload[i] = self.rng.gen();
                    }
                    ErrorClass::RandomAlnum => {
                        payload[i] = ALNUM_CHARS[self.rng.gen_range(0..ALNUM_CHARS.len())];
                    }
                    ErrorClass::FormatString => {
                        if i + 2 <= caplen {
                            payload[i] = b'%';
                            payload[i + 1] = b's';
                        }
                    }
                    ErrorClass::FillAa => {
                        for b in &mut payload[i..] {
                            *b = 0xAA;
                        }
                        break;
                    }
                }
            }
            i += 1;
        }
        touched
    }
}

fn derive_seed() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now ^ u64::from(process::id())
}

// ─── Format-specific helpers ──────────────────────────────────────────────────

/// Offset of the real protocol data in a Catapult DCT2000 record: six
/// NUL-terminated text fields followed by the direction and encap bytes.
fn dct2000_real_data_start(payload: &[u8]) -> usize {
    let mut n = 0;
    for _ in 0..6 {
        while n < payload.len() && payload[n] != 0 {
            n += 1;
        }
        n += 1;
    }
    n + 2
}

const LINKTYPE_LINUX_SLL: i32 = 113;
const LINKTYPE_IEEE802_11_RADIOTAP: i32 = 127;

const SLL_PROTOCOL_OFFSET: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// Drop the 802.1Q tag from a Linux cooked-capture frame, if present.
/// Returns true when four bytes were removed.
fn sll_remove_vlan_tag(payload: &mut Vec<u8>) -> bool {
    if payload.len() < SLL_PROTOCOL_OFFSET + VLAN_TAG_LEN {
        return false;
    }
    let proto = u16::from_be_bytes([payload[SLL_PROTOCOL_OFFSET], payload[SLL_PROTOCOL_OFFSET + 1]]);
    if proto != ETHERTYPE_VLAN {
        return false;
    }
    payload.drain(SLL_PROTOCOL_OFFSET..SLL_PROTOCOL_OFFSET + VLAN_TAG_LEN);
    true
}

// ─── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Packet,
    FtSpecificEvent,
    FtSpecificReport,
    Syscall,
    Other,
}

/// One record pulled from the source. `payload` always holds exactly
/// `caplen` bytes; `len` is the length the record claims on the wire.
#[derive(Debug, Clone)]
struct Record {
    kind:            RecordKind,
    has_timestamp:   bool,
    ts:              TimeSpec,
    caplen:          u32,
    len:             u32,
    encap:           i32,
    payload:         Vec<u8>,
    comment:         Option<String>,
    comment_changed: bool,
}

// ─── Output splitting ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitMode {
    None,
    ByCount(u32),
    ByInterval(u32),
}

const SPLIT_MAX_FILES: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilenameTemplate {
    prefix: String,
    suffix: String,
}

/// Split an output name at the last "." of its final path component; the
/// changing part of split file names goes before the suffix.
fn extract_prefix_suffix(name: &str) -> FilenameTemplate {
    let last_sep = name.rfind(MAIN_SEPARATOR);
    match name.rfind('.') {
        Some(dot) if last_sep.map_or(true, |sep| dot > sep) => FilenameTemplate {
            prefix: name[..dot].to_string(),
            suffix: name[dot..].to_string(),
        },
        _ => FilenameTemplate { prefix: name.to_string(), suffix: String::new() },
    }
}

fn split_filename(template: &FilenameTemplate, index: u32, ts: Option<TimeSpec>) -> String {
    match ts {
        Some(ts) => format!(
            "{}_{:05}_{}{}",
            template.prefix,
            index % SPLIT_MAX_FILES,
            split_time_string(ts),
            template.suffix
        ),
        None => format!("{}_{:05}{}", template.prefix, index % SPLIT_MAX_FILES, template.suffix),
    }
}

// ─── Capture file types and encapsulations ────────────────────────────────────

const FILE_TYPES: &[(&str, &str)] = &[("pcap", "Wireshark/tcpdump/... - pcap")];

const ENCAP_TYPES: &[(&str, &str, i32)] = &[
    ("ether", "Ethernet", 1),
    ("null", "NULL/Loopback", 0),
    ("ppp", "PPP", 9),
    ("fddi", "FDDI", 10),
    ("rawip", "Raw IP", 101),
    ("ieee-802_11", "IEEE 802.11 Wireless LAN", 105),
    ("frelay", "Frame Relay", 107),
    ("linux-sll", "Linux cooked-mode capture v1", LINKTYPE_LINUX_SLL),
    ("ltalk", "Localtalk", 114),
    ("ieee-802_11-radiotap", "IEEE 802.11 plus radiotap radio header", LINKTYPE_IEEE802_11_RADIOTAP),
    ("bluetooth-h4", "Bluetooth H4 with phdr", 187),
    ("usb-linux", "USB packets with Linux header", 189),
    ("sctp", "SCTP", 248),
];

fn list_capture_types() {
    println!("capedit: The available capture file types for the \"-F\" flag are:");
    let mut types: Vec<_> = FILE_TYPES.to_vec();
    types.sort_by_key(|(short, _)| *short);
    for (short, long) in types {
        println!("    {short} - {long}");
    }
}

fn list_encap_types() {
    println!("capedit: The available encapsulation types for the \"-T\" flag are:");
    let mut encaps: Vec<_> = ENCAP_TYPES.to_vec();
    encaps.sort_by_key(|(short, _, _)| *short);
    for (short, long, _) in encaps {
        println!("    {short} - {long}");
    }
}

fn encap_from_short_name(name: &str) -> Option<i32> {
    ENCAP_TYPES
        .iter()
        .find(|(short, _, _)| *short == name)
        .map(|(_, _, linktype)| *linktype)
}

// ─── Capture input ────────────────────────────────────────────────────────────

struct CaptureSource {
    reader:     LegacyPcapReader<BufReader<File>>,
    linktype:   i32,
    snaplen:    u32,
    nanosecond: bool,
    /// Always false for legacy pcap input; gates the DCT2000 payload
    /// locator in the fuzz stage.
    dct2000:    bool,
}

impl CaptureSource {
    fn open(path: &Path) -> Result<CaptureSource> {
        let file =
            File::open(path).with_context(|| format!("can't open {}", path.display()))?;
        let reader = LegacyPcapReader::new(65536, BufReader::new(file))
            .map_err(|e| anyhow!("{} isn't a valid legacy pcap capture ({e:?})", path.display()))?;
        let mut source = CaptureSource {
            reader,
            linktype: 1,
            snaplen: 0,
            nanosecond: false,
            dct2000: false,
        };
        source.read_file_header()?;
        Ok(source)
    }

    /// Consume the capture file header so the link type and snapshot
    /// length are known before the first record is pulled.
    fn read_file_header(&mut self) -> Result<()> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    if let PcapBlockOwned::LegacyHeader(ref hdr) = block {
                        self.linktype = hdr.network.0;
                        self.snaplen = hdr.snaplen;
                        self.nanosecond = hdr.magic_number == 0xa1b23c4d;
                    }
                    drop(block);
                    self.reader.consume(offset);
                    return Ok(());
                }
                Err(PcapError::Incomplete) => {
                    self.reader
                        .refill()
                        .map_err(|e| anyhow!("capture file header is truncated ({e:?})"))?;
                }
                Err(PcapError::Eof) => return Err(anyhow!("capture file is empty")),
                Err(e) => return Err(anyhow!("capture read error: {e:?}")),
            }
        }
    }

    /// Pull the next packet record, or None at end of file.
    fn next_record(&mut self) -> Result<Option<Record>> {
        let mut stalled = false;
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    stalled = false;
                    let record = match block {
                        PcapBlockOwned::Legacy(ref pkt) => {
                            let factor = if self.nanosecond { 1 } else { 1000 };
                            let caplen = (pkt.caplen as usize).min(pkt.data.len());
                            Some(Record {
                                kind: RecordKind::Packet,
                                has_timestamp: true,
                                ts: TimeSpec::new(
                                    i64::from(pkt.ts_sec),
                                    i64::from(pkt.ts_usec) * factor,
                                ),
                                caplen: caplen as u32,
                                len: pkt.origlen,
                                encap: self.linktype,
                                payload: pkt.data[..caplen].to_vec(),
                                comment: None,
                                comment_changed: false,
                            })
                        }
                        PcapBlockOwned::LegacyHeader(_) => None,
                        PcapBlockOwned::NG(_) => {
                            warn!("pcapng block encountered - only legacy pcap is supported");
                            None
                        }
                    };
                    drop(block);
                    self.reader.consume(offset);
                    if let Some(record) = record {
                        return Ok(Some(record));
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete) => {
                    if stalled {
                        return Err(anyhow!("truncated record at end of capture"));
                    }
                    stalled = true;
                    self.reader.refill().map_err(|e| anyhow!("refill error: {e:?}"))?;
                }
                Err(e) => return Err(anyhow!("capture read error: {e:?}")),
            }
        }
    }
}

// ─── Capture output ───────────────────────────────────────────────────────────

struct CaptureSink {
    writer: BufWriter<Box<dyn Write>>,
    path:   String,
}

impl CaptureSink {
    /// Open an output capture and write its file header; "-" writes to
    /// standard output.
    fn open(path: &str, linktype: i32, snaplen: u32) -> Result<CaptureSink> {
        let out: Box<dyn Write> = if path == "-" {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(path).with_context(|| format!("can't create {path}"))?)
        };
        let mut sink = CaptureSink { writer: BufWriter::new(out), path: path.to_string() };
        sink.write_global_header(linktype, snaplen)
            .with_context(|| format!("can't write the file header of {path}"))?;
        Ok(sink)
    }

    fn write_global_header(&mut self, linktype: i32, snaplen: u32) -> Result<()> {
        let w = &mut self.writer;
        w.write_all(&0xa1b2c3d4u32.to_le_bytes())?;
        w.write_all(&2u16.to_le_bytes())?;
        w.write_all(&4u16.to_le_bytes())?;
        w.write_all(&0i32.to_le_bytes())?;
        w.write_all(&0u32.to_le_bytes())?;
        w.write_all(&snaplen.to_le_bytes())?;
        w.write_all(&(linktype as u32).to_le_bytes())?;
        Ok(())
    }

    fn write_record(&mut self, record: &Record) -> Result<()> {
        if record.comment_changed {
            if let Some(comment) = &record.comment {
                // The legacy pcap container has no comment field.
                debug!("pcap output drops the comment {comment:?}");
            }
        }
        let w = &mut self.writer;
        w.write_all(&(record.ts.secs as u32).to_le_bytes())?;
        w.write_all(&((record.ts.nsecs / 1000) as u32).to_le_bytes())?;
        w.write_all(&record.caplen.to_le_bytes())?;
        w.write_all(&record.len.to_le_bytes())?;
        w.write_all(&record.payload[..record.caplen as usize])?;
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        self.writer.flush().with_context(|| format!("error closing {}", self.path))
    }
}

// ─── Pipeline configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum DedupMode {
    Off,
    ByCount(usize),
    ByTime(TimeSpec),
}

#[derive(Debug, Clone, Copy)]
struct FuzzConfig {
    probability: f64,
    seed:        u64,
}

/// Everything the pipeline needs, built once from the parsed command
/// line and threaded through the stages by reference.
struct PipelineConfig {
    selection:             SelectionSet,
    keep:                  bool,
    time_window:           Option<(i64, i64)>,
    split:                 SplitMode,
    strict_adjustment:     Option<TimeAdjustment>,
    time_shift_adjustment: Option<TimeAdjustment>,
    snaplen:               Option<u32>,
    chop:                  ChopSpec,
    adjlen:                bool,
    novlan:                bool,
    dedup:                 DedupMode,
    ignored_bytes:         u32,
    skip_radiotap:         bool,
    fuzz:                  Option<FuzzConfig>,
    change_offset:         u32,
    comments:              BTreeMap<u32, String>,
    out_encap:             Option<i32>,
    report:                bool,
}

fn build_config(args: &Args) -> Result<PipelineConfig, EditError> {
    let mut selection = SelectionSet::default();
    for range in &args.ranges {
        if !selection.add(range)? {
            break;
        }
    }

    let mut chop = ChopSpec::default();
    for arg in &args.chops {
        chop.add(arg)?;
    }

    let time_window = match (&args.starttime, &args.stoptime) {
        (None, None) => None,
        (start, stop) => {
            let start_secs = start
                .as_deref()
                .map(|s| parse_wall_clock(s, "time format"))
                .transpose()?
                .unwrap_or(0);
            let stop_secs = stop
                .as_deref()
                .map(|s| parse_wall_clock(s, "time format"))
                .transpose()?
                .unwrap_or_else(default_stop_time);
            if start_secs > stop_secs {
                return config_err("start time is after the stop time");
            }
            Some((start_secs, stop_secs))
        }
    };

    let split = match (args.split_packet_count, args.secs_per_block) {
        (Some(_), Some(_)) => {
            return config_err("can't split on both packet count and time interval at the same time")
        }
        (Some(0), None) | (None, Some(0)) => {
            return config_err("the packets-per-file and seconds-per-file values must be greater than zero")
        }
        (Some(count), None) => SplitMode::ByCount(count),
        (None, Some(secs)) => SplitMode::ByInterval(secs),
        (None, None) => SplitMode::None,
    };

    let strict_adjustment = args
        .strict_time_adjustment
        .as_deref()
        .map(|s| parse_time_spec(s, "time adjustment"))
        .transpose()?;
    let time_shift_adjustment = args
        .time_adjustment
        .as_deref()
        .map(|s| parse_time_spec(s, "time adjustment"))
        .transpose()?;

    let count_mode = args.dup_detect || args.dup_window.is_some();
    let dedup = match (&args.dup_time_window, count_mode) {
        (Some(_), true) => {
            return config_err("can't combine -d or -D with a -w duplicate time window")
        }
        (Some(spec), false) => {
            // The sign of a relative window is ignored.
            DedupMode::ByTime(parse_time_spec(spec, "rel time value")?.tv)
        }
        (None, true) => {
            let window = args.dup_window.unwrap_or(DEFAULT_DUP_DEPTH as u32);
            if window as usize > MAX_DUP_DEPTH {
                return config_err(format!(
                    "\"{window}\" duplicate window value must be between 0 and {MAX_DUP_DEPTH} inclusive"
                ));
            }
            DedupMode::ByCount(window as usize)
        }
        (None, false) => DedupMode::Off,
    };

    if args.ignored_bytes != 0 && args.skip_radiotap {
        return config_err(format!(
            "can't skip radiotap headers and {} byte(s) at the start of packet at the same time",
            args.ignored_bytes
        ));
    }

    if args.snaplen == Some(0) {
        return config_err("the snapshot length must be greater than zero");
    }

    let fuzz = match args.error_probability {
        Some(probability) => {
            if !(0.0..=1.0).contains(&probability) {
                return config_err(format!(
                    "probability \"{probability}\" must be between 0.0 and 1.0"
                ));
            }
            let seed = args.seed.unwrap_or_else(derive_seed);
            debug!("using seed {seed}");
            Some(FuzzConfig { probability, seed })
        }
        None => None,
    };

    let mut comments = BTreeMap::new();
    for spec in &args.comments {
        let parsed = spec
            .split_once(':')
            .and_then(|(num, text)| num.parse::<u32>().ok().map(|n| (n, text)));
        let Some((frame, text)) = parsed else {
            return config_err(format!("\"{spec}\" isn't a valid <frame>:<comment>"));
        };
        comments.insert(frame, text.to_string());
    }

    let out_encap = match args.encap_type.as_deref() {
        None | Some("") => None,
        Some(name) => encap_from_short_name(name),
    };

    Ok(PipelineConfig {
        selection,
        keep: args.keep,
        time_window,
        split,
        strict_adjustment,
        time_shift_adjustment,
        snaplen: args.snaplen,
        chop,
        adjlen: args.adjlen,
        novlan: args.novlan,
        dedup,
        ignored_bytes: args.ignored_bytes,
        skip_radiotap: args.skip_radiotap,
        fuzz,
        change_offset: args.change_offset,
        comments,
        out_encap,
        report: args.report,
    })
}

// ─── Driver ───────────────────────────────────────────────────────────────────

fn open_output(path: &str, linktype: i32, snaplen: u32) -> Result<CaptureSink, EditError> {
    CaptureSink::open(path, linktype, snaplen).map_err(|e| EditError::Write(format!("{e:#}")))
}

fn close_sink(sink: &mut Option<CaptureSink>) -> Result<(), EditError> {
    if let Some(open) = sink.take() {
        open.close().map_err(|e| EditError::Write(format!("{e:#}")))?;
    }
    Ok(())
}

fn plural(n: u64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn drive(
    config: &PipelineConfig,
    source: &mut CaptureSource,
    infile: &Path,
    outfile: &str,
) -> Result<(), EditError> {
    let mut stats = EditStats::default();
    let mut read_count: u32 = 0;
    let mut written_count: u64 = 0;
    let mut duplicate_count: u64 = 0;
    let mut read_failure: Option<String> = None;

    let template = extract_prefix_suffix(outfile);
    let mut file_index: u32 = 0;
    let mut interval_start: Option<TimeSpec> = None;

    let sink_snaplen = config.snaplen.map_or(source.snaplen, |s| s.min(source.snaplen));
    let out_encap = config.out_encap.unwrap_or(source.linktype);
    let mut sink: Option<CaptureSink> = None;

    // In keep mode nothing past the highest selected record can match.
    let max_packet_number =
        if config.keep { config.selection.max_selection } else { u32::MAX };

    let mut strict = config.strict_adjustment.map(StrictTimeAdjuster::new);
    let mut dedup = match config.dedup {
        DedupMode::Off => None,
        DedupMode::ByCount(window) => {
            Some(DedupCache::new(window, config.ignored_bytes, config.skip_radiotap))
        }
        DedupMode::ByTime(_) => {
            Some(DedupCache::new(MAX_DUP_DEPTH, config.ignored_bytes, config.skip_radiotap))
        }
    };
    let mut fuzzer = config.fuzz.as_ref().map(|f| Fuzzer::new(f.probability, f.seed));

    loop {
        let mut record = match source.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(err) => {
                read_failure = Some(format!("{err:#}"));
                break;
            }
        };
        if read_count >= max_packet_number {
            break;
        }
        read_count += 1;
        stats.records_read += 1;

        // The first record decides the initial output file name.
        if sink.is_none() {
            let filename = if config.split == SplitMode::None {
                outfile.to_string()
            } else {
                let ts = record.has_timestamp.then_some(record.ts);
                let name = split_filename(&template, file_index, ts);
                file_index += 1;
                name
            };
            sink = Some(open_output(&filename, out_encap, sink_snaplen)?);
            stats.files_written += 1;
        }

        // Time window.
        if let Some((start, stop)) = config.time_window {
            let ts_okay =
                record.has_timestamp && record.ts.secs >= start && record.ts.secs < stop;
            if !ts_okay {
                stats.records_out_of_window += 1;
                debug!("record {read_count} is outside the time window");
                continue;
            }
        }

        // Selection.
        if config.selection.selected(read_count) != config.keep {
            stats.records_deselected += 1;
            continue;
        }

        if config.dedup == DedupMode::Off {
            debug!("packet: {read_count}");
        }

        // Split rollover.
        match config.split {
            SplitMode::ByInterval(secs_per_block) => {
                if record.has_timestamp {
                    let mut start = *interval_start.get_or_insert(record.ts);
                    let block = i64::from(secs_per_block);
                    // A gap larger than one interval rolls once per block.
                    while record.ts.secs - start.secs > block
                        || (record.ts.secs - start.secs == block
                            && record.ts.nsecs >= start.nsecs)
                    {
                        close_sink(&mut sink)?;
                        start.secs += block;
                        let name = split_filename(&template, file_index, Some(record.ts));
                        file_index += 1;
                        debug!("continuing writing in file {name}");
                        sink = Some(open_output(&name, out_encap, sink_snaplen)?);
                        stats.files_written += 1;
                    }
                    interval_start = Some(start);
                }
            }
            SplitMode::ByCount(split_packet_count) => {
                if written_count > 0 && written_count % u64::from(split_packet_count) == 0 {
                    close_sink(&mut sink)?;
                    let ts = record.has_timestamp.then_some(record.ts);
                    let name = split_filename(&template, file_index, ts);
                    file_index += 1;
                    debug!("continuing writing in file {name}");
                    sink = Some(open_output(&name, out_encap, sink_snaplen)?);
                    stats.files_written += 1;
                }
            }
            SplitMode::None => {}
        }

        // Timestamp rewriting.
        if record.has_timestamp {
            if let Some(strict) = strict.as_mut() {
                let adjusted = strict.adjust(record.ts);
                if adjusted != record.ts {
                    stats.timestamps_rewritten += 1;
                    record.ts = adjusted;
                }
            }
            if let Some(shift) = &config.time_shift_adjustment {
                record.ts = shift_time(record.ts, shift);
            }
        }

        if record.kind == RecordKind::Packet {
            // Snap.
            if let Some(snaplen) = config.snaplen {
                if record.caplen > snaplen {
                    record.payload.truncate(snaplen as usize);
                    record.caplen = snaplen;
                    stats.records_snapped += 1;
                }
                if config.adjlen && record.len > snaplen {
                    record.len = snaplen;
                }
            }

            // Chop.
            if config.chop.is_active() {
                let caplen_before = record.caplen;
                let (caplen, len) = handle_chopping(
                    config.chop,
                    record.caplen,
                    record.len,
                    &mut record.payload,
                    config.adjlen,
                );
                record.caplen = caplen;
                record.len = len;
                if caplen != caplen_before {
                    stats.records_chopped += 1;
                }
            }

            // VLAN removal.
            if config.novlan
                && record.encap == LINKTYPE_LINUX_SLL
                && sll_remove_vlan_tag(&mut record.payload)
            {
                record.caplen -= VLAN_TAG_LEN as u32;
                stats.vlan_tags_removed += 1;
            }

            // Duplicate suppression.
            match config.dedup {
                DedupMode::ByCount(_) => {
                    let cache = dedup.as_mut().expect("count-mode cache");
                    let dup = cache.is_duplicate(&record.payload);
                    let slot = cache.cursor_slot();
                    let tag = if dup { "skipped" } else { "packet" };
                    debug!(
                        "{tag}: {read_count}, len: {}, md5: {}",
                        slot.len,
                        digest_hex(&slot.digest)
                    );
                    if dup {
                        duplicate_count += 1;
                        stats.duplicates_dropped += 1;
                        continue;
                    }
                }
                DedupMode::ByTime(window) => {
                    if record.has_timestamp {
                        let cache = dedup.as_mut().expect("time-mode cache");
                        let dup = cache.is_duplicate_rel_time(&record.payload, record.ts, window);
                        let slot = cache.cursor_slot();
                        let tag = if dup { "skipped" } else { "packet" };
                        debug!(
                            "{tag}: {read_count}, len: {}, md5: {}",
                            slot.len,
                            digest_hex(&slot.digest)
                        );
                        if dup {
                            duplicate_count += 1;
                            stats.duplicates_dropped += 1;
                            continue;
                        }
                    }
                }
                DedupMode::Off => {}
            }
        }

        // Random error mutation.
        if let Some(fuzzer) = fuzzer.as_mut() {
            let caplen = match record.kind {
                RecordKind::Packet
                | RecordKind::FtSpecificEvent
                | RecordKind::FtSpecificReport
                | RecordKind::Syscall => Some(record.caplen),
                RecordKind::Other => None,
            };
            if let Some(caplen) = caplen {
                if config.change_offset > caplen {
                    warn!(
                        "change offset {} is longer than caplen {caplen} in packet {read_count}",
                        config.change_offset
                    );
                } else {
                    let mut start = config.change_offset as usize;
                    if record.kind == RecordKind::Packet && source.dct2000 {
                        start += dct2000_real_data_start(&record.payload);
                    }
                    if fuzzer.mutate(&mut record.payload[..caplen as usize], start) {
                        stats.records_fuzzed += 1;
                    }
                }
            }
        }

        // User comments.
        if !config.comments.is_empty() {
            match config.comments.get(&read_count) {
                Some(comment) => {
                    record.comment = Some(comment.clone());
                    record.comment_changed = true;
                    stats.comments_attached += 1;
                }
                None => record.comment_changed = false,
            }
        }

        // Emit.
        let open = sink.as_mut().expect("sink is open");
        open.write_record(&record)
            .map_err(|e| EditError::Write(format!("error writing to {}: {e:#}", open.path)))?;
        written_count += 1;
        stats.records_written += 1;
    }

    // A capture that never yielded a record still gets a valid, empty
    // output file.
    if sink.is_none() {
        sink = Some(open_output(outfile, out_encap, sink_snaplen)?);
        stats.files_written += 1;
    }
    close_sink(&mut sink)?;

    match config.dedup {
        DedupMode::ByCount(window) => {
            eprintln!(
                "{} packet{} seen, {} packet{} skipped with duplicate window of {} packets.",
                read_count,
                plural(u64::from(read_count)),
                duplicate_count,
                plural(duplicate_count),
                window
            );
        }
        DedupMode::ByTime(window) => {
            eprintln!(
                "{} packet{} seen, {} packet{} skipped with duplicate time window equal to or less than {}.{:09} seconds.",
                read_count,
                plural(u64::from(read_count)),
                duplicate_count,
                plural(duplicate_count),
                window.secs,
                window.nsecs
            );
        }
        DedupMode::Off => {}
    }

    if config.report {
        println!("{}", serde_json::to_string_pretty(&stats).expect("stats serialize"));
    }

    if let Some(msg) = read_failure {
        return Err(EditError::Read(format!("error reading {}: {msg}", infile.display())));
    }
    Ok(())
}

// ─── Main ─────────────────────────────────────────────────────────────────────

fn run(args: Args) -> Result<(), EditError> {
    if let Some(file_type) = args.file_type.as_deref() {
        if file_type.is_empty() {
            list_capture_types();
            return Ok(());
        }
        if !FILE_TYPES.iter().any(|(short, _)| *short == file_type) {
            list_capture_types();
            return config_err(format!("\"{file_type}\" isn't a valid capture file type"));
        }
    }
    match args.encap_type.as_deref() {
        Some("") => {
            list_encap_types();
            return Ok(());
        }
        Some(name) if encap_from_short_name(name).is_none() => {
            list_encap_types();
            return config_err(format!("\"{name}\" isn't a valid encapsulation type"));
        }
        _ => {}
    }

    let config = build_config(&args)?;

    let Some(infile) = args.infile.as_deref() else {
        return config_err("an input capture file must be given (see --help)");
    };

    let mut source =
        CaptureSource::open(infile).map_err(|e| EditError::Read(format!("{e:#}")))?;
    info!("{} is a pcap capture file", infile.display());

    if config.skip_radiotap && source.linktype != LINKTYPE_IEEE802_11_RADIOTAP {
        return config_err(
            "can't skip radiotap headers: the input encapsulation isn't radiotap",
        );
    }

    // With no output file the input is only opened and identified.
    let Some(outfile) = args.outfile.as_deref() else {
        return Ok(());
    };

    drive(&config, &mut source, infile, outfile)
}

fn main() {
    let args = Args::parse();
    let log_level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(args) {
        eprintln!("capedit: {err}");
        process::exit(err.exit_code());
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse_adj(s: &str) -> TimeAdjustment { parse_time_spec(s, "time adjustment").unwrap() }

    #[test] fn time_spec_whole_and_frac() { let a = parse_adj("1.5"); assert_eq!((a.tv.secs, a.tv.nsecs, a.is_negative), (1, 500_000_000, false)); }
    #[test] fn time_spec_negative()       { let a = parse_adj("-0.5"); assert_eq!((a.tv.secs, a.tv.nsecs, a.is_negative), (0, 500_000_000, true)); }
    #[test] fn time_spec_bare_fraction()  { assert_eq!(parse_adj(".25").tv.nsecs, 250_000_000); }
    #[test] fn time_spec_microsecond()    { assert_eq!(parse_adj("0.000001").tv.nsecs, 1_000); }
    #[test] fn time_spec_trailing_dot()   { assert_eq!(parse_adj("7.").tv, TimeSpec::new(7, 0)); }
    #[test] fn time_spec_leading_space()  { assert_eq!(parse_adj(" \t2.5").tv.secs, 2); }
    #[test] fn time_spec_truncates()      { assert_eq!(parse_adj("1.1234567891").tv.nsecs, 123_456_789); }

    #[test]
    fn time_spec_rejects_garbage() {
        for bad in ["-", "", "abc", "5x", "--1"] {
            assert!(parse_time_spec(bad, "time adjustment").is_err(), "{bad:?} parsed");
        }
        // Seconds overflow is an error, not a saturation.
        assert!(parse_time_spec("99999999999999999999", "time adjustment").is_err());
    }

    #[test]
    fn wall_clock_round_trips_through_split_names() {
        let secs = parse_wall_clock("2024-03-05 06:07:08", "time format").unwrap();
        assert_eq!(split_time_string(TimeSpec::new(secs, 0)), "20240305060708");
    }

    #[test]
    fn default_stop_is_far_future() {
        let start = parse_wall_clock("2030-01-01 00:00:00", "time format").unwrap();
        assert!(default_stop_time() > start);
    }

    // ── Selection ──

    #[test]
    fn selection_singletons_and_ranges() {
        let mut sel = SelectionSet::default();
        sel.add("3").unwrap();
        sel.add("7-9").unwrap();
        for n in [3, 7, 8, 9] { assert!(sel.selected(n), "{n}"); }
        for n in [1, 2, 4, 6, 10] { assert!(!sel.selected(n), "{n}"); }
        assert_eq!(sel.max_selection, 9);
    }

    #[test]
    fn selection_open_range() {
        let mut sel = SelectionSet::default();
        sel.add("5-0").unwrap();
        assert!(!sel.selected(4));
        assert!(sel.selected(5));
        assert!(sel.selected(1_000_000));
        assert_eq!(sel.max_selection, u32::MAX);
    }

    #[test]
    fn selection_complement_partitions() {
        // A keep-mode run and a delete-mode run over the same ranges
        // split the input exactly in two.
        let mut sel = SelectionSet::default();
        sel.add("2").unwrap();
        sel.add("4-6").unwrap();
        let kept: Vec<u32> = (1..=10).filter(|&n| sel.selected(n)).collect();
        let deleted: Vec<u32> = (1..=10).filter(|&n| !sel.selected(n)).collect();
        assert_eq!(kept, vec![2, 4, 5, 6]);
        assert_eq!(deleted, vec![1, 3, 7, 8, 9, 10]);
        assert_eq!(kept.len() + deleted.len(), 10);
    }

    #[test]
    fn selection_table_caps_at_512() {
        let mut sel = SelectionSet::default();
        for n in 1..=512u32 {
            assert!(sel.add(&n.to_string()).unwrap());
        }
        assert!(!sel.add("513").unwrap());
        assert_eq!(sel.items.len(), 512);
        assert!(!sel.selected(513));
    }

    #[test]
    fn selection_rejects_non_numbers() {
        let mut sel = SelectionSet::default();
        assert!(sel.add("x").is_err());
        assert!(sel.add("1-y").is_err());
    }

    // ── Chopping ──

    fn chop_spec(args: &[&str]) -> ChopSpec {
        let mut spec = ChopSpec::default();
        for arg in args { spec.add(arg).unwrap(); }
        spec
    }

    fn run_chop(args: &[&str], payload: &[u8], adjlen: bool) -> (u32, u32, Vec<u8>) {
        let mut buf = payload.to_vec();
        let caplen = buf.len() as u32;
        let (c, l) = handle_chopping(chop_spec(args), caplen, caplen, &mut buf, adjlen);
        assert_eq!(buf.len() as u32, c, "payload length != caplen");
        (c, l, buf)
    }

    #[test]
    fn chop_noop_is_identity() {
        let (c, l, buf) = run_chop(&[], b"ABCDEFGHIJ", true);
        assert_eq!((c, l), (10, 10));
        assert_eq!(buf, b"ABCDEFGHIJ");
    }

    #[test]
    fn chop_both_ends_adjusting_len() {
        // 4 bytes off the front, 3 off the back.
        let (c, l, buf) = run_chop(&["4", "-3"], b"ABCDEFGHIJ", true);
        assert_eq!((c, l), (3, 3));
        assert_eq!(buf, b"EFG");
    }

    #[test]
    fn chop_keeps_reported_len_without_adjlen() {
        let (c, l, buf) = run_chop(&["4", "-3"], b"ABCDEFGHIJ", false);
        assert_eq!((c, l), (3, 10));
        assert_eq!(buf, b"EFG");
    }

    #[test]
    fn chop_begin_with_offset_keeps_leading_piece() {
        // Remove 3 bytes starting at offset 2.
        let (c, _, buf) = run_chop(&["2:3"], b"ABCDEFGHIJ", false);
        assert_eq!(c, 7);
        assert_eq!(buf, b"ABFGHIJ");
    }

    #[test]
    fn chop_end_with_offset_keeps_trailing_piece() {
        // Remove 2 bytes, one byte in from the end.
        let (c, _, buf) = run_chop(&["-1:-2"], b"ABCDEFGHIJ", false);
        assert_eq!(c, 8);
        assert_eq!(buf, b"ABCDEFGJ");
    }

    #[test]
    fn chop_negative_begin_offset_counts_from_end() {
        // Begin region anchored 4 bytes before the end.
        let (c, _, buf) = run_chop(&["-4:2"], b"ABCDEFGHIJ", false);
        assert_eq!(c, 8);
        assert_eq!(buf, b"ABCDEFIJ");
    }

    #[test]
    fn chop_crossed_regions_swap() {
        // The begin region starts past the end region; the two mirror.
        let (c, _, buf) = run_chop(&["8:2", "-6:-2"], b"ABCDEFGHIJ", false);
        assert_eq!(c, 6);
        assert_eq!(buf, b"ABEFGH");
    }

    #[test]
    fn chop_more_than_available_empties_packet() {
        let (c, l, buf) = run_chop(&["10"], b"ABCDE", true);
        assert_eq!((c, l), (0, 0));
        assert!(buf.is_empty());
    }

    #[test]
    fn chop_offset_past_caplen_chops_nothing() {
        let (c, _, buf) = run_chop(&["12:3"], b"ABCDEFGHIJ", false);
        assert_eq!(c, 10);
        assert_eq!(buf, b"ABCDEFGHIJ");
    }

    #[test]
    fn chop_clamps_split_between_regions() {
        // Only 5 bytes available: the begin chop is clamped to what
        // remains and the end chop is dropped, leaving nothing.
        let (c, _, buf) = run_chop(&["4", "-4"], b"ABCDE", false);
        assert_eq!(c, 0);
        assert!(buf.is_empty());
    }

    // ── Duplicate detection ──

    #[test]
    fn dedup_consecutive_identical_is_dropped() {
        let mut cache = DedupCache::new(DEFAULT_DUP_DEPTH, 0, false);
        let frame = vec![0x42u8; 100];
        assert!(!cache.is_duplicate(&frame));
        assert!(cache.is_duplicate(&frame));
    }

    #[test]
    fn dedup_distinct_frames_pass() {
        let mut cache = DedupCache::new(3, 0, false);
        for b in 0..3u8 {
            assert!(!cache.is_duplicate(&[b; 64]));
        }
    }

    #[test]
    fn dedup_window_of_one_never_compares() {
        let mut cache = DedupCache::new(1, 0, false);
        let frame = [7u8; 32];
        assert!(!cache.is_duplicate(&frame));
        assert!(!cache.is_duplicate(&frame));
    }

    #[test]
    fn dedup_window_of_zero_only_records_digests() {
        let mut cache = DedupCache::new(0, 0, false);
        let frame = [9u8; 32];
        assert!(!cache.is_duplicate(&frame));
        assert!(!cache.is_duplicate(&frame));
        assert_eq!(cache.cursor_slot().len, 32);
    }

    #[test]
    fn dedup_falls_out_of_count_window() {
        let mut cache = DedupCache::new(2, 0, false);
        assert!(!cache.is_duplicate(&[1u8; 16]));
        assert!(!cache.is_duplicate(&[2u8; 16]));
        // The window only holds the two frames above; frame 1 was evicted.
        assert!(!cache.is_duplicate(&[1u8; 16]));
    }

    #[test]
    fn dedup_ignored_prefix_matches_rerouted_frames() {
        let mut cache = DedupCache::new(5, 14, false);
        let mut first = vec![0u8; 60];
        let mut second = vec![0u8; 60];
        first[..14].fill(0xAA);  // different MAC header
        second[..14].fill(0xBB);
        first[14..].fill(0x11);  // same payload
        second[14..].fill(0x11);
        assert!(!cache.is_duplicate(&first));
        assert!(cache.is_duplicate(&second));
    }

    #[test]
    fn dedup_short_frame_hashes_whole() {
        let mut cache = DedupCache::new(5, 100, false);
        assert!(!cache.is_duplicate(&[1u8, 2, 3]));
        assert!(!cache.is_duplicate(&[9u8, 2, 3]));
    }

    #[test]
    fn dedup_skip_radiotap_ignores_radio_header() {
        // Radiotap: version(1) pad(1) it_len(2 LE) then header body.
        let mut with_noise = vec![0u8; 40];
        with_noise[2] = 8; // it_len = 8
        with_noise[4] = 0x55; // radio noise, differs per radio
        let mut other_radio = with_noise.clone();
        other_radio[4] = 0x66;

        let mut cache = DedupCache::new(5, 0, true);
        assert!(!cache.is_duplicate(&with_noise));
        assert!(cache.is_duplicate(&other_radio));

        let mut plain = DedupCache::new(5, 0, false);
        assert!(!plain.is_duplicate(&with_noise));
        assert!(!plain.is_duplicate(&other_radio));
    }

    #[test]
    fn dedup_time_window_within() {
        let mut cache = DedupCache::new(MAX_DUP_DEPTH, 0, false);
        let frame = [3u8; 48];
        let window = TimeSpec::new(1, 0);
        assert!(!cache.is_duplicate_rel_time(&frame, TimeSpec::new(10, 0), window));
        assert!(cache.is_duplicate_rel_time(&frame, TimeSpec::new(10, 500_000_000), window));
    }

    #[test]
    fn dedup_time_window_boundary_still_matches() {
        let mut cache = DedupCache::new(MAX_DUP_DEPTH, 0, false);
        let frame = [3u8; 48];
        let window = TimeSpec::new(1, 0);
        assert!(!cache.is_duplicate_rel_time(&frame, TimeSpec::new(10, 0), window));
        assert!(cache.is_duplicate_rel_time(&frame, TimeSpec::new(11, 0), window));
    }

    #[test]
    fn dedup_time_window_expired_frames_pass() {
        let mut cache = DedupCache::new(MAX_DUP_DEPTH, 0, false);
        let frame = [3u8; 48];
        let window = TimeSpec::new(1, 0);
        assert!(!cache.is_duplicate_rel_time(&frame, TimeSpec::new(10, 0), window));
        assert!(!cache.is_duplicate_rel_time(&frame, TimeSpec::new(12, 1), window));
    }

    #[test]
    fn dedup_time_skips_out_of_order_entries() {
        let mut cache = DedupCache::new(MAX_DUP_DEPTH, 0, false);
        let frame = [3u8; 48];
        let window = TimeSpec::new(5, 0);
        assert!(!cache.is_duplicate_rel_time(&frame, TimeSpec::new(10, 0), window));
        // Earlier timestamp than the cached entry: compared against
        // nothing, not reported as a duplicate.
        assert!(!cache.is_duplicate_rel_time(&frame, TimeSpec::new(8, 0), window));
    }

    // ── Strict chronological adjustment ──

    #[test]
    fn strict_in_order_passes_through() {
        let mut adj = StrictTimeAdjuster::new(parse_adj("0.000001"));
        for secs in [0, 1, 2] {
            let ts = TimeSpec::new(secs, 0);
            assert_eq!(adj.adjust(ts), ts);
        }
    }

    #[test]
    fn strict_rewrites_equal_timestamps() {
        let mut adj = StrictTimeAdjuster::new(parse_adj("0.000001"));
        let zero = TimeSpec::new(0, 0);
        assert_eq!(adj.adjust(zero), zero);
        assert_eq!(adj.adjust(zero), TimeSpec::new(0, 1_000));
        assert_eq!(adj.adjust(zero), TimeSpec::new(0, 2_000));
    }

    #[test]
    fn strict_negative_forces_exact_spacing() {
        let mut adj = StrictTimeAdjuster::new(parse_adj("-1.0"));
        assert_eq!(adj.adjust(TimeSpec::new(10, 0)), TimeSpec::new(10, 0));
        assert_eq!(adj.adjust(TimeSpec::new(10, 200_000_000)), TimeSpec::new(11, 0));
        assert_eq!(adj.adjust(TimeSpec::new(10, 400_000_000)), TimeSpec::new(12, 0));
    }

    #[test]
    fn strict_output_is_monotonic() {
        let mut adj = StrictTimeAdjuster::new(parse_adj("0.5"));
        let inputs = [(5, 0), (4, 0), (6, 0), (3, 0), (6, 1)];
        let mut previous = None;
        for (secs, nsecs) in inputs {
            let out = adj.adjust(TimeSpec::new(secs, nsecs));
            if let Some(prev) = previous {
                assert!(!out.delta(prev).is_backward(), "{out:?} went backwards");
            }
            previous = Some(out);
        }
    }

    #[test]
    fn strict_carry_propagates_to_seconds() {
        let mut adj = StrictTimeAdjuster::new(parse_adj("0.000000002"));
        assert_eq!(adj.adjust(TimeSpec::new(0, 999_999_999)), TimeSpec::new(0, 999_999_999));
        assert_eq!(adj.adjust(TimeSpec::new(0, 0)), TimeSpec::new(1, 1));
    }

    // ── Time shifting ──

    #[test]
    fn shift_forward_carries() {
        let shifted = shift_time(TimeSpec::new(1, 700_000_000), &parse_adj("1.5"));
        assert_eq!(shifted, TimeSpec::new(3, 200_000_000));
    }

    #[test]
    fn shift_backward_borrows() {
        let shifted = shift_time(TimeSpec::new(1, 200_000_000), &parse_adj("-0.5"));
        assert_eq!(shifted, TimeSpec::new(0, 700_000_000));
    }

    #[test]
    fn delta_detects_backward_steps() {
        let a = TimeSpec::new(5, 100);
        let b = TimeSpec::new(5, 200);
        assert!(a.delta(b).is_backward());
        assert!(!b.delta(a).is_backward());
        assert_eq!(b.delta(a), TimeSpec::new(0, 100));
        assert_eq!(TimeSpec::new(6, 0).delta(TimeSpec::new(5, 999_999_999)), TimeSpec::new(0, 1));
    }

    // ── Fuzzer ──

    #[test]
    fn fuzz_same_seed_same_stream() {
        let mut a = vec![0u8; 512];
        let mut b = vec![0u8; 512];
        Fuzzer::new(0.5, 42).mutate(&mut a, 0);
        Fuzzer::new(0.5, 42).mutate(&mut b, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn fuzz_different_seed_diverges() {
        let mut a = vec![0u8; 512];
        let mut b = vec![0u8; 512];
        Fuzzer::new(0.5, 1).mutate(&mut a, 0);
        Fuzzer::new(0.5, 2).mutate(&mut b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn fuzz_preserves_protected_prefix_and_length() {
        let mut buf = vec![0x33u8; 256];
        Fuzzer::new(1.0, 7).mutate(&mut buf, 16);
        assert_eq!(&buf[..16], &[0x33u8; 16][..]);
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn fuzz_zero_probability_is_a_noop() {
        let mut buf = vec![0x33u8; 64];
        assert!(!Fuzzer::new(0.0, 7).mutate(&mut buf, 0));
        assert_eq!(buf, vec![0x33u8; 64]);
    }

    #[test]
    fn error_class_table_boundaries() {
        assert_eq!(pick_error_class(0), ErrorClass::FlipBit);
        assert_eq!(pick_error_class(4), ErrorClass::FlipBit);
        assert_eq!(pick_error_class(5), ErrorClass::RandomByte);
        assert_eq!(pick_error_class(10), ErrorClass::RandomAlnum);
        assert_eq!(pick_error_class(14), ErrorClass::RandomAlnum);
        assert_eq!(pick_error_class(15), ErrorClass::FormatString);
        assert_eq!(pick_error_class(16), ErrorClass::FormatString);
        assert_eq!(pick_error_class(17), ErrorClass::FillAa);
    }

    // ── Format-specific helpers ──

    #[test]
    fn dct2000_header_scan() {
        // Six NUL-terminated fields, then direction and encap bytes.
        let header = b"ctx\0 1\0timestamp\0proto\0var\0out\0DE";
        let mut payload = header.to_vec();
        payload.extend_from_slice(b"real data");
        assert_eq!(dct2000_real_data_start(&payload), header.len());
        assert_eq!(&payload[dct2000_real_data_start(&payload)..], b"real data");
    }

    #[test]
    fn sll_vlan_tag_is_removed() {
        // 14-byte SLL header, 802.1Q tag, then the inner protocol bytes.
        let mut frame = vec![0u8; 14];
        frame.extend_from_slice(&[0x81, 0x00, 0x00, 0x2A]); // tag, VID 42
        frame.extend_from_slice(&[0x08, 0x00, 0xDE, 0xAD]);
        let mut stripped = frame.clone();
        assert!(sll_remove_vlan_tag(&mut stripped));
        assert_eq!(stripped.len(), frame.len() - 4);
        assert_eq!(&stripped[14..], &[0x08, 0x00, 0xDE, 0xAD]);
    }

    #[test]
    fn sll_without_vlan_is_untouched() {
        let mut frame = vec![0u8; 20];
        frame[14] = 0x08; // plain IPv4
        let before = frame.clone();
        assert!(!sll_remove_vlan_tag(&mut frame));
        assert_eq!(frame, before);

        let mut short = vec![0u8; 10];
        assert!(!sll_remove_vlan_tag(&mut short));
    }

    // ── Split file naming ──

    #[test]
    fn prefix_suffix_split_at_last_dot() {
        let name = format!("dir{MAIN_SEPARATOR}cap.pcap");
        let t = extract_prefix_suffix(&name);
        assert_eq!(t.prefix, format!("dir{MAIN_SEPARATOR}cap"));
        assert_eq!(t.suffix, ".pcap");
    }

    #[test]
    fn prefix_suffix_without_dot() {
        let t = extract_prefix_suffix("capture");
        assert_eq!((t.prefix.as_str(), t.suffix.as_str()), ("capture", ""));
    }

    #[test]
    fn prefix_suffix_ignores_dot_in_directory() {
        let name = format!("dir.d{MAIN_SEPARATOR}capture");
        let t = extract_prefix_suffix(&name);
        assert_eq!(t.prefix, name);
        assert_eq!(t.suffix, "");
    }

    #[test]
    fn split_names_are_zero_padded_and_wrap() {
        let t = extract_prefix_suffix("cap.pcap");
        assert_eq!(split_filename(&t, 0, None), "cap_00000.pcap");
        assert_eq!(split_filename(&t, 123_456, None), "cap_23456.pcap");
        let with_ts = split_filename(&t, 1, Some(TimeSpec::new(0, 0)));
        assert!(with_ts.starts_with("cap_00001_"));
        assert!(with_ts.ends_with(".pcap"));
    }

    // ── Driver round trips through real files ──

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("capedit-{}-{name}", process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn packet(secs: i64, usecs: i64, payload: &[u8]) -> Record {
        Record {
            kind: RecordKind::Packet,
            has_timestamp: true,
            ts: TimeSpec::new(secs, usecs * 1_000),
            caplen: payload.len() as u32,
            len: payload.len() as u32,
            encap: 1,
            payload: payload.to_vec(),
            comment: None,
            comment_changed: false,
        }
    }

    fn write_capture(path: &Path, records: &[Record]) {
        let mut sink = CaptureSink::open(path.to_str().unwrap(), 1, 65535).unwrap();
        for record in records {
            sink.write_record(record).unwrap();
        }
        sink.close().unwrap();
    }

    fn read_capture(path: &Path) -> Vec<Record> {
        let mut source = CaptureSource::open(path).unwrap();
        let mut records = Vec::new();
        while let Some(record) = source.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    fn base_args(infile: &Path, outfile: &Path) -> Args {
        Args {
            infile: Some(infile.to_path_buf()),
            outfile: Some(outfile.to_str().unwrap().to_string()),
            ranges: Vec::new(),
            keep: false,
            starttime: None,
            stoptime: None,
            split_packet_count: None,
            secs_per_block: None,
            chops: Vec::new(),
            adjlen: false,
            snaplen: None,
            time_adjustment: None,
            strict_time_adjustment: None,
            error_probability: None,
            change_offset: 0,
            ignored_bytes: 0,
            dup_detect: false,
            dup_window: None,
            dup_time_window: None,
            comments: Vec::new(),
            file_type: None,
            encap_type: None,
            verbose: false,
            novlan: false,
            skip_radiotap: false,
            seed: None,
            report: false,
        }
    }

    #[test]
    fn round_trip_preserves_records() {
        let dir = test_dir("roundtrip");
        let input = dir.join("in.pcap");
        let output = dir.join("out.pcap");
        let original =
            vec![packet(100, 0, b"first"), packet(101, 250_000, b"second"), packet(102, 0, b"third")];
        write_capture(&input, &original);

        run(base_args(&input, &output)).unwrap();

        let copied = read_capture(&output);
        assert_eq!(copied.len(), 3);
        for (a, b) in original.iter().zip(&copied) {
            assert_eq!(a.ts, b.ts);
            assert_eq!(a.payload, b.payload);
            assert_eq!(a.len, b.len);
        }
    }

    #[test]
    fn selection_keep_and_delete_modes() {
        let dir = test_dir("selection");
        let input = dir.join("in.pcap");
        write_capture(
            &input,
            &[packet(1, 0, b"one"), packet(2, 0, b"two"), packet(3, 0, b"three")],
        );

        let kept = dir.join("kept.pcap");
        let mut args = base_args(&input, &kept);
        args.ranges = vec!["2".to_string()];
        args.keep = true;
        run(args).unwrap();
        let records = read_capture(&kept);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"two");

        let deleted = dir.join("deleted.pcap");
        let mut args = base_args(&input, &deleted);
        args.ranges = vec!["2".to_string()];
        run(args).unwrap();
        let records = read_capture(&deleted);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, b"one");
        assert_eq!(records[1].payload, b"three");
    }

    #[test]
    fn time_window_keeps_middle_packet() {
        let dir = test_dir("timewindow");
        let input = dir.join("in.pcap");
        // Use round epochs far from any DST transition and format the
        // window bounds through the same local clock the parser uses.
        let base = 1_600_000_000i64;
        write_capture(
            &input,
            &[packet(base, 0, b"early"), packet(base + 60, 0, b"kept"), packet(base + 120, 0, b"late")],
        );
        let fmt = |secs: i64| {
            Local
                .timestamp_opt(secs, 0)
                .single()
                .unwrap()
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        };

        let output = dir.join("out.pcap");
        let mut args = base_args(&input, &output);
        args.starttime = Some(fmt(base + 60));
        args.stoptime = Some(fmt(base + 120));
        run(args).unwrap();

        let records = read_capture(&output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"kept");
    }

    #[test]
    fn split_by_count_rolls_files() {
        let dir = test_dir("splitcount");
        let input = dir.join("in.pcap");
        let records: Vec<Record> =
            (0..5).map(|i| packet(1000 + i, 0, format!("pkt{i}").as_bytes())).collect();
        write_capture(&input, &records);

        let output = dir.join("out.pcap");
        let mut args = base_args(&input, &output);
        args.split_packet_count = Some(2);
        run(args).unwrap();

        let mut names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("out_"))
            .collect();
        names.sort();
        assert_eq!(names.len(), 3, "expected three output files, got {names:?}");
        assert!(names[0].starts_with("out_00000_"));
        assert!(names[2].starts_with("out_00002_"));

        let counts: Vec<usize> =
            names.iter().map(|n| read_capture(&dir.join(n)).len()).collect();
        assert_eq!(counts.iter().sum::<usize>(), 5);
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn split_by_interval_rolls_on_the_boundary() {
        let dir = test_dir("splitinterval");
        let input = dir.join("in.pcap");
        write_capture(
            &input,
            &[packet(100, 0, b"a"), packet(100, 500_000, b"b"), packet(103, 0, b"c")],
        );

        let output = dir.join("out.pcap");
        let mut args = base_args(&input, &output);
        args.secs_per_block = Some(1);
        run(args).unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("out_"))
            .collect();
        // The three-second gap crosses three interval boundaries.
        assert_eq!(names.len(), 4, "{names:?}");
        let total: usize = names.iter().map(|n| read_capture(&dir.join(n)).len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn dedup_end_to_end_drops_and_reports() {
        let dir = test_dir("dedup");
        let input = dir.join("in.pcap");
        write_capture(
            &input,
            &[packet(1, 0, &[0x42; 100]), packet(2, 0, &[0x42; 100]), packet(3, 0, b"unique")],
        );

        let output = dir.join("out.pcap");
        let mut args = base_args(&input, &output);
        args.dup_detect = true;
        run(args).unwrap();

        let records = read_capture(&output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, b"unique");
    }

    #[test]
    fn empty_input_still_produces_valid_output() {
        let dir = test_dir("emptyout");
        let input = dir.join("in.pcap");
        write_capture(&input, &[]);

        let output = dir.join("out.pcap");
        run(base_args(&input, &output)).unwrap();
        assert!(read_capture(&output).is_empty());
    }

    #[test]
    fn fuzz_end_to_end_is_reproducible() {
        let dir = test_dir("fuzz");
        let input = dir.join("in.pcap");
        let records: Vec<Record> =
            (0..4).map(|i| packet(i, 0, &[i as u8; 200])).collect();
        write_capture(&input, &records);

        let out_a = dir.join("a.pcap");
        let out_b = dir.join("b.pcap");
        for out in [&out_a, &out_b] {
            let mut args = base_args(&input, out);
            args.error_probability = Some(0.3);
            args.seed = Some(99);
            args.change_offset = 8;
            run(args).unwrap();
        }

        let a = read_capture(&out_a);
        let b = read_capture(&out_b);
        assert_eq!(a.len(), 4);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.payload, y.payload);
        }
        // The protected prefix survives corruption.
        for (orig, fuzzed) in records.iter().zip(&a) {
            assert_eq!(&orig.payload[..8], &fuzzed.payload[..8]);
            assert_eq!(orig.payload.len(), fuzzed.payload.len());
        }
    }

    #[test]
    fn conflicting_split_flags_exit_with_config_error() {
        let dir = test_dir("conflict");
        let input = dir.join("in.pcap");
        write_capture(&input, &[packet(1, 0, b"x")]);
        let mut args = base_args(&input, &dir.join("out.pcap"));
        args.split_packet_count = Some(2);
        args.secs_per_block = Some(2);
        let err = run(args).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn snap_truncates_and_adjusts_len() {
        let dir = test_dir("snap");
        let input = dir.join("in.pcap");
        write_capture(&input, &[packet(1, 0, &[0xAB; 64])]);

        let output = dir.join("out.pcap");
        let mut args = base_args(&input, &output);
        args.snaplen = Some(16);
        args.adjlen = true;
        run(args).unwrap();

        let records = read_capture(&output);
        assert_eq!(records[0].caplen, 16);
        assert_eq!(records[0].len, 16);
        assert_eq!(records[0].payload.len(), 16);
    }
}
