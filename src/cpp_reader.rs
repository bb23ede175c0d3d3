//! Streaming reader for preprocessor output.
//!
//! The reader pulls raw bytes off the preprocessor (pipe or file), and when
//! normalization is enabled rewrites the stream in place on the way through:
//! blank-line runs collapse, `\r\n` becomes `\n`, and `#line` noise that only
//! restates the current position is absorbed or re-synthesized in a minimal
//! form. The caller forwards each finalized chunk to the digest and to the
//! compiler, so all three consumers observe the exact same normalized bytes.
//!
//! Buffer geometry (all indexes into `buf`):
//!
//! ```text
//!   0 .. optimized_end     finalized, normalized output
//!   optimized_end .. unopt_start   free gap (normalization only shrinks)
//!   unopt_start .. cur     pending text, candidate for blank collapsing
//!   cur .. read_end        raw input not yet scanned
//! ```
//!
//! The four offsets stay ordered; inserting text longer than the gap shifts
//! the unscanned region right.

use std::io::Read;

use crate::deps::DepCollector;
use crate::prelude::*;
use crate::util::retry_interrupted;

/// Bit 0 of the optimization flags: normalize the stream.
pub const OPT_NORMALIZE: u8 = 1;
/// Bit 1: digest-only mode; the orchestrator must not fall back to the
/// byte-level comparison, and the normalizer may drop pending blank runs
/// outright when a directive supersedes them.
pub const OPT_DIGEST_ONLY: u8 = 2;

/// Growth quantum for the output buffer. Preprocessor output for real
/// translation units runs to megabytes, so be generous and predictable.
const BUF_ALIGNMENT: usize = 4 * 1024 * 1024;
const BUF_MIN: usize = BUF_ALIGNMENT;
const BUF_INCR: usize = BUF_ALIGNMENT;

/// Collapsing a run of blank lines beats synthesizing a `#line` directive up
/// to this many lines; past it, whichever rendering is textually shorter
/// wins. Break-even measured by the original implementation.
const LINE_DIRECTIVE_BREAK_EVEN: u32 = 7;

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

pub struct CppReader<'d> {
    buf: Vec<u8>,
    /// Finalized normalized prefix.
    optimized_end: usize,
    /// Start of the pending (not yet committed) source region.
    unopt_start: usize,
    /// Scan position.
    cur: usize,
    /// End of raw input read so far.
    read_end: usize,
    /// Line number at `optimized_end`.
    opt_line: u32,
    /// Line number at `cur`.
    cur_line: u32,
    /// No more input will arrive.
    done: bool,
    flags: u8,
    /// Current filename as spelled in the last file-changing directive
    /// (still escaped).
    cur_file: Vec<u8>,
    /// Scratch for synthesized directives and newline runs.
    line_buf: Vec<u8>,
    /// Borrowed dependency collector, notified on file changes.
    dep: Option<&'d mut DepCollector>,
}

impl<'d> CppReader<'d> {
    /// `prev_size` is the size of the previous run's output (0 if unknown)
    /// and only tunes the initial allocation.
    pub fn new(prev_size: usize, flags: u8, dep: Option<&'d mut DepCollector>) -> CppReader<'d> {
        debug_assert!(dep.is_none() || flags & OPT_NORMALIZE != 0);
        let initial = if prev_size != 0 {
            (prev_size + BUF_INCR) & !(BUF_ALIGNMENT - 1)
        } else {
            BUF_MIN
        };
        CppReader {
            buf: vec![0; initial],
            optimized_end: 0,
            unopt_start: 0,
            cur: 0,
            read_end: 0,
            opt_line: 1,
            cur_line: 1,
            done: false,
            flags,
            cur_file: Vec::new(),
            line_buf: Vec::new(),
            dep,
        }
    }

    fn grow(&mut self) {
        let new_len = self.buf.len() + BUF_INCR;
        self.buf.resize(new_len, 0);
    }

    /// Replace `src_replaced` bytes of pending source with `insert`,
    /// appending it to the finalized prefix. Returns how far the unscanned
    /// region had to shift right to make room (usually 0: normalization
    /// shrinks).
    fn opt_insert(&mut self, src_replaced: usize, insert: &[u8]) -> usize {
        self.unopt_start += src_replaced;
        debug_assert!(self.unopt_start <= self.cur);

        let mut delta = 0;
        let avail = self.unopt_start - self.optimized_end;
        if avail < insert.len() {
            delta = insert.len() - avail;
            while self.read_end + delta > self.buf.len() {
                self.grow();
            }
            self.buf
                .copy_within(self.unopt_start..self.read_end, self.unopt_start + delta);
            self.read_end += delta;
            self.unopt_start += delta;
            self.cur += delta;
        }

        self.buf[self.optimized_end..self.optimized_end + insert.len()].copy_from_slice(insert);
        self.optimized_end += insert.len();
        delta
    }

    /// Commit the pending region verbatim.
    fn opt_commit(&mut self) {
        let n = self.cur - self.unopt_start;
        if n > 0 {
            self.buf.copy_within(self.unopt_start..self.cur, self.optimized_end);
            self.optimized_end += n;
            self.unopt_start = self.cur;
        }
        self.opt_line = self.cur_line;
    }

    /// Index of the end of the line starting at/after `from`: the `\r` of a
    /// `\r\n` pair, a bare `\n`, or `read_end` once input is exhausted.
    fn get_eol(&self, from: usize) -> Option<usize> {
        match self.buf[from..self.read_end].iter().position(|&b| b == b'\n') {
            Some(rel) => {
                let nl = from + rel;
                if nl > from && self.buf[nl - 1] == b'\r' {
                    Some(nl - 1)
                } else {
                    Some(nl)
                }
            }
            None if self.done && from < self.read_end => Some(self.read_end),
            None => None,
        }
    }

    fn set_file(&mut self, name: &[u8]) {
        self.cur_file.clear();
        self.cur_file.extend_from_slice(name);
    }

    /// Format `#line N ["FILE"]\n` into the scratch buffer; returns its
    /// length including the newline.
    fn fmt_line(&mut self, line: u32, file: Option<&[u8]>) -> usize {
        self.line_buf.clear();
        self.line_buf.extend_from_slice(b"#line ");
        self.line_buf.extend_from_slice(line.to_string().as_bytes());
        if let Some(file) = file {
            self.line_buf.extend_from_slice(b" \"");
            self.line_buf.extend_from_slice(file);
            self.line_buf.push(b'"');
        }
        self.line_buf.push(b'\n');
        self.line_buf.len()
    }

    fn fmt_newlines(&mut self, count: u32) -> usize {
        self.line_buf.clear();
        self.line_buf.resize(count as usize, b'\n');
        self.line_buf.len()
    }

    /// Insert whatever `fmt_line`/`fmt_newlines` left in the scratch buffer.
    fn insert_scratch(&mut self, src_replaced: usize, len: usize) -> usize {
        let scratch = std::mem::take(&mut self.line_buf);
        let delta = self.opt_insert(src_replaced, &scratch[..len]);
        self.line_buf = scratch;
        delta
    }

    /// Flush the pending blank-line run ending at `src_cur`: emit it as bare
    /// newlines, or as a single `#line` directive when that is shorter than
    /// the run (and the run exceeds the break-even count).
    fn opt_flush(&mut self, src_cur: usize) -> usize {
        debug_assert!(self.unopt_start <= src_cur);
        let mut delta = 0;
        if src_cur > self.unopt_start {
            let src_len = src_cur - self.unopt_start;
            let lines = self.cur_line.wrapping_sub(self.opt_line);

            let mut len = 0;
            if lines > LINE_DIRECTIVE_BREAK_EVEN {
                len = self.fmt_line(self.cur_line, None);
            }
            if len == 0 || len >= lines as usize {
                len = self.fmt_newlines(lines);
            }

            delta = self.insert_scratch(src_len, len);
        }
        delta
    }

    /// Parse `[start, eol)` as a `#line`-style directive. Returns the new
    /// line number and the filename byte range, `None` range meaning no file
    /// was given (stay in the current file).
    #[allow(clippy::type_complexity)]
    fn parse_line_directive(
        &self,
        start: usize,
        eol: usize,
    ) -> Option<(u32, Option<(usize, usize)>)> {
        let b = &self.buf;
        let mut p = start;

        if b[p] != b'#' {
            return None;
        }
        p += 1;

        let mut is_short = p < eol && is_blank(b[p]);
        while p < eol && is_blank(b[p]) {
            p += 1;
        }

        if p + 5 <= eol && &b[p..p + 4] == b"line" && is_blank(b[p + 4]) {
            is_short = false;
            p += 5;
            while p < eol && is_blank(b[p]) {
                p += 1;
            }
        } else if !(is_short && p < eol && b[p].is_ascii_digit()) {
            return None;
        }

        if p >= eol || !b[p].is_ascii_digit() {
            return None;
        }
        let mut line: u32 = 0;
        while p < eol && b[p].is_ascii_digit() {
            line = line.wrapping_mul(10).wrapping_add((b[p] - b'0') as u32);
            p += 1;
        }
        if p != eol && !is_blank(b[p]) {
            return None;
        }

        while p < eol && is_blank(b[p]) {
            p += 1;
        }

        let file;
        if p != eol && b[p] == b'"' {
            p += 1;
            let fstart = p;
            loop {
                if p == eol {
                    // unterminated filename; not a directive we understand
                    return None;
                }
                if b[p] == b'"' {
                    // a quote is a terminator unless an odd number of
                    // backslashes precede it
                    let mut slashes = 0;
                    while p - slashes > fstart && b[p - 1 - slashes] == b'\\' {
                        slashes += 1;
                    }
                    if slashes % 2 == 0 {
                        break;
                    }
                }
                p += 1;
            }
            file = Some((fstart, p));
            p += 1;
            while p < eol && is_blank(b[p]) {
                p += 1;
            }
        } else {
            file = None;
        }

        if p != eol {
            return None;
        }
        Some((line, file))
    }

    /// Deal with one line that begins with `#`. Returns whether the line
    /// counts as empty (i.e. was absorbed into the pending blank run).
    fn handle_line(&mut self, line_start: usize, eol: usize) -> bool {
        let line_off = self.cur;
        let digest_only = self.flags & OPT_DIGEST_ONLY != 0;
        let src_line_len = eol - if digest_only { self.unopt_start } else { self.cur };

        let parsed = self.parse_line_directive(line_start, eol);

        // Move past the line up front; everything below talks in lengths.
        self.cur = eol;

        let Some((new_line, file_range)) = parsed else {
            // Not a line directive. Flush the pending run; the line itself
            // commits at its newline.
            self.opt_flush(line_off);
            return false;
        };

        let same_file = match file_range {
            None => true,
            Some((s, e)) => self.buf[s..e] == self.cur_file[..],
        };

        let empty;
        if same_file {
            if new_line >= self.cur_line {
                // Restates a position at or ahead of where we already are:
                // absorb it, the flush will regenerate the distance.
                empty = true;
            } else {
                // The stream rewinds (macro replay). Synthesize explicitly.
                if !digest_only {
                    self.opt_flush(line_off);
                }
                let len = self.fmt_line(new_line, None) - 1; // sans \n
                self.insert_scratch(src_line_len, len);
                empty = false;
            }
        } else {
            let name = match file_range {
                Some((s, e)) => self.buf[s..e].to_vec(),
                None => Vec::new(),
            };
            self.set_file(&name);
            if !digest_only {
                self.opt_flush(line_off);
            }
            let len = self.fmt_line(new_line, Some(&name)) - 1; // sans \n
            self.insert_scratch(src_line_len, len);
            if let Some(dep) = self.dep.as_deref_mut() {
                dep.enter_file(&name);
            }
            empty = false;
        }

        self.cur_line = new_line.wrapping_sub(1);
        empty
    }

    /// One pass of the normalizer over the unscanned region. Leaves `cur`
    /// parked at the last line boundary when input runs out mid-line.
    fn optimize_pass(&mut self) {
        let mut cur = self.cur;
        let mut empty_line = true;

        while cur < self.read_end {
            match self.buf[cur] {
                b' ' | b'\t' => {}
                b'\n' => {
                    self.cur = cur + 1;
                    self.cur_line = self.cur_line.wrapping_add(1);
                    if !empty_line {
                        self.opt_commit();
                    }
                    empty_line = true;
                }
                b'\r' => {
                    if cur + 1 >= self.read_end && !self.done {
                        // Cannot tell yet whether this is a CRLF; wait for
                        // the next block.
                        return;
                    }
                    if cur + 1 < self.read_end && self.buf[cur + 1] == b'\n' && !empty_line {
                        // Commit up to the '\r', then emit a bare '\n'.
                        self.cur = cur;
                        self.cur_line = self.cur_line.wrapping_add(1);
                        self.opt_commit();
                        self.cur += 2;
                        self.opt_insert(2, b"\n");
                        cur = self.cur;
                        empty_line = true;
                        continue;
                    }
                    // Stray '\r' inside a blank line: treated as blank-ish,
                    // swallowed with the run (or committed with its line).
                }
                b'#' => {
                    let Some(eol) = self.get_eol(cur + 1) else {
                        return;
                    };
                    empty_line = self.handle_line(cur, eol);
                    cur = self.cur;
                    continue;
                }
                _ => {
                    // Real content: flush the pending run, skip to EOL.
                    empty_line = false;
                    let Some(eol) = self.get_eol(cur + 1) else {
                        return;
                    };
                    let len = eol - cur;
                    cur += self.opt_flush(self.cur);
                    cur += len;
                    continue;
                }
            }
            cur += 1;
        }
    }

    /// Finish up once the producer closed its end.
    fn finalize_opt(&mut self) {
        self.done = true;
        self.optimize_pass();
        if self.cur < self.read_end {
            // Output without a trailing newline; keep the tail verbatim.
            self.cur = self.read_end;
            self.opt_commit();
        }
        self.opt_flush(self.cur);
    }

    /// Pull one block of raw preprocessor output, normalize it, and return
    /// the newly finalized suffix. An empty slice means end of input (the
    /// stream is finalized at that point). Interrupted reads are retried;
    /// real read errors abort the invocation.
    pub fn read(&mut self, src: &mut dyn Read) -> Result<&[u8]> {
        if self.flags & OPT_NORMALIZE != 0 {
            let old_optimized = self.optimized_end;
            loop {
                if self.buf.len() - self.read_end <= 1 {
                    self.grow();
                }
                let read_end = self.read_end;
                let n = retry_interrupted(|| src.read(&mut self.buf[read_end..]))
                    .wrap_err("reading preprocessor output")?;
                if n == 0 {
                    self.finalize_opt();
                    break;
                }
                self.read_end += n;
                self.optimize_pass();
                if self.optimized_end != old_optimized {
                    break;
                }
            }
            Ok(&self.buf[old_optimized..self.optimized_end])
        } else {
            if self.buf.len() - self.read_end <= 1 {
                self.grow();
            }
            let start = self.read_end;
            let n = retry_interrupted(|| src.read(&mut self.buf[start..]))
                .wrap_err("reading preprocessor output")?;
            self.read_end += n;
            if n == 0 {
                self.done = true;
            }
            Ok(&self.buf[start..self.read_end])
        }
    }

    /// Consume the reader and hand the finalized buffer to the caller.
    pub fn grab_output(mut self) -> Vec<u8> {
        let len = if self.flags & OPT_NORMALIZE != 0 {
            self.optimized_end
        } else {
            self.read_end
        };
        self.buf.truncate(len);
        self.buf
    }
}
