//! Harvests dependency filenames out of preprocessor output by watching the
//! `#line` directives go by, then writes a makefile-format depfile.
//!
//! The scanner is a byte-at-a-time state machine so it can be driven with
//! arbitrary splits of the stream: straight off the preprocessor pipe, or
//! from the CppReader's own directive parser via [`DepCollector::enter_file`]
//! when the optimizer is active (the optimizer consumes the directives, so
//! the raw-stream scanner would never see them).

use std::fs;
use std::path::Path;

use crate::prelude::*;

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Scanner position within a (potential) `#line` directive. The long form is
/// `# line N "FILE"`, the short form `# N "FILE"`; whitespace may interleave
/// everywhere, and the short form is only recognized when at least one blank
/// separated the `#` from the first digit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ScanState {
    SkipToNewLine,
    NeedHash,
    NeedLineL,
    NeedLineLHaveBlank,
    NeedLineI,
    NeedLineN,
    NeedLineE,
    NeedBlankBeforeDigit,
    NeedFirstDigit,
    NeedMoreDigits,
    NeedQuote,
    NeedEndQuote,
}

pub struct DepCollector {
    state: ScanState,
    /// Accumulates the still-escaped filename between the quotes; survives
    /// consume() calls that end mid-name.
    filename: Vec<u8>,
    /// Ingest order. Only deduplicated against the most recent entry here;
    /// full uniquification happens at write time.
    deps: Vec<String>,
}

/// How the orchestrator wants the depfile written.
#[derive(Clone, Debug)]
pub struct DepFileConfig {
    pub path: PathBuf,
    pub fix_case: bool,
    pub quiet: bool,
    pub gen_stubs: bool,
}

/// Unescape `\x` -> `x` in place-ish; a trailing lone backslash is kept.
fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        if b == b'\\' {
            match iter.next() {
                Some(&next) => out.push(next),
                None => out.push(b),
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Is the byte at `off` preceded by an odd number of backslashes?
fn is_escaped(bytes: &[u8], off: usize) -> bool {
    let mut count = 0;
    while count < off && bytes[off - 1 - count] == b'\\' {
        count += 1;
    }
    count % 2 == 1
}

impl DepCollector {
    pub fn new() -> DepCollector {
        DepCollector {
            state: ScanState::NeedHash,
            filename: Vec::new(),
            deps: Vec::new(),
        }
    }

    /// Record a filename the CppReader parsed out of a file-change directive.
    /// `escaped` is the raw text between the quotes.
    pub fn enter_file(&mut self, escaped: &[u8]) {
        let name = String::from_utf8_lossy(&unescape(escaped)).into_owned();
        if self.deps.last() != Some(&name) {
            self.deps.push(name);
        }
    }

    fn finish_filename(&mut self) {
        let escaped = std::mem::take(&mut self.filename);
        self.enter_file(&escaped);
    }

    /// Feed a chunk of raw preprocessor output. Chunks may be split
    /// anywhere, including inside a directive or a quoted filename.
    pub fn consume(&mut self, input: &[u8]) {
        use ScanState::*;

        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                SkipToNewLine => {
                    match input[pos..].iter().position(|&b| b == b'\n') {
                        Some(nl) => {
                            pos += nl + 1;
                            self.state = NeedHash;
                        }
                        None => return,
                    }
                }
                NeedHash => {
                    while pos < input.len() && is_blank(input[pos]) {
                        pos += 1;
                    }
                    if pos == input.len() {
                        return;
                    }
                    if input[pos] == b'#' {
                        pos += 1;
                        self.state = NeedLineL;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedLineL | NeedLineLHaveBlank => {
                    while pos < input.len() && is_blank(input[pos]) {
                        self.state = NeedLineLHaveBlank;
                        pos += 1;
                    }
                    if pos == input.len() {
                        return;
                    }
                    if input[pos] == b'l' {
                        pos += 1;
                        self.state = NeedLineI;
                    } else if self.state == NeedLineLHaveBlank
                        && input[pos].is_ascii_digit()
                    {
                        // short form: # N "FILE"
                        pos += 1;
                        self.state = NeedMoreDigits;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedLineI => {
                    if input[pos] == b'i' {
                        pos += 1;
                        self.state = NeedLineN;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedLineN => {
                    if input[pos] == b'n' {
                        pos += 1;
                        self.state = NeedLineE;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedLineE => {
                    if input[pos] == b'e' {
                        pos += 1;
                        self.state = NeedBlankBeforeDigit;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedBlankBeforeDigit => {
                    if is_blank(input[pos]) {
                        pos += 1;
                        self.state = NeedFirstDigit;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedFirstDigit => {
                    while pos < input.len() && is_blank(input[pos]) {
                        pos += 1;
                    }
                    if pos == input.len() {
                        return;
                    }
                    if input[pos].is_ascii_digit() {
                        pos += 1;
                        self.state = NeedMoreDigits;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedMoreDigits => {
                    while pos < input.len() && input[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    if pos == input.len() {
                        return;
                    }
                    self.state = NeedQuote;
                }
                NeedQuote => {
                    while pos < input.len() && is_blank(input[pos]) {
                        pos += 1;
                    }
                    if pos == input.len() {
                        return;
                    }
                    if input[pos] == b'"' {
                        pos += 1;
                        self.filename.clear();
                        self.state = NeedEndQuote;
                    } else {
                        self.state = SkipToNewLine;
                    }
                }
                NeedEndQuote => {
                    loop {
                        if pos == input.len() {
                            return;
                        }
                        let b = input[pos];
                        pos += 1;
                        if b == b'"' && !is_escaped(&self.filename, self.filename.len()) {
                            self.finish_filename();
                            self.state = SkipToNewLine;
                            break;
                        }
                        self.filename.push(b);
                    }
                }
            }
        }
    }

    /// The collected dependencies, uniquified in first-seen order with
    /// slashes normalized (and optionally the on-disk case restored).
    fn final_deps(&self, fix_case: bool, quiet: bool) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for dep in &self.deps {
            let mut dep = dep.replace('\\', "/");
            if fix_case {
                match fs::canonicalize(&dep) {
                    Ok(canon) => dep = canon.to_string_lossy().replace('\\', "/"),
                    Err(err) => {
                        if !quiet {
                            warn!("cannot fix case of '{dep}': {err}");
                        }
                    }
                }
            }
            if seen.insert(dep.clone()) {
                out.push(dep);
            }
        }
        out
    }

    /// Write the makefile-format dependency file: one logical rule
    /// `obj: dep…`, plus one empty stub rule per dependency when requested
    /// (the classic guard against deleted headers breaking the build).
    pub fn write_depfile(&self, cfg: &DepFileConfig, obj_path: &Path) -> Result<()> {
        let deps = self.final_deps(cfg.fix_case, cfg.quiet);
        let obj = obj_path.to_string_lossy().replace('\\', "/");

        // Size the buffer up front and emit in a single write.
        let mut size = obj.len() + 2;
        for dep in &deps {
            size += dep.len() + 1;
            if cfg.gen_stubs {
                size += dep.len() + 3;
            }
        }
        let mut out = String::with_capacity(size);

        out.push_str(&obj);
        out.push(':');
        for dep in &deps {
            out.push(' ');
            out.push_str(dep);
        }
        out.push('\n');

        if cfg.gen_stubs {
            for dep in &deps {
                out.push('\n');
                out.push_str(dep);
                out.push_str(":\n");
            }
        }

        fs::write(&cfg.path, out)
            .wrap_err_with(|| format!("failed to write dependency file {}", cfg.path.display()))
    }
}

impl Default for DepCollector {
    fn default() -> Self {
        DepCollector::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    fn collect(input: &[u8]) -> Vec<String> {
        let mut dc = DepCollector::new();
        dc.consume(input);
        dc.final_deps(false, true)
    }

    #[test]
    fn test_long_and_short_forms() {
        let input = indoc! {br#"
            # 1 "hello.c"
            #line 12 "include/config.h"
            int x;
            #  line  99  "other.h"
            # 3 "hello.c"
        "#};
        assert_eq!(
            collect(input),
            vec!["hello.c", "include/config.h", "other.h"]
        );
    }

    #[test]
    fn test_short_form_requires_blank() {
        // "#1" without a separating blank is not a line directive.
        assert!(collect(b"#1 \"nope.h\"\n").is_empty());
        assert_eq!(collect(b"# 1 \"yes.h\"\n"), vec!["yes.h"]);
    }

    #[test]
    fn test_arbitrary_chunking() {
        let input = b"# 1 \"a.c\"\nx\n#line 2 \"dir\\\\b.h\"\ny\n";
        for split in 0..input.len() {
            let mut dc = DepCollector::new();
            dc.consume(&input[..split]);
            dc.consume(&input[split..]);
            assert_eq!(
                dc.final_deps(false, true),
                vec!["a.c", "dir/b.h"],
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_escaped_quote_inside_filename() {
        // \" does not end the name; \\" does.
        assert_eq!(collect(b"# 1 \"we\\\"ird.h\"\n"), vec!["we\"ird.h"]);
        let got = collect(b"# 1 \"trail\\\\\" ignored\n");
        assert_eq!(got, vec!["trail/"]); // the unescaped '\' is normalized to '/'
    }

    #[test]
    fn test_dedup_and_uniquify() {
        let input = indoc! {br#"
            # 1 "main.c"
            # 1 "main.c"
            # 2 "a.h"
            # 5 "main.c"
            # 9 "a.h"
        "#};
        let mut dc = DepCollector::new();
        dc.consume(input);
        // ingest-time dedup only collapses the immediate repeat
        assert_eq!(dc.deps, vec!["main.c", "a.h", "main.c", "a.h"]);
        // write-time uniquification produces the set
        assert_eq!(dc.final_deps(false, true), vec!["main.c", "a.h"]);
    }

    #[test]
    fn test_malformed_directives_ignored() {
        let input = indoc! {br#"
            #lime 3 "nope.h"
            #line x "nope.h"
            #line 3 nope.h
            # line 4 "ok.h"
        "#};
        assert_eq!(collect(input), vec!["ok.h"]);
    }

    #[test]
    fn test_depfile_output() {
        let dir = tempfile::tempdir().unwrap();
        let dep_path = dir.path().join("hello.d");

        let mut dc = DepCollector::new();
        dc.consume(b"# 1 \"hello.c\"\n# 1 \"hdr\\\\sub.h\"\n");

        let cfg = DepFileConfig {
            path: dep_path.clone(),
            fix_case: false,
            quiet: true,
            gen_stubs: true,
        };
        dc.write_depfile(&cfg, Path::new("out/hello.o")).unwrap();

        let text = fs::read_to_string(&dep_path).unwrap();
        assert_eq!(
            text,
            "out/hello.o: hello.c hdr/sub.h\n\nhello.c:\n\nhdr/sub.h:\n"
        );
    }
}
