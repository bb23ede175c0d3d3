//! The per-translation-unit cache entry.
//!
//! One entry file records what was compiled last time: the compiler argv
//! (and its output-name-independent signature), the chain of preprocessor
//! digests known to produce the cached object, where the object and the
//! preprocessor output live, and timings. The entry carries two snapshots,
//! the one read from disk (`old`) and the one this invocation is producing
//! (`new`); whatever the new one filled in wins when writing back.

use std::fs::{self, File};
use std::io::BufReader;

use crate::compare::outputs_equivalent;
use crate::cpp_reader::{CppReader, OPT_DIGEST_ONLY, OPT_NORMALIZE};
use crate::deps::{DepCollector, DepFileConfig};
use crate::prelude::*;
use crate::spawn;
use crate::util::{path_ends_with, MsTimer};

const ENTRY_MAGIC: &str = "kObjCacheEntry-v0.1.1";
const ENTRY_MAGIC_V0_1_0: &str = "kObjCacheEntry-v0.1.0";

/// Longest line the on-disk format tolerates; enforced when writing.
const MAX_LINE_LEN: usize = 16384;

/// One side of the entry: either what the file said, or what this
/// invocation produced.
#[derive(Default)]
pub struct EntrySnapshot {
    /// Preprocessor output filename, relative to the entry's directory.
    pub cpp_name: Option<String>,
    /// In-memory preprocessor output, when this invocation has it.
    pub cpp_data: Option<Vec<u8>>,
    pub cpp_size: u64,
    pub cpp_ms: u32,
    /// Digests of preprocessor outputs known to produce the object.
    pub sums: DigestChain,
    /// Object filename, relative to the entry's directory.
    pub obj_name: Option<String>,
    pub argv: Vec<String>,
    pub argv_sum: Option<Digest>,
    pub cc_ms: u32,
    pub target: Option<String>,
}

pub struct CacheEntry {
    /// Directory all relative names resolve against.
    dir: PathBuf,
    abs_path: PathBuf,
    key: u32,
    needs_compile: bool,
    piped_cpp: bool,
    piped_cc: bool,
    named_pipe: Option<String>,
    depfile: Option<DepFileConfig>,
    dep_state: DepCollector,
    optimize: u8,
    old: EntrySnapshot,
    new: EntrySnapshot,
}

/// Digest the argv with every entry NUL-terminated, skipping entries whose
/// trailing path equals the object or preprocessor output name. That makes
/// the signature independent of output paths, so sibling translation units
/// with identical flags produce the same signature.
pub(crate) fn argv_signature(argv: &[String], obj: &str, cpp: Option<&str>) -> Digest {
    let mut hasher = DigestHasher::new();
    for arg in argv {
        if path_ends_with(arg, obj) || cpp.map_or(false, |c| path_ends_with(arg, c)) {
            continue;
        }
        hasher.update(arg.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<()> {
    if slot.is_some() {
        bail!("duplicate key '{key}'");
    }
    *slot = Some(value);
    Ok(())
}

impl CacheEntry {
    pub fn create(path: &Path) -> Result<CacheEntry> {
        let abs_path = absolutize(path)?;
        if abs_path.is_dir() {
            bail!("entry file {} is a directory", abs_path.display());
        }
        let dir = abs_path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or_else(|| eyre!("cannot determine directory of {}", abs_path.display()))?
            .to_path_buf();
        Ok(CacheEntry {
            dir,
            abs_path,
            key: 0,
            needs_compile: false,
            piped_cpp: false,
            piped_cc: false,
            named_pipe: None,
            depfile: None,
            dep_state: DepCollector::new(),
            optimize: 0,
            old: EntrySnapshot::default(),
            new: EntrySnapshot::default(),
        })
    }

    pub fn abs_path(&self) -> &Path {
        &self.abs_path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn set_key(&mut self, key: u32) {
        self.key = key;
    }

    pub fn needs_compile(&self) -> bool {
        self.needs_compile
    }

    pub fn current_target(&self) -> Option<&str> {
        self.new.target.as_deref().or(self.old.target.as_deref())
    }

    pub fn current_obj_name(&self) -> Option<&str> {
        self.new.obj_name.as_deref().or(self.old.obj_name.as_deref())
    }

    pub fn current_argv_sum(&self) -> Option<&Digest> {
        self.new.argv_sum.as_ref().or(self.old.argv_sum.as_ref())
    }

    pub fn current_sums(&self) -> &DigestChain {
        if !self.new.sums.is_empty() {
            &self.new.sums
        } else {
            &self.old.sums
        }
    }

    /// Read and validate the entry file. Any failure just means the object
    /// must be (re)compiled.
    pub fn read(&mut self) {
        if let Err(err) = self.try_read() {
            debug!("stale cache entry {}: {err}", self.abs_path.display());
            self.old = EntrySnapshot::default();
            self.key = 0;
            self.needs_compile = true;
        }
    }

    fn try_read(&mut self) -> Result<()> {
        let file = File::open(&self.abs_path).wrap_err("no cache entry file")?;
        let mut lines = BufReader::new(file).lines();

        let magic = lines.next().ok_or_else(|| eyre!("empty file"))??;
        let magic_val = magic.strip_prefix("magic=").ok_or_else(|| eyre!("bad magic"))?;
        if magic_val != ENTRY_MAGIC && magic_val != ENTRY_MAGIC_V0_1_0 {
            bail!("bad magic '{magic_val}'");
        }

        let mut old = EntrySnapshot::default();
        let mut key: Option<u32> = None;
        let mut cpp_size: Option<u64> = None;
        let mut cpp_ms: Option<u32> = None;
        let mut cc_ms: Option<u32> = None;
        let mut argv: Option<Vec<Option<String>>> = None;
        let mut the_end = false;

        for line in lines {
            let line = line.wrap_err("read error")?;
            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| eyre!("malformed line {line:?}"))?;
            match k {
                "obj" => set_once(&mut old.obj_name, v.to_owned(), k)?,
                "cpp" => set_once(&mut old.cpp_name, v.to_owned(), k)?,
                "cpp-size" => set_once(&mut cpp_size, v.parse().wrap_err("bad cpp-size")?, k)?,
                "cpp-ms" => set_once(&mut cpp_ms, v.parse().wrap_err("bad cpp-ms")?, k)?,
                "cc-ms" => set_once(&mut cc_ms, v.parse().wrap_err("bad cc-ms")?, k)?,
                "key" => set_once(&mut key, v.parse().wrap_err("bad key")?, k)?,
                "target" => set_once(&mut old.target, v.to_owned(), k)?,
                "cpp-sum" => old.sums.add(v.parse()?),
                "cc-argv-sum" => set_once(&mut old.argv_sum, v.parse()?, k)?,
                "cc-argc" => {
                    if argv.is_some() {
                        bail!("duplicate key 'cc-argc'");
                    }
                    let argc: usize = v.parse().wrap_err("bad cc-argc")?;
                    argv = Some(vec![None; argc]);
                }
                "the-end" => {
                    if v != "fine" {
                        bail!("bad the-end sentinel");
                    }
                    the_end = true;
                    break;
                }
                _ => {
                    if let Some(idx) = k.strip_prefix("cc-argv-#") {
                        let idx: usize = idx.parse().wrap_err("bad cc-argv index")?;
                        let argv = argv.as_mut().ok_or_else(|| eyre!("cc-argv before cc-argc"))?;
                        let slot = argv
                            .get_mut(idx)
                            .ok_or_else(|| eyre!("cc-argv-#{idx} out of range"))?;
                        set_once(slot, v.to_owned(), k)?;
                    } else {
                        bail!("unknown key '{k}'");
                    }
                }
            }
        }

        if !the_end {
            bail!("missing the-end sentinel");
        }

        old.argv = argv
            .ok_or_else(|| eyre!("missing cc-argc"))?
            .into_iter()
            .enumerate()
            .map(|(i, a)| a.ok_or_else(|| eyre!("missing cc-argv-#{i}")))
            .collect::<Result<Vec<_>>>()?;
        old.cpp_size = cpp_size.ok_or_else(|| eyre!("missing cpp-size"))?;
        old.cpp_ms = cpp_ms.ok_or_else(|| eyre!("missing cpp-ms"))?;
        old.cc_ms = cc_ms.ok_or_else(|| eyre!("missing cc-ms"))?;
        let key = key.ok_or_else(|| eyre!("missing key"))?;

        let obj_name = old.obj_name.as_deref().ok_or_else(|| eyre!("missing obj"))?;
        let cpp_name = old.cpp_name.as_deref().ok_or_else(|| eyre!("missing cpp"))?;
        if old.target.is_none() {
            bail!("missing target");
        }
        if old.sums.is_empty() {
            bail!("missing cpp-sum");
        }

        let computed = argv_signature(&old.argv, obj_name, Some(cpp_name));
        if old.argv_sum != Some(computed) {
            bail!("cc-argv-sum does not match the argument vector");
        }

        if !self.dir.join(obj_name).exists() {
            bail!("object file '{obj_name}' does not exist");
        }

        self.old = old;
        self.key = key;
        Ok(())
    }

    /// Relative to the entry directory when under it, absolute otherwise.
    fn relative_name(&self, path: &Path) -> Result<String> {
        let abs = absolutize(path)?;
        let rel = abs.strip_prefix(&self.dir).unwrap_or(&abs);
        Ok(rel.to_string_lossy().into_owned())
    }

    pub fn set_cpp_name(&mut self, path: &Path) -> Result<()> {
        debug_assert!(self.new.cpp_name.is_none());
        let name = self.relative_name(path)?;

        if !self.needs_compile && self.old.cpp_name.as_deref() != Some(name.as_str()) {
            debug!("cpp output name differs");
            self.needs_compile = true;
        }

        self.new.cpp_name = Some(name);
        Ok(())
    }

    pub fn set_obj_name(&mut self, path: &Path) -> Result<()> {
        debug_assert!(self.new.obj_name.is_none());
        let name = self.relative_name(path)?;

        if !self.needs_compile && self.old.obj_name.as_deref() != Some(name.as_str()) {
            debug!("object file name differs");
            self.needs_compile = true;
        }
        if !self.needs_compile && !self.dir.join(&name).exists() {
            debug!("object file doesn't exist");
            self.needs_compile = true;
        }

        self.new.obj_name = Some(name);
        Ok(())
    }

    /// Must run after `set_cpp_name` and `set_obj_name`; the signature
    /// scrubs both names out of the argv.
    pub fn set_argv(&mut self, argv: &[String]) {
        debug_assert!(self.new.argv.is_empty());
        let obj = self.new.obj_name.as_deref().expect("obj name set first");
        let cpp = self.new.cpp_name.as_deref();

        let sum = argv_signature(argv, obj, cpp);
        trace!("comp-argv: {sum}");

        if !self.needs_compile && self.old.argv_sum != Some(sum) {
            debug!("compiler args differ");
            self.needs_compile = true;
        }

        self.new.argv = argv.to_vec();
        self.new.argv_sum = Some(sum);
    }

    pub fn set_target(&mut self, target: &str) {
        debug_assert!(self.new.target.is_none());
        if !self.needs_compile && self.old.target.as_deref() != Some(target) {
            debug!("target differs");
            self.needs_compile = true;
        }
        self.new.target = Some(target.to_owned());
    }

    pub fn set_piped_mode(&mut self, piped_cpp: bool, piped_cc: bool, named_pipe: Option<String>) {
        self.piped_cpp = piped_cpp;
        self.piped_cc = piped_cc || named_pipe.is_some();
        self.named_pipe = named_pipe;
    }

    pub fn set_depfile(&mut self, depfile: Option<DepFileConfig>) {
        self.depfile = depfile;
    }

    pub fn set_optimizations(&mut self, flags: u8) {
        self.optimize = flags;
    }

    /// Record a complete preprocessor output: size, digest, data, plus the
    /// dependency scan when the reader didn't already do it.
    pub(crate) fn take_cpp_output(&mut self, data: Vec<u8>, already_scanned: bool) {
        if self.depfile.is_some() && !already_scanned {
            self.dep_state.consume(&data);
        }
        let digest = Digest::of_bytes(&data);
        trace!("cpp: {digest}");
        self.new.cpp_size = data.len() as u64;
        self.new.cpp_data = Some(data);
        self.new.sums = DigestChain::new();
        self.new.sums.add(digest);
    }

    /// Drive the CppReader over the preprocessor stream: digest it, collect
    /// dependencies, optionally forward every block to `sink` (the compiler)
    /// on the way through.
    fn pump_cpp(&mut self, src: &mut dyn Read, mut sink: Option<&mut dyn Write>) -> Result<()> {
        let prev_size = self.old.cpp_size as usize;
        let mut hasher = DigestHasher::new();

        let data = if self.optimize & OPT_NORMALIZE != 0 {
            // The optimizer eats the #line directives, so it must drive the
            // dependency collector itself.
            let dep = if self.depfile.is_some() {
                Some(&mut self.dep_state)
            } else {
                None
            };
            let mut reader = CppReader::new(prev_size, self.optimize, dep);
            loop {
                let block = reader.read(src)?;
                if block.is_empty() {
                    break;
                }
                hasher.update(block);
                if let Some(sink) = sink.as_deref_mut() {
                    sink.write_all(block).wrap_err("feeding the compiler")?;
                }
            }
            reader.grab_output()
        } else {
            let mut reader = CppReader::new(prev_size, 0, None);
            let want_deps = self.depfile.is_some();
            loop {
                let block = reader.read(src)?;
                if block.is_empty() {
                    break;
                }
                hasher.update(block);
                if want_deps {
                    self.dep_state.consume(block);
                }
                if let Some(sink) = sink.as_deref_mut() {
                    sink.write_all(block).wrap_err("feeding the compiler")?;
                }
            }
            reader.grab_output()
        };

        let digest = hasher.finalize();
        trace!("cpp: {digest}");
        self.new.cpp_size = data.len() as u64;
        self.new.cpp_data = Some(data);
        self.new.sums = DigestChain::new();
        self.new.sums.add(digest);
        Ok(())
    }

    fn write_depfile(&self) -> Result<()> {
        if let Some(cfg) = &self.depfile {
            let obj = self.new.obj_name.as_deref().expect("obj name set");
            self.dep_state.write_depfile(cfg, &self.dir.join(obj))?;
        }
        Ok(())
    }

    /// Run the preprocessor and digest its output.
    pub fn preprocess(&mut self, cpp_argv: &[String]) -> Result<()> {
        if self.piped_cpp {
            let timer = MsTimer::start();
            let (mut child, mut stdout) = spawn::spawn_producer(cpp_argv, "preprocess")?;
            self.pump_cpp(&mut stdout, None)?;
            drop(stdout);
            spawn::wait(&mut child, "preprocess")?;
            self.new.cpp_ms = timer.elapsed_ms();
        } else {
            // The preprocessor writes its own output file; move the previous
            // one aside so it isn't clobbered before we can compare.
            if let Some(old_cpp) = self.old.cpp_name.clone() {
                if self.dir.join(&old_cpp).exists() {
                    let renamed = format!("{old_cpp}-old");
                    debug!("renaming '{old_cpp}' to '{renamed}'");
                    let _ = fs::remove_file(self.dir.join(&renamed));
                    fs::rename(self.dir.join(&old_cpp), self.dir.join(&renamed))
                        .wrap_err_with(|| format!("failed to rename '{old_cpp}'"))?;
                    self.old.cpp_name = Some(renamed);
                }
            }

            let cpp_name = self.new.cpp_name.clone().expect("cpp name set");
            debug!("preprocessing -> '{cpp_name}'...");
            let timer = MsTimer::start();
            spawn::run(cpp_argv, None, "preprocess")?;
            self.new.cpp_ms = timer.elapsed_ms();

            let data = fs::read(self.dir.join(&cpp_name))
                .wrap_err_with(|| format!("failed to read preprocessor output '{cpp_name}'"))?;
            self.take_cpp_output(data, false);
        }

        self.write_depfile()
    }

    /// Put the (possibly normalized) preprocessor output where the entry
    /// says it lives, replacing older copies.
    fn write_cpp_output(&mut self) -> Result<()> {
        if let Some(old_cpp) = &self.old.cpp_name {
            let _ = fs::remove_file(self.dir.join(old_cpp));
        }
        let Some(cpp_name) = &self.new.cpp_name else {
            return Ok(());
        };
        let path = self.dir.join(cpp_name);
        let _ = fs::remove_file(&path);
        let data = self.new.cpp_data.as_deref().expect("cpp output present");
        if let Err(err) = fs::write(&path, data) {
            let _ = fs::remove_file(&path);
            return Err(err).wrap_err_with(|| format!("error writing '{cpp_name}'"));
        }
        Ok(())
    }

    /// Compile for real. The object files are removed first so a failed
    /// compile can never leave a stale object that the entry still points
    /// at.
    pub fn compile(&mut self) -> Result<()> {
        if let Some(obj) = &self.old.obj_name {
            let _ = fs::remove_file(self.dir.join(obj));
        }
        let obj = self.new.obj_name.clone().expect("obj name set");
        let _ = fs::remove_file(self.dir.join(&obj));
        self.old.cpp_data = None;

        if self.piped_cc {
            if self.new.cpp_data.is_none() {
                let cpp_name = self.new.cpp_name.clone().expect("cpp name set");
                let data = fs::read(self.dir.join(&cpp_name))
                    .wrap_err_with(|| format!("failed to read '{cpp_name}'"))?;
                self.take_cpp_output(data, true);
            }
            debug!("compiling -> '{obj}'...");
            let timer = MsTimer::start();
            let (mut child, mut feed) =
                spawn::spawn_consumer(&self.new.argv, self.named_pipe.as_deref(), "compile")?;
            feed.write_all(self.new.cpp_data.as_deref().expect("cpp output present"))
                .wrap_err("feeding the compiler")?;
            drop(feed);
            // Write the normalized output to disk while the compiler chews.
            if self.piped_cpp {
                self.write_cpp_output()?;
            }
            spawn::wait(&mut child, "compile")?;
            self.new.cc_ms = timer.elapsed_ms();
        } else {
            if self.piped_cpp {
                self.write_cpp_output()?;
            }
            debug!("compiling -> '{obj}'...");
            let timer = MsTimer::start();
            spawn::run(&self.new.argv, None, "compile")?;
            self.new.cc_ms = timer.elapsed_ms();
        }
        Ok(())
    }

    /// The fused clean-build path: preprocessor -> reader -> compiler as one
    /// tee pipeline, with the digest and the on-disk copy updated on the
    /// way. Falls back to the sequential pair when either end isn't piped.
    pub fn preprocess_and_compile(&mut self, cpp_argv: &[String]) -> Result<()> {
        if self.piped_cpp && self.piped_cc {
            for name in [
                self.old.obj_name.as_ref(),
                self.new.obj_name.as_ref(),
                self.old.cpp_name.as_ref(),
                self.new.cpp_name.as_ref(),
            ]
            .into_iter()
            .flatten()
            {
                let _ = fs::remove_file(self.dir.join(name));
            }

            trace!("preprocess|compile - starting passthru...");
            let cpp_timer = MsTimer::start();
            let (mut producer, mut stdout) = spawn::spawn_producer(cpp_argv, "preprocess")?;
            let cc_timer = MsTimer::start();
            let (mut consumer, mut feed) =
                spawn::spawn_consumer(&self.new.argv, self.named_pipe.as_deref(), "compile")?;

            self.pump_cpp(&mut stdout, Some(&mut feed as &mut dyn Write))?;
            drop(feed);
            drop(stdout);
            trace!("preprocess|compile - done passthru");

            self.write_cpp_output()?;

            spawn::wait(&mut producer, "preprocess")?;
            self.new.cpp_ms = cpp_timer.elapsed_ms();
            spawn::wait(&mut consumer, "compile")?;
            self.new.cc_ms = cc_timer.elapsed_ms();

            self.write_depfile()
        } else {
            self.preprocess(cpp_argv)?;
            self.compile()
        }
    }

    /// Decide whether the compiler has to run: digest chain first, then the
    /// byte-level comparison (unless digest-only mode), learning the new
    /// digest into the chain when the outputs prove equivalent.
    pub fn calc_recompile(&mut self) {
        if self.needs_compile {
            return;
        }

        let Some(new_sum) = self.new.sums.first().copied() else {
            self.needs_compile = true;
            return;
        };

        if !self.old.sums.contains(&new_sum) {
            if self.optimize & OPT_DIGEST_ONLY != 0 {
                debug!("no digest match - not comparing output in digest-only mode");
                self.needs_compile = true;
            } else {
                debug!("no digest match - comparing output");
                if self.compare_old_and_new_output() {
                    self.new.sums.merge(&self.old.sums);
                } else {
                    self.needs_compile = true;
                }
            }
        }

        if !self.needs_compile {
            // A hit leaves the previous compile time in place.
            self.new.cc_ms = self.old.cc_ms;
        }
    }

    /// Load the previous preprocessor output and compare; failure to load
    /// just means "different".
    fn compare_old_and_new_output(&mut self) -> bool {
        let Some(old_name) = self.old.cpp_name.clone() else {
            return false;
        };
        let old_data = match fs::read(self.dir.join(&old_name)) {
            Ok(data) => data,
            Err(err) => {
                debug!("failed to read '{old_name}': {err}");
                return false;
            }
        };
        let new_data = self.new.cpp_data.as_deref().expect("preprocess ran");
        let equivalent = outputs_equivalent(new_data, &old_data);
        self.old.cpp_size = old_data.len() as u64;
        self.old.cpp_data = Some(old_data);
        equivalent
    }

    /// Take the object file from a sibling entry: hard link if the
    /// filesystem allows it, plain copy otherwise.
    pub fn copy_obj_from(&mut self, from: &CacheEntry) -> Result<()> {
        let src = from
            .dir
            .join(from.current_obj_name().ok_or_else(|| eyre!("source entry has no object"))?);
        let dst = self.dir.join(self.new.obj_name.as_deref().expect("obj name set"));

        let _ = fs::remove_file(&dst);
        if fs::hard_link(&src, &dst).is_err() {
            fs::copy(&src, &dst).wrap_err_with(|| {
                format!("failed to copy '{}' to '{}'", src.display(), dst.display())
            })?;
        }
        Ok(())
    }

    /// Rewrite the entry file. A half-written entry file would look newer
    /// than the object and still validate, so any write error unlinks it.
    pub fn write(&self) -> Result<()> {
        debug!("writing cache entry '{}'...", self.abs_path.display());
        match self.render() {
            Ok(text) => {
                if let Err(err) = fs::write(&self.abs_path, text) {
                    let _ = fs::remove_file(&self.abs_path);
                    return Err(err)
                        .wrap_err_with(|| format!("error writing '{}'", self.abs_path.display()));
                }
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&self.abs_path);
                Err(err)
            }
        }
    }

    fn render(&self) -> Result<String> {
        let mut out = String::new();
        let mut push = |line: String, out: &mut String| -> Result<()> {
            if line.len() >= MAX_LINE_LEN {
                bail!("line too long: {} (max {MAX_LINE_LEN})", line.len());
            }
            out.push_str(&line);
            out.push('\n');
            Ok(())
        };

        push(format!("magic={ENTRY_MAGIC}"), &mut out)?;
        push(
            format!("target={}", self.current_target().ok_or_else(|| eyre!("no target"))?),
            &mut out,
        )?;
        push(format!("key={}", self.key), &mut out)?;
        push(
            format!("obj={}", self.current_obj_name().ok_or_else(|| eyre!("no object name"))?),
            &mut out,
        )?;

        // cpp name/size/timing travel together: whichever snapshot produced
        // the preprocessor output owns all three.
        let (cpp_name, cpp_size, cpp_ms, cc_ms) = match self.new.cpp_name.as_deref() {
            Some(name) => (name, self.new.cpp_size, self.new.cpp_ms, self.new.cc_ms),
            None => (
                self.old.cpp_name.as_deref().ok_or_else(|| eyre!("no cpp name"))?,
                self.old.cpp_size,
                self.old.cpp_ms,
                self.old.cc_ms,
            ),
        };
        push(format!("cpp={cpp_name}"), &mut out)?;
        push(format!("cpp-size={cpp_size}"), &mut out)?;
        push(format!("cpp-ms={cpp_ms}"), &mut out)?;
        push(format!("cc-ms={cc_ms}"), &mut out)?;

        let (argv, argv_sum) = if self.new.argv_sum.is_some() {
            (&self.new.argv, self.new.argv_sum.as_ref())
        } else {
            (&self.old.argv, self.old.argv_sum.as_ref())
        };
        push(format!("cc-argc={}", argv.len()), &mut out)?;
        for (i, arg) in argv.iter().enumerate() {
            push(format!("cc-argv-#{i}={arg}"), &mut out)?;
        }
        push(
            format!("cc-argv-sum={}", argv_sum.ok_or_else(|| eyre!("no argv signature"))?),
            &mut out,
        )?;

        for sum in self.current_sums().iter() {
            push(format!("cpp-sum={sum}"), &mut out)?;
        }

        push("the-end=fine".to_owned(), &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    /// An entry populated the way an invocation would, with a fake object
    /// file on disk so validation passes.
    fn populated_entry(dir: &Path) -> CacheEntry {
        let mut entry = CacheEntry::create(&dir.join("hello.koc")).unwrap();
        entry.read();
        assert!(entry.needs_compile());

        fs::write(dir.join("hello.o"), b"\x7fELF fake object").unwrap();

        entry.set_cpp_name(&dir.join("hello.i")).unwrap();
        entry.set_obj_name(&dir.join("hello.o")).unwrap();
        entry.set_argv(&argv(&["cc", "-c", "-O2", "hello.o"]));
        entry.set_target("x86_64-linux");
        entry.take_cpp_output(b"int main(void) { return 0; }\n".to_vec(), true);
        entry.key = 42;
        entry
    }

    #[test]
    fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = populated_entry(tmp.path());
        entry.write().unwrap();

        let mut reread = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        reread.read();
        assert!(!reread.needs_compile());
        assert_eq!(reread.key(), 42);
        assert_eq!(reread.current_target(), Some("x86_64-linux"));
        assert_eq!(reread.current_obj_name(), Some("hello.o"));
        assert_eq!(reread.old.argv, argv(&["cc", "-c", "-O2", "hello.o"]));
        assert_eq!(reread.old.cpp_size, 29);
        assert!(reread
            .current_sums()
            .contains(&Digest::of_bytes(b"int main(void) { return 0; }\n")));
    }

    #[test]
    fn test_setters_detect_changes() {
        let tmp = tempfile::tempdir().unwrap();
        populated_entry(tmp.path()).write().unwrap();

        // identical setup: still valid
        let mut same = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        same.read();
        same.set_cpp_name(&tmp.path().join("hello.i")).unwrap();
        same.set_obj_name(&tmp.path().join("hello.o")).unwrap();
        same.set_argv(&argv(&["cc", "-c", "-O2", "hello.o"]));
        same.set_target("x86_64-linux");
        assert!(!same.needs_compile());

        // changed compiler flags: must recompile
        let mut changed = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        changed.read();
        changed.set_cpp_name(&tmp.path().join("hello.i")).unwrap();
        changed.set_obj_name(&tmp.path().join("hello.o")).unwrap();
        changed.set_argv(&argv(&["cc", "-c", "-O0", "hello.o"]));
        assert!(changed.needs_compile());

        // relocated preprocessor output: must recompile
        let mut moved = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        moved.read();
        moved.set_cpp_name(&tmp.path().join("elsewhere").join("hello.i")).unwrap();
        assert!(moved.needs_compile());

        // changed target: must recompile
        let mut retarget = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        retarget.read();
        retarget.set_cpp_name(&tmp.path().join("hello.i")).unwrap();
        retarget.set_obj_name(&tmp.path().join("hello.o")).unwrap();
        retarget.set_argv(&argv(&["cc", "-c", "-O2", "hello.o"]));
        retarget.set_target("arm64-darwin");
        assert!(retarget.needs_compile());
    }

    #[test]
    fn test_validation_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let entry_path = tmp.path().join("hello.koc");
        populated_entry(tmp.path()).write().unwrap();

        let good = fs::read_to_string(&entry_path).unwrap();

        let reread = |contents: &str| {
            fs::write(&entry_path, contents).unwrap();
            let mut e = CacheEntry::create(&entry_path).unwrap();
            e.read();
            e.needs_compile()
        };

        // pristine file parses
        assert!(!reread(&good));

        // bad magic
        assert!(reread(&good.replace("kObjCacheEntry-v0.1.1", "kObjCacheEntry-v9.9.9")));

        // missing sentinel
        assert!(reread(good.strip_suffix("the-end=fine\n").unwrap()));

        // unknown key
        assert!(reread(&format!("{good}extra=stuff\nthe-end=fine\n")
            .replace("the-end=fine\nextra", "extra")));

        // tampered argv breaks the signature
        assert!(reread(&good.replace("cc-argv-#2=-O2", "cc-argv-#2=-O3")));

        // object file gone
        fs::write(&entry_path, &good).unwrap();
        fs::remove_file(tmp.path().join("hello.o")).unwrap();
        let mut e = CacheEntry::create(&entry_path).unwrap();
        e.read();
        assert!(e.needs_compile());
    }

    #[test]
    fn test_accepts_v0_1_0_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let entry_path = tmp.path().join("hello.koc");
        populated_entry(tmp.path()).write().unwrap();

        let text = fs::read_to_string(&entry_path)
            .unwrap()
            .replace("kObjCacheEntry-v0.1.1", "kObjCacheEntry-v0.1.0");
        fs::write(&entry_path, text).unwrap();

        let mut e = CacheEntry::create(&entry_path).unwrap();
        e.read();
        assert!(!e.needs_compile());
    }

    #[test]
    fn test_argv_signature_ignores_output_paths() {
        let base = ["cc", "-c", "-g", "-O2"];

        let sig = |obj: &str, cpp: &str| {
            let mut full: Vec<String> = base.iter().map(|s| s.to_string()).collect();
            full.push("-o".into());
            full.push(obj.into());
            full.push(cpp.into());
            argv_signature(&full, obj, Some(cpp))
        };

        let a = sig("/t/a.o", "/t/a.i");
        let b = sig("/t/b.o", "/t/b.i");
        assert_eq!(a, b);

        // option-glued output names are scrubbed too
        let mut glued: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        glued.push("-Fo/t/c.o".into());
        assert_eq!(argv_signature(&glued, "/t/c.o", None), a);

        // a real flag change shows
        let mut other: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        other.push("-DNDEBUG".into());
        assert_ne!(argv_signature(&other, "/t/a.o", Some("/t/a.i")), a);
    }

    #[test]
    fn test_calc_recompile_learns_equivalent_output() {
        let tmp = tempfile::tempdir().unwrap();

        // Previous run: entry + cpp output on disk.
        let mut first = populated_entry(tmp.path());
        first.take_cpp_output(b"int x;\nint y;\n".to_vec(), true);
        fs::write(tmp.path().join("hello.i"), b"int x;\nint y;\n").unwrap();
        first.write().unwrap();

        // Next run: same flags, whitespace-only difference in the output.
        let mut next = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        next.read();
        next.set_cpp_name(&tmp.path().join("hello.i")).unwrap();
        next.set_obj_name(&tmp.path().join("hello.o")).unwrap();
        next.set_argv(&argv(&["cc", "-c", "-O2", "hello.o"]));
        next.set_target("x86_64-linux");
        assert!(!next.needs_compile());

        next.take_cpp_output(b"int x;\n\n\nint y;\n".to_vec(), true);
        next.calc_recompile();
        assert!(!next.needs_compile());
        // the new digest was learned into the chain
        assert_eq!(next.current_sums().len(), 2);
        assert!(next
            .current_sums()
            .contains(&Digest::of_bytes(b"int x;\n\n\nint y;\n")));
        assert!(next
            .current_sums()
            .contains(&Digest::of_bytes(b"int x;\nint y;\n")));

        // A real change forces the compile.
        let mut real = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        real.read();
        real.set_cpp_name(&tmp.path().join("hello.i")).unwrap();
        real.set_obj_name(&tmp.path().join("hello.o")).unwrap();
        real.set_argv(&argv(&["cc", "-c", "-O2", "hello.o"]));
        real.set_target("x86_64-linux");
        real.take_cpp_output(b"int x;\nlong y;\n".to_vec(), true);
        real.calc_recompile();
        assert!(real.needs_compile());
    }

    #[test]
    fn test_calc_recompile_digest_only_skips_compare() {
        let tmp = tempfile::tempdir().unwrap();
        let mut first = populated_entry(tmp.path());
        first.take_cpp_output(b"int x;\n".to_vec(), true);
        fs::write(tmp.path().join("hello.i"), b"int x;\n").unwrap();
        first.write().unwrap();

        let mut next = CacheEntry::create(&tmp.path().join("hello.koc")).unwrap();
        next.read();
        next.set_cpp_name(&tmp.path().join("hello.i")).unwrap();
        next.set_obj_name(&tmp.path().join("hello.o")).unwrap();
        next.set_argv(&argv(&["cc", "-c", "-O2", "hello.o"]));
        next.set_target("x86_64-linux");
        next.set_optimizations(OPT_NORMALIZE | OPT_DIGEST_ONLY);
        // equivalent but not identical output: digest-only mode recompiles
        next.take_cpp_output(b"int x;\n\n".to_vec(), true);
        next.calc_recompile();
        assert!(next.needs_compile());
    }

    #[test]
    fn test_copy_obj_prefers_hard_link() {
        let tmp = tempfile::tempdir().unwrap();
        let src_entry = populated_entry(tmp.path());

        let dst_dir = tempfile::tempdir_in(tmp.path()).unwrap();
        fs::write(dst_dir.path().join("other.o"), b"stale").unwrap();
        let mut dst = CacheEntry::create(&dst_dir.path().join("other.koc")).unwrap();
        dst.read();
        dst.set_cpp_name(&dst_dir.path().join("other.i")).unwrap();
        dst.set_obj_name(&dst_dir.path().join("other.o")).unwrap();

        dst.copy_obj_from(&src_entry).unwrap();
        assert_eq!(
            fs::read(dst_dir.path().join("other.o")).unwrap(),
            fs::read(tmp.path().join("hello.o")).unwrap()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let a = fs::metadata(tmp.path().join("hello.o")).unwrap();
            let b = fs::metadata(dst_dir.path().join("other.o")).unwrap();
            assert_eq!(a.ino(), b.ino());
        }
    }

    #[test]
    fn test_write_failure_unlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut entry = populated_entry(tmp.path());
        // force a render error: argv entry longer than a line may be
        entry.new.argv[0] = "x".repeat(MAX_LINE_LEN);
        assert!(entry.write().is_err());
        assert!(!tmp.path().join("hello.koc").exists());
    }
}
