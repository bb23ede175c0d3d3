//! The directory-wide cache index: one digest record per cache entry, so a
//! translation unit can discover a sibling's object file without opening
//! every entry in the directory.
//!
//! Concurrency: sibling builds hammer this file in parallel, so every read
//! or mutation happens under a whole-file exclusive advisory lock, and a
//! rewritten index always carries a higher generation. A corrupt or torn
//! index is never an error; it just reads as empty and gets rewritten clean
//! on the next unlock.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};

use fs2::FileExt;

use crate::entry::CacheEntry;
use crate::prelude::*;
use crate::util::{paths_equal, retry_interrupted};

const CACHE_MAGIC: &str = "kObjCache-v0.1.0";

/// Stale digests are purged on every 19th rewrite, once the index is big
/// enough for the scan to be worth it.
const CLEAN_GENERATION_INTERVAL: u32 = 19;
const CLEAN_MIN_DIGESTS: usize = 16;

/// Everything needed to judge "would that entry's object satisfy this
/// invocation" without opening the entry file.
struct IndexDigest {
    abs_path: Option<PathBuf>,
    rel_path: Option<String>,
    key: u32,
    target: String,
    argv_sum: Digest,
    sums: DigestChain,
}

impl IndexDigest {
    fn entry_path(&self, dir: &Path) -> PathBuf {
        match &self.abs_path {
            Some(p) => p.clone(),
            None => dir.join(self.rel_path.as_deref().unwrap_or("")),
        }
    }

    /// Cross-check against the entry file it points at.
    fn matches_entry(&self, entry: &CacheEntry) -> bool {
        self.key == entry.key()
            && entry.current_argv_sum() == Some(&self.argv_sum)
            && entry.current_target() == Some(self.target.as_str())
            && self.sums.iter().all(|s| entry.current_sums().contains(s))
    }

    fn from_entry(entry: &CacheEntry) -> IndexDigest {
        IndexDigest {
            abs_path: Some(entry.abs_path().to_path_buf()),
            rel_path: None,
            key: entry.key(),
            target: entry.current_target().expect("target set").to_owned(),
            argv_sum: *entry.current_argv_sum().expect("argv signature set"),
            sums: entry.current_sums().clone(),
        }
    }
}

pub struct CacheDir {
    abs_path: PathBuf,
    dir: PathBuf,
    file: Option<File>,
    locked: bool,
    dirty: bool,
    new_cache: bool,
    generation: u32,
    next_key: u32,
    digests: Vec<IndexDigest>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<()> {
    if slot.is_some() {
        bail!("duplicate key '{key}'");
    }
    *slot = Some(value);
    Ok(())
}

#[derive(Default)]
struct RawDigest {
    abs_path: Option<PathBuf>,
    rel_path: Option<String>,
    key: Option<u32>,
    target: Option<String>,
    argv_sum: Option<Digest>,
    sums: DigestChain,
}

impl CacheDir {
    /// Just the data structure; the file is opened (and the directory
    /// created) on the first `lock()`.
    pub fn create(index_path: &Path) -> Result<CacheDir> {
        let abs_path = if index_path.is_absolute() {
            index_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(index_path)
        };
        let dir = abs_path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or_else(|| eyre!("cannot determine directory of {}", abs_path.display()))?
            .to_path_buf();
        Ok(CacheDir {
            abs_path,
            dir,
            file: None,
            locked: false,
            dirty: false,
            new_cache: false,
            generation: 0,
            next_key: 0,
            digests: Vec::new(),
        })
    }

    pub fn is_new(&self) -> bool {
        self.new_cache
    }

    /// Take the exclusive lock, then bring the in-memory index up to date
    /// with whatever is on disk now.
    pub fn lock(&mut self) -> Result<()> {
        debug_assert!(!self.locked);

        if self.file.is_none() {
            let mut options = OpenOptions::new();
            options.read(true).write(true).create(true);
            let file = match options.open(&self.abs_path) {
                Ok(f) => f,
                Err(_) => {
                    fs::create_dir_all(&self.dir).wrap_err_with(|| {
                        format!("failed to create directory {}", self.dir.display())
                    })?;
                    options.open(&self.abs_path).wrap_err_with(|| {
                        format!("failed to create {}", self.abs_path.display())
                    })?
                }
            };
            self.file = Some(file);
        }

        let file = self.file.as_ref().unwrap();
        retry_interrupted(|| file.lock_exclusive())
            .wrap_err_with(|| format!("failed to lock {}", self.abs_path.display()))?;
        self.locked = true;

        self.new_cache = false;
        let len = file.metadata()?.len();
        if len == 0 {
            // Nothing to load until a compile has produced something worth
            // sharing; leave it a 0-byte file.
            self.purge();
            self.new_cache = true;
            debug!("the cache file is empty");
        } else {
            self.read();
        }
        Ok(())
    }

    /// Write back if dirty, then release the lock.
    pub fn unlock(&mut self) -> Result<()> {
        debug_assert!(self.locked);

        if self.dirty {
            if self.digests.len() >= CLEAN_MIN_DIGESTS
                && self.generation % CLEAN_GENERATION_INTERVAL == 0
            {
                self.clean();
            }
            self.write()?;
            self.dirty = false;
        }

        let file = self.file.as_ref().unwrap();
        file.unlock()
            .wrap_err_with(|| format!("failed to unlock {}", self.abs_path.display()))?;
        self.locked = false;
        Ok(())
    }

    fn purge(&mut self) {
        self.digests.clear();
        self.generation = 0;
        self.next_key = 0;
    }

    /// (Re-)read the index. A file that doesn't parse is the same as an
    /// empty cache.
    fn read(&mut self) {
        match self.try_read() {
            Ok(true) => trace!("index: {} digests", self.digests.len()),
            Ok(false) => trace!("index: unchanged generation, skipping re-read"),
            Err(err) => {
                debug!("bad cache file ({err}); starting over");
                self.purge();
                self.new_cache = true;
            }
        }
    }

    fn try_read(&mut self) -> Result<bool> {
        let mut file = self.file.as_ref().unwrap();
        file.seek(SeekFrom::Start(0))?;
        let mut lines = BufReader::new(file).lines();

        let magic = lines.next().ok_or_else(|| eyre!("empty file"))??;
        if magic != format!("magic={CACHE_MAGIC}") {
            bail!("bad magic");
        }
        let gen_line = lines.next().ok_or_else(|| eyre!("missing generation"))??;
        let generation: u32 = gen_line
            .strip_prefix("generation=")
            .ok_or_else(|| eyre!("missing generation"))?
            .parse()
            .wrap_err("bad generation")?;

        // Another process bumps the generation on every write, so an
        // unchanged generation means our in-memory copy is still current.
        if self.generation != 0 && self.generation == generation {
            return Ok(false);
        }

        let mut slots: Option<Vec<RawDigest>> = None;
        let mut the_end = false;
        for line in lines {
            let line = line.wrap_err("read error")?;
            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| eyre!("malformed line {line:?}"))?;

            if let Some((name, idx)) = k.split_once('#') {
                let idx: usize = idx.parse().wrap_err_with(|| format!("bad index in '{k}'"))?;
                let slot = slots
                    .as_mut()
                    .and_then(|s| s.get_mut(idx))
                    .ok_or_else(|| eyre!("digest index {idx} out of range"))?;
                match name {
                    "sum-" => slot.sums.add(v.parse()?),
                    "digest-abs-" => set_once(&mut slot.abs_path, PathBuf::from(v), k)?,
                    "digest-rel-" => set_once(&mut slot.rel_path, v.to_owned(), k)?,
                    "key-" => set_once(&mut slot.key, v.parse().wrap_err("bad key")?, k)?,
                    "target-" => set_once(&mut slot.target, v.to_owned(), k)?,
                    "comp-argv-sum-" => set_once(&mut slot.argv_sum, v.parse()?, k)?,
                    _ => bail!("unknown key '{k}'"),
                }
            } else {
                match k {
                    "digests" => {
                        if slots.is_some() {
                            bail!("duplicate key 'digests'");
                        }
                        let count: usize = v.parse().wrap_err("bad digests count")?;
                        slots = Some((0..count).map(|_| RawDigest::default()).collect());
                    }
                    "the-end" => {
                        if v != "fine" {
                            bail!("bad the-end sentinel");
                        }
                        the_end = true;
                        break;
                    }
                    _ => bail!("unknown key '{k}'"),
                }
            }
        }

        if !the_end {
            bail!("missing the-end sentinel");
        }

        let mut next_key = 0u32;
        let digests = slots
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let key = raw.key.filter(|&k| k != 0).ok_or_else(|| eyre!("digest {i}: bad key"))?;
                next_key = next_key.max(key.wrapping_add(1));
                if raw.abs_path.is_none() && raw.rel_path.is_none() {
                    bail!("digest {i}: no path");
                }
                if raw.sums.is_empty() {
                    bail!("digest {i}: no sums");
                }
                Ok(IndexDigest {
                    abs_path: raw.abs_path,
                    rel_path: raw.rel_path,
                    key,
                    target: raw.target.ok_or_else(|| eyre!("digest {i}: no target"))?,
                    argv_sum: raw.argv_sum.ok_or_else(|| eyre!("digest {i}: no argv sum"))?,
                    sums: raw.sums,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.digests = digests;
        self.generation = generation;
        self.next_key = next_key;
        Ok(true)
    }

    /// Rewrite the index in place (the lock lives on this very fd, so no
    /// rename dance) with the generation bumped. A stream error unlinks the
    /// file; the next invocation starts from an empty but correct index.
    fn write(&mut self) -> Result<()> {
        if let Err(err) = self.try_write() {
            let _ = fs::remove_file(&self.abs_path);
            return Err(err)
                .wrap_err_with(|| format!("error writing '{}'", self.abs_path.display()));
        }
        Ok(())
    }

    fn try_write(&mut self) -> Result<()> {
        self.generation = self.generation.wrapping_add(1).max(1);

        let mut out = String::new();
        out.push_str(&format!("magic={CACHE_MAGIC}\n"));
        out.push_str(&format!("generation={}\n", self.generation));
        out.push_str(&format!("digests={}\n", self.digests.len()));
        for (i, d) in self.digests.iter().enumerate() {
            if let Some(p) = &d.abs_path {
                out.push_str(&format!("digest-abs-#{i}={}\n", p.display()));
            }
            if let Some(p) = &d.rel_path {
                out.push_str(&format!("digest-rel-#{i}={p}\n"));
            }
            out.push_str(&format!("key-#{i}={}\n", d.key));
            out.push_str(&format!("target-#{i}={}\n", d.target));
            out.push_str(&format!("comp-argv-sum-#{i}={}\n", d.argv_sum));
            for sum in d.sums.iter() {
                out.push_str(&format!("sum-#{i}={sum}\n"));
            }
        }
        out.push_str("the-end=fine\n");

        let mut file = self.file.as_ref().unwrap();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(out.as_bytes())?;
        file.set_len(out.len() as u64)?;
        trace!("wrote '{}', {} bytes", self.abs_path.display(), out.len());
        Ok(())
    }

    /// Drop digests whose entry files no longer validate. (The entry files
    /// themselves are the build system's to delete, not ours.)
    fn clean(&mut self) {
        let mut i = self.digests.len();
        while i > 0 {
            i -= 1;
            let path = self.digests[i].entry_path(&self.dir);
            let stale = match CacheEntry::create(&path) {
                Ok(mut entry) => {
                    entry.read();
                    entry.needs_compile() || !self.digests[i].matches_entry(&entry)
                }
                Err(_) => true,
            };
            if stale {
                debug!("removing bad digest '{}'", path.display());
                self.digests.remove(i);
                self.dirty = true;
            }
        }
    }

    /// Look for a sibling entry with the same compiler signature whose
    /// accepted digest chain covers this invocation's preprocessor output.
    /// Index records that fail validation against their entry file are
    /// purged on the way.
    pub fn find_matching_entry(&mut self, entry: &CacheEntry) -> Option<CacheEntry> {
        debug_assert!(self.locked);
        let argv_sum = *entry.current_argv_sum()?;
        let needle = *entry.current_sums().first()?;

        let mut i = self.digests.len();
        while i > 0 {
            i -= 1;
            let d = &self.digests[i];
            if d.argv_sum != argv_sum || !d.sums.contains(&needle) {
                continue;
            }

            let path = d.entry_path(&self.dir);
            if let Ok(mut candidate) = CacheEntry::create(&path) {
                candidate.read();
                if !candidate.needs_compile() && self.digests[i].matches_entry(&candidate) {
                    return Some(candidate);
                }
            }

            debug!("removing bad digest '{}'", path.display());
            self.digests.remove(i);
            self.dirty = true;
        }
        None
    }

    /// Forget any digest pointing at this entry's file.
    pub fn remove_entry(&mut self, entry: &CacheEntry) {
        debug_assert!(self.locked);
        let mut i = self.digests.len();
        while i > 0 {
            i -= 1;
            if paths_equal(&self.digests[i].entry_path(&self.dir), entry.abs_path()) {
                self.digests.remove(i);
                self.dirty = true;
                trace!(
                    "removed entry '{}'; {} left",
                    entry.abs_path().display(),
                    self.digests.len()
                );
            }
        }
    }

    /// Give the entry a fresh key and index it.
    pub fn insert_entry(&mut self, entry: &mut CacheEntry) {
        debug_assert!(self.locked);

        let key = loop {
            let candidate = self.next_key;
            self.next_key = self.next_key.wrapping_add(1);
            if candidate != 0 && self.digests.iter().all(|d| d.key != candidate) {
                break candidate;
            }
        };
        entry.set_key(key);

        self.digests.push(IndexDigest::from_entry(entry));
        self.dirty = true;
        trace!(
            "inserted digest #{}: {}",
            self.digests.len() - 1,
            entry.abs_path().display()
        );
    }
}

impl Drop for CacheDir {
    fn drop(&mut self) {
        // The lock dies with the fd anyway; this only covers early-error
        // paths that bail out between lock() and unlock().
        if self.locked {
            if let Some(file) = &self.file {
                let _ = file.unlock();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    /// A written-out cache entry the index can point at.
    fn make_entry(dir: &Path, stem: &str, flags: &[&str], cpp: &[u8]) -> CacheEntry {
        fs::write(dir.join(format!("{stem}.o")), b"fake object").unwrap();
        let mut entry = CacheEntry::create(&dir.join(format!("{stem}.koc"))).unwrap();
        entry.read();
        entry.set_cpp_name(&dir.join(format!("{stem}.i"))).unwrap();
        entry.set_obj_name(&dir.join(format!("{stem}.o"))).unwrap();
        let mut full = argv(flags);
        full.push(format!("{stem}.o"));
        entry.set_argv(&full);
        entry.set_target("x86_64-linux");
        entry.take_cpp_output(cpp.to_vec(), true);
        entry
    }

    #[test]
    fn test_insert_write_find_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("cache").join("index.koc");

        let mut a = make_entry(tmp.path(), "a", &["cc", "-c"], b"int x;\n");
        {
            let mut cache = CacheDir::create(&index_path).unwrap();
            cache.lock().unwrap();
            assert!(cache.is_new());
            cache.insert_entry(&mut a);
            a.write().unwrap();
            cache.unlock().unwrap();
        }
        assert_ne!(a.key(), 0);

        // Sibling with the same flags and the same preprocessed bytes.
        let mut b = make_entry(tmp.path(), "b", &["cc", "-c"], b"int x;\n");
        let mut cache = CacheDir::create(&index_path).unwrap();
        cache.lock().unwrap();
        assert!(!cache.is_new());
        let found = cache.find_matching_entry(&b).expect("sibling should match");
        assert!(crate::util::paths_equal(
            found.abs_path(),
            &tmp.path().join("a.koc")
        ));

        // Different flags must not match.
        let mut c = make_entry(tmp.path(), "c", &["cc", "-c", "-DX"], b"int x;\n");
        assert!(cache.find_matching_entry(&c).is_none());

        // Different preprocessor output must not match.
        let mut d = make_entry(tmp.path(), "d", &["cc", "-c"], b"int y;\n");
        assert!(cache.find_matching_entry(&d).is_none());

        cache.insert_entry(&mut b);
        cache.insert_entry(&mut c);
        cache.insert_entry(&mut d);
        // keys are unique and non-zero
        let keys = [a.key(), b.key(), c.key(), d.key()];
        assert!(keys.iter().all(|&k| k != 0));
        let unique: HashSet<u32> = keys.iter().copied().collect();
        assert_eq!(unique.len(), keys.len());
        cache.unlock().unwrap();
    }

    #[test]
    fn test_generation_is_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("index.koc");

        let mut last_generation = 0;
        for i in 0..3 {
            let mut e = make_entry(tmp.path(), &format!("g{i}"), &["cc", "-c"], b"int g;\n");
            let mut cache = CacheDir::create(&index_path).unwrap();
            cache.lock().unwrap();
            cache.remove_entry(&e);
            cache.insert_entry(&mut e);
            e.write().unwrap();
            cache.unlock().unwrap();
            assert!(cache.generation > last_generation);
            last_generation = cache.generation;
        }
        assert_eq!(last_generation, 3);
    }

    #[test]
    fn test_corrupt_index_self_heals() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("index.koc");

        let mut a = make_entry(tmp.path(), "a", &["cc", "-c"], b"int x;\n");
        let mut cache = CacheDir::create(&index_path).unwrap();
        cache.lock().unwrap();
        cache.insert_entry(&mut a);
        a.write().unwrap();
        cache.unlock().unwrap();
        drop(cache);

        fs::write(&index_path, b"\x00garbage\xff\xfe not an index").unwrap();

        let mut b = make_entry(tmp.path(), "b", &["cc", "-c"], b"int x;\n");
        let mut cache = CacheDir::create(&index_path).unwrap();
        cache.lock().unwrap();
        // parses as empty; the previous contents are gone but nothing fails
        assert!(cache.is_new());
        assert!(cache.find_matching_entry(&b).is_none());
        cache.insert_entry(&mut b);
        b.write().unwrap();
        cache.unlock().unwrap();

        // rewritten clean with generation restarted
        let text = fs::read_to_string(&index_path).unwrap();
        assert!(text.starts_with("magic=kObjCache-v0.1.0\ngeneration=1\n"));
        assert!(text.ends_with("the-end=fine\n"));
    }

    #[test]
    fn test_stale_digest_purged_on_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("index.koc");

        let mut a = make_entry(tmp.path(), "a", &["cc", "-c"], b"int x;\n");
        let mut cache = CacheDir::create(&index_path).unwrap();
        cache.lock().unwrap();
        cache.insert_entry(&mut a);
        a.write().unwrap();
        cache.unlock().unwrap();
        drop(cache);

        // the entry's object disappears behind the index's back
        fs::remove_file(tmp.path().join("a.o")).unwrap();

        let mut b = make_entry(tmp.path(), "b", &["cc", "-c"], b"int x;\n");
        let mut cache = CacheDir::create(&index_path).unwrap();
        cache.lock().unwrap();
        assert!(cache.find_matching_entry(&b).is_none());
        cache.unlock().unwrap();

        // the purge was written back
        let text = fs::read_to_string(&index_path).unwrap();
        assert!(text.contains("digests=0\n"));
    }

    #[test]
    fn test_remove_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("index.koc");

        let mut a = make_entry(tmp.path(), "a", &["cc", "-c"], b"int x;\n");
        let mut cache = CacheDir::create(&index_path).unwrap();
        cache.lock().unwrap();
        cache.insert_entry(&mut a);
        a.write().unwrap();
        cache.unlock().unwrap();

        cache.lock().unwrap();
        cache.remove_entry(&a);
        assert!(cache.find_matching_entry(&a).is_none());
        cache.unlock().unwrap();

        let text = fs::read_to_string(&index_path).unwrap();
        assert!(text.contains("digests=0\n"));
    }
}
