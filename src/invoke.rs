//! The per-invocation driver: wire one translation unit's entry and the
//! shared index together, run the preprocessor (and maybe the compiler),
//! and leave both cache files updated.

use crate::cache_dir::CacheDir;
use crate::deps::DepFileConfig;
use crate::entry::CacheEntry;
use crate::prelude::*;

/// A fully validated invocation, as assembled by the command-line layer.
pub struct Invocation {
    pub entry_file: PathBuf,
    /// Resolved cache index file path.
    pub cache_file: PathBuf,
    pub target: String,
    /// Where the preprocessor output lives (first operand of the cpp list).
    pub cpp_out: PathBuf,
    /// Where the object lives (first operand of the cc list).
    pub obj_out: PathBuf,
    pub cpp_argv: Vec<String>,
    pub cc_argv: Vec<String>,
    pub piped_cpp: bool,
    pub piped_cc: bool,
    pub named_pipe: Option<String>,
    pub depfile: Option<DepFileConfig>,
    pub optimize: u8,
}

pub fn run(inv: &Invocation) -> Result<()> {
    let mut cache = CacheDir::create(&inv.cache_file)?;
    let mut entry = CacheEntry::create(&inv.entry_file)?;

    // We are the only writer of the entry file, so reading it before taking
    // the index lock is fine and keeps the obj/argv change detection simple.
    entry.read();
    entry.set_cpp_name(&inv.cpp_out)?;
    entry.set_obj_name(&inv.obj_out)?;
    entry.set_argv(&inv.cc_argv);
    entry.set_target(&inv.target);
    entry.set_piped_mode(inv.piped_cpp, inv.piped_cc, inv.named_pipe.clone());
    entry.set_depfile(inv.depfile.clone());
    entry.set_optimizations(inv.optimize);

    cache.lock()?;
    if cache.is_new() && entry.needs_compile() {
        // Nothing to hit against on either level; this is the clean-build
        // fast path, so run the fused pipeline without holding the lock.
        cache.unlock()?;
        info!("doing full compile");
        entry.preprocess_and_compile(&inv.cpp_argv)?;
        cache.lock()?;
    } else {
        cache.unlock()?;
        entry.preprocess(&inv.cpp_argv)?;

        entry.calc_recompile();
        if entry.needs_compile() {
            cache.lock()?;
            cache.remove_entry(&entry);
            if let Some(found) = cache.find_matching_entry(&entry) {
                info!("using cache entry '{}'", found.abs_path().display());
                entry.copy_obj_from(&found)?;
            } else {
                cache.unlock()?;
                info!("recompiling");
                entry.compile()?;
                cache.lock()?;
            }
        } else {
            info!("no need to recompile");
            cache.lock()?;
        }
    }

    cache.remove_entry(&entry);
    cache.insert_entry(&mut entry);
    entry.write()?;
    cache.unlock()?;
    Ok(())
}
