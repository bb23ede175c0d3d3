#![deny(unsafe_code)]

mod cache_dir;
mod compare;
mod cpp_reader;
mod deps;
mod digest;
mod entry;
mod error;
mod invoke;
mod output;
mod prelude;
mod spawn;
mod util;

use clap::Parser;

use crate::deps::DepFileConfig;
use crate::error::KObjCacheError;
use crate::invoke::Invocation;
use crate::prelude::*;

/// Compiler-output cache. Wraps one translation unit's preprocess+compile
/// step and skips the compile whenever a previous run over semantically
/// identical preprocessor output already produced the object file.
#[derive(Parser)]
#[command(name = "kObjCache", version, max_term_width = 100)]
struct Opt {
    /// Cache entry file for this translation unit.
    #[arg(short = 'f', long = "entry-file", value_name = "PATH")]
    entry_file: PathBuf,

    /// Cache index file.
    #[arg(
        short = 'c',
        long = "cache-file",
        value_name = "PATH",
        conflicts_with_all = ["cache_dir", "name"]
    )]
    cache_file: Option<PathBuf>,

    /// Cache directory; the index filename comes from --name or from the
    /// entry file name with a .koc extension. Defaults to $KOBJCACHE_DIR.
    #[arg(short = 'd', long = "cache-dir", value_name = "PATH")]
    cache_dir: Option<PathBuf>,

    /// Base name for the index file inside --cache-dir.
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    name: Option<String>,

    /// Target os/arch tag; entries only match within one target.
    #[arg(short = 't', long = "target", value_name = "NAME")]
    target: String,

    /// Feed the compiler through a named pipe instead of stdin.
    #[arg(long = "named-pipe-compile", value_name = "NAME")]
    named_pipe_compile: Option<String>,

    /// Pipe both the preprocessor output and the compiler input.
    #[arg(short = 'p', long = "passthru")]
    passthru: bool,

    /// Pipe only the preprocessor output.
    #[arg(short = 'r', long = "redir-stdout")]
    redir_stdout: bool,

    /// Write a makefile-format dependency file.
    #[arg(short = 'm', long = "make-dep-file", value_name = "PATH")]
    make_dep_file: Option<PathBuf>,

    /// Restore the on-disk case of dependency paths.
    #[arg(long = "make-dep-fix-case")]
    make_dep_fix_case: bool,

    /// Also emit an empty stub rule per dependency.
    #[arg(long = "make-dep-gen-stubs")]
    make_dep_gen_stubs: bool,

    /// Suppress dependency-collector warnings.
    #[arg(long = "make-dep-quiet")]
    make_dep_quiet: bool,

    /// Normalize the preprocessor output before digesting it. (-O1)
    #[arg(long = "optimize-1")]
    optimize_1: bool,

    /// As --optimize-1, plus trust the digest alone and skip the byte-level
    /// comparison. (-O2)
    #[arg(long = "optimize-2")]
    optimize_2: bool,

    #[command(flatten)]
    output: output::OutputArgs,
}

/// The three argument streams of an invocation: our own options plus the
/// preprocessor and compiler argument vectors, separated by the
/// `--kObjCache-*` markers.
#[derive(Default)]
struct Sections {
    options: Vec<String>,
    cpp_out: Option<String>,
    cpp_argv: Vec<String>,
    obj_out: Option<String>,
    cc_argv: Vec<String>,
}

fn syntax(msg: &str) -> eyre::Report {
    eyre!("syntax error: {msg}")
}

fn split_sections(args: impl Iterator<Item = String>) -> Result<Sections> {
    enum Mode {
        Options,
        Cpp,
        Cc,
        Both,
    }

    let mut mode = Mode::Options;
    let mut sections = Sections::default();
    let mut args = args;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--kObjCache-cpp" => {
                mode = Mode::Cpp;
                if sections.cpp_out.is_none() {
                    sections.cpp_out = Some(args.next().ok_or_else(|| {
                        syntax("--kObjCache-cpp requires a preprocessor output filename")
                    })?);
                }
            }
            "--kObjCache-cc" => {
                mode = Mode::Cc;
                if sections.obj_out.is_none() {
                    sections.obj_out = Some(
                        args.next()
                            .ok_or_else(|| syntax("--kObjCache-cc requires an object filename"))?,
                    );
                }
            }
            "--kObjCache-both" => mode = Mode::Both,
            "--kObjCache-options" => mode = Mode::Options,
            _ => match mode {
                Mode::Options => {
                    // clap has no spelling for the single-dash -O1/-O2 forms
                    let arg = match arg.as_str() {
                        "-O1" => "--optimize-1".to_owned(),
                        "-O2" => "--optimize-2".to_owned(),
                        _ => arg,
                    };
                    sections.options.push(arg);
                }
                Mode::Cpp => sections.cpp_argv.push(arg),
                Mode::Cc => sections.cc_argv.push(arg),
                Mode::Both => {
                    sections.cpp_argv.push(arg.clone());
                    sections.cc_argv.push(arg);
                }
            },
        }
    }

    Ok(sections)
}

fn build_invocation(opt: Opt, sections: Sections) -> Result<Invocation> {
    let cpp_out = PathBuf::from(
        sections
            .cpp_out
            .ok_or_else(|| syntax("no preprocessor arguments (--kObjCache-cpp)"))?,
    );
    let obj_out = PathBuf::from(
        sections
            .obj_out
            .ok_or_else(|| syntax("no compiler arguments (--kObjCache-cc)"))?,
    );
    if sections.cpp_argv.is_empty() {
        return Err(syntax("no preprocessor arguments (--kObjCache-cpp)"));
    }
    if sections.cc_argv.is_empty() {
        return Err(syntax("no compiler arguments (--kObjCache-cc)"));
    }

    let cache_file = match opt.cache_file {
        Some(path) => path,
        None => {
            let dir = opt
                .cache_dir
                .or_else(|| std::env::var_os("KOBJCACHE_DIR").map(PathBuf::from))
                .ok_or_else(|| {
                    syntax("no cache dir (-d / KOBJCACHE_DIR) and no cache filename (-c)")
                })?;
            let name = match opt.name {
                Some(name) => PathBuf::from(name),
                None => {
                    let mut name = PathBuf::from(
                        opt.entry_file
                            .file_name()
                            .ok_or_else(|| syntax("the entry file (-f) names a directory"))?,
                    );
                    name.set_extension("koc");
                    name
                }
            };
            dir.join(name)
        }
    };

    let depfile = opt.make_dep_file.map(|path| DepFileConfig {
        path,
        fix_case: opt.make_dep_fix_case,
        quiet: opt.make_dep_quiet,
        gen_stubs: opt.make_dep_gen_stubs,
    });

    let optimize = if opt.optimize_2 {
        crate::cpp_reader::OPT_NORMALIZE | crate::cpp_reader::OPT_DIGEST_ONLY
    } else if opt.optimize_1 {
        crate::cpp_reader::OPT_NORMALIZE
    } else {
        0
    };

    Ok(Invocation {
        entry_file: opt.entry_file,
        cache_file,
        target: opt.target,
        cpp_out,
        obj_out,
        cpp_argv: sections.cpp_argv,
        cc_argv: sections.cc_argv,
        piped_cpp: opt.passthru || opt.redir_stdout,
        piped_cc: opt.passthru,
        named_pipe: opt.named_pipe_compile,
        depfile,
        optimize,
    })
}

fn real_main() -> i32 {
    let mut args: Vec<String> = std::env::args().collect();

    // KOBJCACHE_OPTS supplies extra options without touching the makefiles.
    // They go in behind the command line, wedged back into option mode in
    // case argv ended inside a --kObjCache-cc section.
    if let Ok(extra) = std::env::var("KOBJCACHE_OPTS") {
        if !extra.trim().is_empty() {
            args.push("--kObjCache-options".to_owned());
            args.extend(extra.split_whitespace().map(String::from));
        }
    }

    let program = args.remove(0);
    let sections = match split_sections(args.into_iter()) {
        Ok(sections) => sections,
        Err(err) => {
            eprintln!("kObjCache: {err}");
            return 1;
        }
    };

    let mut clap_args = vec![program];
    clap_args.extend(sections.options.iter().cloned());
    let opt = match Opt::try_parse_from(&clap_args) {
        Ok(opt) => opt,
        Err(err) if err.use_stderr() => {
            // clap's usage errors exit 2 by default; ours is 1.
            eprint!("{err}");
            return 1;
        }
        Err(help_or_version) => {
            print!("{help_or_version}");
            return 0;
        }
    };

    output::init(&opt.output);

    let invocation = match build_invocation(opt, sections) {
        Ok(invocation) => invocation,
        Err(err) => {
            eprintln!("kObjCache: {err}");
            return 1;
        }
    };

    match invoke::run(&invocation) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("kObjCache: {} {err:#}", *output::ERROR);
            match err.downcast_ref::<KObjCacheError>() {
                Some(child) => child.exit_code(),
                None => 1,
            }
        }
    }
}

fn main() {
    std::process::exit(real_main());
}

#[cfg(test)]
mod test {
    use super::*;

    fn strings<'a>(args: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
        args.iter().map(|s| s.to_string())
    }

    #[test]
    fn test_split_sections() {
        let s = split_sections(strings(&[
            "-f",
            "/t/a.koc",
            "--kObjCache-cpp",
            "/t/a.i",
            "cpp",
            "hello.c",
            "--kObjCache-cc",
            "/t/a.o",
            "cc",
            "-c",
            "--kObjCache-both",
            "-m32",
            "--kObjCache-options",
            "-t",
            "x86",
        ]))
        .unwrap();

        assert_eq!(s.options, ["-f", "/t/a.koc", "-t", "x86"]);
        assert_eq!(s.cpp_out.as_deref(), Some("/t/a.i"));
        assert_eq!(s.obj_out.as_deref(), Some("/t/a.o"));
        assert_eq!(s.cpp_argv, ["cpp", "hello.c", "-m32"]);
        assert_eq!(s.cc_argv, ["cc", "-c", "-m32"]);
    }

    #[test]
    fn test_split_sections_translates_optimize_flags() {
        let s = split_sections(strings(&["-O1", "-O2"])).unwrap();
        assert_eq!(s.options, ["--optimize-1", "--optimize-2"]);
    }

    #[test]
    fn test_marker_missing_operand() {
        assert!(split_sections(strings(&["--kObjCache-cpp"])).is_err());
        assert!(split_sections(strings(&["--kObjCache-cc"])).is_err());
    }

    #[test]
    fn test_build_invocation_derives_index_name() {
        let opt = Opt::try_parse_from([
            "kObjCache",
            "-f",
            "/t/hello.koc",
            "-t",
            "x86_64-linux",
            "-d",
            "/cache",
            "-p",
        ])
        .unwrap();
        let sections = split_sections(strings(&[
            "--kObjCache-cpp",
            "/t/hello.i",
            "cpp",
            "hello.c",
            "--kObjCache-cc",
            "/t/hello.o",
            "cc",
            "-c",
        ]))
        .unwrap();

        let inv = build_invocation(opt, sections).unwrap();
        assert_eq!(inv.cache_file, PathBuf::from("/cache/hello.koc"));
        assert!(inv.piped_cpp);
        assert!(inv.piped_cc);
        assert_eq!(inv.cpp_argv, ["cpp", "hello.c"]);
        assert_eq!(inv.cc_argv, ["cc", "-c"]);
    }

    #[test]
    fn test_build_invocation_requires_both_argvs() {
        let opt = Opt::try_parse_from([
            "kObjCache",
            "-f",
            "/t/hello.koc",
            "-t",
            "x86",
            "-c",
            "/cache/index.koc",
        ])
        .unwrap();
        let sections = split_sections(strings(&["--kObjCache-cpp", "/t/hello.i", "cpp"])).unwrap();
        assert!(build_invocation(opt, sections).is_err());
    }
}
