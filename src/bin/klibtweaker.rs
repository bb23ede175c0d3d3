//! Post-link tweaker for COFF import libraries.
//!
//! Build caching lives or dies by reproducible outputs, and Windows import
//! libraries spoil it in two ways: every member carries timestamps, and the
//! linker leaves the `NULL_THUNK_DATA` payload zeroed so it differs from a
//! library produced by a later relink. This tool walks a Unix `ar` archive
//! in place and fixes both: `--clear-timestamps` zeroes the member mtimes
//! and the COFF/import-library `TimeDateStamp` fields, and
//! `--fill-null_thunk_data` replaces the all-zero thunk word with a fixed
//! pattern (recognizing that same pattern as already-done, so the tool is
//! idempotent).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use clap::Parser;
use eyre::{bail, eyre, Result, WrapErr};
use tracing::{debug, info, metadata::LevelFilter, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_LEN: u64 = 60;
const AR_MEMBER_MAGIC: [u8; 2] = [0x60, 0x0a];

const MACHINE_I386: u16 = 0x014c;
const MACHINE_AMD64: u16 = 0x8664;

const COFF_HEADER_LEN: u64 = 20;
const SECTION_HEADER_LEN: u64 = 40;
const SYMBOL_LEN: u64 = 18;

const THUNK_SYMBOL_SUFFIX: &[u8] = b"NULL_THUNK_DATA";
/// What an already-tweaked thunk word looks like; seeing it again means
/// there is nothing left to do.
const THUNK_FILL: [u8; 8] = [0xaa, 0x99, 0x88, 0xbb, 0xbb, 0xaa, 0x88, 0x99];

#[derive(Parser)]
#[command(name = "kLibTweaker", version, max_term_width = 100)]
struct Opt {
    /// Overwrite member and COFF timestamps with zeros.
    #[arg(long = "clear-timestamps")]
    clear_timestamps: bool,

    /// Fill the zeroed NULL_THUNK_DATA word with a fixed pattern.
    #[arg(long = "fill-null_thunk_data")]
    fill_null_thunk_data: bool,

    /// Increase verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Reduce verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// The library to tweak in place.
    #[arg(value_name = "LIB")]
    lib: PathBuf,
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn i16_at(buf: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([buf[off], buf[off + 1]])
}

/// The ar size field: optional leading blanks, then decimal digits.
fn ascii_to_size(field: &[u8]) -> u64 {
    let mut size = 0u64;
    let mut seen_digit = false;
    for &b in field {
        match b {
            b' ' | b'\t' if !seen_digit => {}
            b'0'..=b'9' => {
                seen_digit = true;
                size = size * 10 + (b - b'0') as u64;
            }
            _ => break,
        }
    }
    size
}

trait ReadWriteAt {
    fn read_at_exact(&mut self, off: u64, len: usize) -> Result<Vec<u8>>;
    fn write_at_all(&mut self, off: u64, data: &[u8]) -> Result<()>;
}

impl ReadWriteAt for std::fs::File {
    fn read_at_exact(&mut self, off: u64, len: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(off))?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)
            .wrap_err_with(|| format!("short read at offset {off:#x}"))?;
        Ok(buf)
    }

    fn write_at_all(&mut self, off: u64, data: &[u8]) -> Result<()> {
        self.seek(SeekFrom::Start(off))?;
        self.write_all(data)
            .wrap_err_with(|| format!("write failed at offset {off:#x}"))?;
        Ok(())
    }
}

/// Zero the timestamps of one archive member: the decimal mtime in the ar
/// header, and the `TimeDateStamp` of a COFF object or import-library
/// pseudo-object payload.
fn clear_timestamps(
    file: &mut std::fs::File,
    header_off: u64,
    member_size: u64,
    data_off: u64,
) -> Result<()> {
    file.write_at_all(header_off + 16, b"000000000000")?;

    if member_size <= COFF_HEADER_LEN {
        return Ok(());
    }
    let hdr = file.read_at_exact(data_off, COFF_HEADER_LEN as usize)?;

    let machine = u16_at(&hdr, 0);
    let n_sections = u16_at(&hdr, 2) as u64;
    let symtab_ptr = u32_at(&hdr, 8) as u64;
    if (machine == MACHINE_I386 || machine == MACHINE_AMD64)
        && COFF_HEADER_LEN + n_sections * SECTION_HEADER_LEN <= member_size
        && symtab_ptr <= member_size
    {
        info!("found COFF file header");
        if u32_at(&hdr, 4) != 0 {
            file.write_at_all(data_off + 4, &[0, 0, 0, 0])?;
        }
        return Ok(());
    }

    // The short import-library descriptor: sig1=0, sig2=0xffff.
    let sig1 = u16_at(&hdr, 0);
    let sig2 = u16_at(&hdr, 2);
    let version = u16_at(&hdr, 4);
    let imp_machine = u16_at(&hdr, 6);
    let data_size = u32_at(&hdr, 12) as u64;
    if sig1 == 0
        && sig2 == 0xffff
        && version == 0
        && (imp_machine == MACHINE_I386 || imp_machine == MACHINE_AMD64)
        && data_size <= member_size
    {
        info!("found COFF import library header");
        if u32_at(&hdr, 8) != 0 {
            file.write_at_all(data_off + 8, &[0, 0, 0, 0])?;
        }
        return Ok(());
    }

    debug!("machine={machine:#x} implib-machine={imp_machine:#x}: not a COFF payload");
    Ok(())
}

/// Find the word-sized `.idata$5` section and, when the `\x7f…NULL_THUNK_DATA`
/// symbol points at all-zero raw data, overwrite it with the fill pattern.
fn fill_null_thunk_data(
    file: &mut std::fs::File,
    member_size: u64,
    data_off: u64,
) -> Result<()> {
    // Filter out members too small to hold header + two sections + a word.
    if member_size <= COFF_HEADER_LEN + SECTION_HEADER_LEN * 2 + 4 {
        return Ok(());
    }
    let hdr = file.read_at_exact(data_off, COFF_HEADER_LEN as usize)?;

    let machine = u16_at(&hdr, 0);
    if machine != MACHINE_I386 && machine != MACHINE_AMD64 {
        return Ok(());
    }
    let word = if machine == MACHINE_I386 { 4usize } else { 8 };
    let n_sections = u16_at(&hdr, 2) as u64;
    let symtab_ptr = u32_at(&hdr, 8) as u64;
    let n_symbols = u32_at(&hdr, 12) as u64;
    if n_sections == 0 || n_symbols == 0 {
        return Ok(());
    }
    let headers_end = COFF_HEADER_LEN + n_sections * SECTION_HEADER_LEN;
    if headers_end >= member_size || symtab_ptr >= member_size || symtab_ptr < headers_end {
        return Ok(());
    }

    // Search for the .idata$5 section holding the thunk word.
    let mut idata5: Option<(u64, Vec<u8>)> = None;
    for i in 0..n_sections {
        let sec = file.read_at_exact(
            data_off + COFF_HEADER_LEN + i * SECTION_HEADER_LEN,
            SECTION_HEADER_LEN as usize,
        )?;
        debug!(
            "section {:?} raw-size={:#x}",
            String::from_utf8_lossy(&sec[..8]),
            u32_at(&sec, 16)
        );
        if &sec[..8] == b".idata$5" && u32_at(&sec, 16) as usize == word {
            idata5 = Some((i, sec));
            break;
        }
    }
    let Some((section_index, section)) = idata5 else {
        return Ok(());
    };

    // Symbol table plus string table in one gulp.
    let strtab_off = symtab_ptr + n_symbols * SYMBOL_LEN;
    let strtab_size = u32_at(&file.read_at_exact(data_off + strtab_off, 4)?, 0) as u64;
    debug!(
        "found COFF file header, strtab-size={strtab_size:#x} symbols={n_symbols} symtab at {symtab_ptr:#x}"
    );
    if strtab_size <= 4 || strtab_size >= 16 * 1024 * 1024 || strtab_off + strtab_size > member_size
    {
        return Ok(());
    }
    let table = file.read_at_exact(
        data_off + symtab_ptr,
        (n_symbols * SYMBOL_LEN + strtab_size) as usize,
    )?;
    let (symbols, strtab) = table.split_at((n_symbols * SYMBOL_LEN) as usize);

    for i in 0..n_symbols as usize {
        let sym = &symbols[i * SYMBOL_LEN as usize..(i + 1) * SYMBOL_LEN as usize];
        let name: &[u8] = if u32_at(sym, 0) != 0 {
            let short = &sym[..8];
            match short.iter().position(|&b| b == 0) {
                Some(n) => &short[..n],
                None => short,
            }
        } else {
            let off = u32_at(sym, 4) as usize;
            if off == 0 || off >= strtab_size as usize {
                continue;
            }
            let rest = &strtab[off..];
            match rest.iter().position(|&b| b == 0) {
                Some(n) => &rest[..n],
                None => rest,
            }
        };

        if name.first() != Some(&0x7f)
            || name.len() < THUNK_SYMBOL_SUFFIX.len() + 1
            || !name.ends_with(THUNK_SYMBOL_SUFFIX)
        {
            continue;
        }
        let printable = String::from_utf8_lossy(name);
        info!("found '{printable}': value={:#x}", u32_at(sym, 8));

        let section_number = i16_at(sym, 12);
        if section_number <= 0 || section_number as u64 > n_sections {
            continue;
        }
        if section_number as u64 != section_index + 1 {
            warn!(
                "'{printable}' in section {section_number}, expected {}",
                section_index + 1
            );
        } else if u32_at(sym, 8) != 0 {
            warn!("'{printable}' has value {:#x}, expected 0", u32_at(sym, 8));
        } else {
            let raw_ptr = u32_at(&section, 20) as u64;
            if raw_ptr < headers_end || raw_ptr + word as u64 > member_size {
                warn!("unexpected PointerToRawData value: {raw_ptr:#x}");
            } else {
                let current = file.read_at_exact(data_off + raw_ptr, word)?;
                if current.iter().all(|&b| b == 0) {
                    file.write_at_all(data_off + raw_ptr, &THUNK_FILL[..word])?;
                    info!("updated '{printable}'");
                } else if current == THUNK_FILL[..word] {
                    info!("already modified '{printable}'");
                } else {
                    bail!(
                        "unexpected '{printable}' data: {:02x?}",
                        &current[..word.min(current.len())]
                    );
                }
            }
            break;
        }
    }

    Ok(())
}

/// Walk the archive and apply the requested tweaks to every member.
fn tweak_library(path: &std::path::Path, clear: bool, fill: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open '{}' for read+write", path.display()))?;
    let file_len = file.metadata()?.len();

    let magic = file.read_at_exact(0, AR_MAGIC.len())?;
    if magic != AR_MAGIC {
        bail!("didn't find '!<arch>' magic in '{}'", path.display());
    }

    let mut header_off = AR_MAGIC.len() as u64;
    while header_off + AR_HEADER_LEN <= file_len {
        let header = file.read_at_exact(header_off, AR_HEADER_LEN as usize)?;
        if header[58..60] != AR_MEMBER_MAGIC {
            bail!("invalid member header magic at offset {header_off:#x}");
        }

        let data_off = header_off + AR_HEADER_LEN;
        let size = ascii_to_size(&header[48..58]);
        info!("member header at {header_off:#x}: {size:#x} bytes at {data_off:#x}");

        if clear {
            clear_timestamps(&mut file, header_off, size, data_off)?;
        }
        if fill {
            fill_null_thunk_data(&mut file, size, data_off)?;
        }

        // members are 2-byte aligned
        header_off = data_off + ((size + 1) & !1);
    }

    Ok(())
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match verbose as i16 - quiet as i16 {
        i16::MIN..=-1 => Level::ERROR,
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::from_level(level).into())
                        .with_env_var("KLIBTWEAKER_LOG")
                        .from_env_lossy(),
                ),
        )
        .init();
}

fn main() {
    // KLIBTWEAKER_OPTS supplies extra options without touching makefiles.
    let mut args: Vec<String> = std::env::args().collect();
    if let Ok(extra) = std::env::var("KLIBTWEAKER_OPTS") {
        args.extend(extra.split_whitespace().map(String::from));
    }

    let opt = Opt::parse_from(args);
    init_logging(opt.verbose, opt.quiet);

    if let Err(err) = tweak_library(&opt.lib, opt.clear_timestamps, opt.fill_null_thunk_data) {
        eprintln!("kLibTweaker: error: {err:#}");
        std::process::exit(1);
    }
}
