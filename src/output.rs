use clap::Args;
use console::{Style, StyledObject};
use once_cell::sync::Lazy;
use tracing::{metadata::LevelFilter, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Args)]
pub struct OutputArgs {
    /// Increase verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
}

pub static ERROR: Lazy<StyledObject<&'static str>> =
    Lazy::new(|| Style::new().red().bold().for_stderr().apply_to("error:"));

/// Route diagnostics through tracing to stderr. Verbosity maps onto levels
/// the way the spawn/entry/cache modules use them: WARN is always-on noise,
/// INFO is the one-line "recompiling"/"cache hit" summary, DEBUG is cache
/// staleness analysis, TRACE is per-read/pipeline chatter. KOBJCACHE_LOG
/// overrides everything (EnvFilter syntax).
pub fn init(args: &OutputArgs) {
    let verbosity = args.verbose as i16 - args.quiet as i16;

    let level = match verbosity {
        i16::MIN..=-1 => Level::ERROR,
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        3..=i16::MAX => Level::TRACE,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .with_env_var("KOBJCACHE_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_filter(filter),
        )
        .init();
}
