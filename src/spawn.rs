//! The narrow child-process interface the cache engine runs the
//! preprocessor and compiler through: run to completion, run as a producer
//! (we read its stdout), or run as a consumer (we feed its stdin, plain or
//! named pipe). Everything else about process management stays out of the
//! core.

use std::fs::File;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use crate::error::KObjCacheError;
use crate::prelude::*;

fn command_for(argv: &[String], what: &'static str) -> Result<Command> {
    let program = argv
        .first()
        .ok_or_else(|| eyre!("{what}: empty argument vector"))?;
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    Ok(cmd)
}

/// Wait for a child; a non-zero exit or signal death is the typed error the
/// top level turns into our own exit code.
pub fn wait(child: &mut Child, what: &'static str) -> Result<()> {
    let status = child
        .wait()
        .wrap_err_with(|| format!("{what}: waiting for child"))?;
    trace!("{what} - child exited: {status}");
    if !status.success() {
        return Err(KObjCacheError::ChildFailed { what, status }.into());
    }
    Ok(())
}

/// Spawn and wait, optionally redirecting the child's stdout to a file.
pub fn run(argv: &[String], stdout_to: Option<&Path>, what: &'static str) -> Result<()> {
    let mut cmd = command_for(argv, what)?;
    if let Some(path) = stdout_to {
        let file = File::create(path)
            .wrap_err_with(|| format!("{what}: creating stdout redirection file {}", path.display()))?;
        cmd.stdout(Stdio::from(file));
    }
    let mut child = cmd
        .spawn()
        .wrap_err_with(|| format!("{what}: failed to spawn {}", argv[0]))?;
    trace!("{what} - spawned {}", argv[0]);
    wait(&mut child, what)
}

/// Spawn a child whose stdout we consume.
pub fn spawn_producer(argv: &[String], what: &'static str) -> Result<(Child, ChildStdout)> {
    let mut child = command_for(argv, what)?
        .stdout(Stdio::piped())
        .spawn()
        .wrap_err_with(|| format!("{what}: failed to spawn {}", argv[0]))?;
    trace!("{what} - spawned producer {}", argv[0]);
    let stdout = child.stdout.take().expect("stdout was piped");
    Ok((child, stdout))
}

/// Where the consumer child reads its input from.
pub enum ConsumerFeed {
    Stdin(ChildStdin),
    NamedPipe(File),
}

impl Write for ConsumerFeed {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ConsumerFeed::Stdin(w) => w.write(buf),
            ConsumerFeed::NamedPipe(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ConsumerFeed::Stdin(w) => w.flush(),
            ConsumerFeed::NamedPipe(w) => w.flush(),
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)] // mkfifo has no std equivalent
fn make_fifo(path: &str) -> Result<()> {
    use std::ffi::CString;
    let c_path = CString::new(path).wrap_err("pipe name contains NUL")?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err).wrap_err_with(|| format!("mkfifo({path})"));
        }
    }
    Ok(())
}

/// Spawn a child that reads our output. With `named_pipe` the child is
/// expected to open the pipe by name itself (its argv names it); our
/// open-for-write after the spawn is the connect handshake. Otherwise we
/// feed its stdin.
pub fn spawn_consumer(
    argv: &[String],
    named_pipe: Option<&str>,
    what: &'static str,
) -> Result<(Child, ConsumerFeed)> {
    let mut cmd = command_for(argv, what)?;

    if let Some(pipe_name) = named_pipe {
        #[cfg(unix)]
        {
            make_fifo(pipe_name)?;
            let child = cmd
                .spawn()
                .wrap_err_with(|| format!("{what}: failed to spawn {}", argv[0]))?;
            trace!("{what} - spawned consumer {} on pipe {pipe_name}", argv[0]);
            // Blocks until the child opens its end for reading.
            let pipe = File::create(pipe_name)
                .wrap_err_with(|| format!("{what}: connecting to pipe {pipe_name}"))?;
            Ok((child, ConsumerFeed::NamedPipe(pipe)))
        }
        #[cfg(not(unix))]
        {
            let _ = pipe_name;
            bail!("{what}: --named-pipe-compile is not supported on this platform");
        }
    } else {
        let mut child = cmd
            .stdin(Stdio::piped())
            .spawn()
            .wrap_err_with(|| format!("{what}: failed to spawn {}", argv[0]))?;
        trace!("{what} - spawned consumer {}", argv[0]);
        let stdin = child.stdin.take().expect("stdin was piped");
        Ok((child, ConsumerFeed::Stdin(stdin)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_run_success_and_failure() {
        run(&["true".into()], None, "test").unwrap();

        let err = run(&["false".into()], None, "test").unwrap_err();
        let child_err = err.downcast_ref::<KObjCacheError>().unwrap();
        assert_eq!(child_err.exit_code(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn test_stdout_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        run(
            &["echo".into(), "hello".into()],
            Some(&out),
            "test",
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_producer_consumer_round_trip() {
        let (mut prod, mut stdout) =
            spawn_producer(&["echo".into(), "data".into()], "test").unwrap();
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).unwrap();
        wait(&mut prod, "test").unwrap();
        assert_eq!(buf, b"data\n");

        let (mut cons, mut feed) = spawn_consumer(&["cat".into()], None, "test").unwrap();
        feed.write_all(b"swallowed\n").unwrap();
        drop(feed);
        wait(&mut cons, "test").unwrap();
    }

    #[test]
    fn test_empty_argv_rejected() {
        assert!(run(&[], None, "test").is_err());
    }
}
