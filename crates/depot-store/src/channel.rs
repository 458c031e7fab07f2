use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

/// Bidirectional byte channel to a store daemon, framed as newline-delimited
/// records. `close_write` is a half-close: the peer sees end-of-input but can
/// still flush a final response before full teardown.
pub trait CommandChannel: Send {
    /// Write one frame; the caller supplies the trailing newline.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Read one newline-terminated frame. `Ok(None)` signals a clean EOF.
    fn recv_line(&mut self) -> io::Result<Option<String>>;

    /// Shut down the write side only. Idempotent.
    fn close_write(&mut self) -> io::Result<()>;
}

fn write_side_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel write side is closed")
}

/// Channel over a Unix-domain socket.
pub struct UnixSocketChannel {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
    write_closed: bool,
}

impl UnixSocketChannel {
    /// Connect to a daemon socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be connected or cloned for
    /// buffered reading.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("failed to connect to daemon socket {}", path.display()))?;
        let reader = BufReader::new(
            stream
                .try_clone()
                .context("failed to clone daemon socket for reading")?,
        );
        debug!(socket = %path.display(), "connected to store daemon");
        Ok(Self {
            stream,
            reader,
            write_closed: false,
        })
    }
}

impl CommandChannel for UnixSocketChannel {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.write_closed {
            return Err(write_side_closed());
        }
        self.stream.write_all(frame)?;
        self.stream.flush()
    }

    fn recv_line(&mut self) -> io::Result<Option<String>> {
        read_frame(&mut self.reader)
    }

    fn close_write(&mut self) -> io::Result<()> {
        if self.write_closed {
            return Ok(());
        }
        self.stream.shutdown(std::net::Shutdown::Write)?;
        self.write_closed = true;
        Ok(())
    }
}

/// Channel over a spawned subprocess's standard streams (the SSH transport
/// and anything else that execs a remote daemon).
pub struct ProcessChannel {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessChannel {
    /// Adopt a child spawned with piped stdin/stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if either standard stream was not piped.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .context("spawned channel process has no piped stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("spawned channel process has no piped stdout")?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }
}

impl CommandChannel for ProcessChannel {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(write_side_closed)?;
        stdin.write_all(frame)?;
        stdin.flush()
    }

    fn recv_line(&mut self) -> io::Result<Option<String>> {
        read_frame(&mut self.stdout)
    }

    fn close_write(&mut self) -> io::Result<()> {
        // Dropping the pipe delivers EOF to the remote process.
        self.stdin.take();
        Ok(())
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.stdin.take();
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => break,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    let read = reader.read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn socket_channel_round_trips_and_half_closes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket)?;

        let server = thread::spawn(move || -> Result<()> {
            let (stream, _) = listener.accept()?;
            let mut reader = BufReader::new(stream.try_clone()?);
            let mut stream = stream;
            let mut line = String::new();
            reader.read_line(&mut line)?;
            assert_eq!(line, "ping\n");
            // The client half-closed; reads must now see EOF.
            line.clear();
            assert_eq!(reader.read_line(&mut line)?, 0);
            // ...and the server can still flush a final response.
            stream.write_all(b"pong\n")?;
            Ok(())
        });

        let mut channel = UnixSocketChannel::connect(&socket)?;
        channel.send(b"ping\n")?;
        channel.close_write()?;
        assert!(channel.send(b"again\n").is_err());
        assert_eq!(channel.recv_line()?, Some("pong".to_string()));
        assert_eq!(channel.recv_line()?, None);
        server.join().expect("server thread")?;
        Ok(())
    }

    #[test]
    fn process_channel_half_close_signals_eof() -> Result<()> {
        let child = std::process::Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()?;
        let mut channel = ProcessChannel::from_child(child)?;
        channel.send(b"echoed\n")?;
        assert_eq!(channel.recv_line()?, Some("echoed".to_string()));
        channel.close_write()?;
        // cat exits on EOF, so the read side drains cleanly.
        assert_eq!(channel.recv_line()?, None);
        assert!(channel.send(b"late\n").is_err());
        Ok(())
    }
}
