use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{AgentError, Result};
use crate::records::BufferKind;

/// Line-oriented command channel to one monitored process, with typed
/// binary buffer receive. Commands go out as single `;`-terminated
/// lines; the peer answers with text lines and, after a summary request,
/// a fixed sequence of binary buffers.
pub struct Channel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: String,
    rank: u64,
}

impl Channel {
    pub fn connect(addr: &str, rank: u64, timeout: Duration) -> Result<Channel> {
        let socket_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AgentError::SetupFailure(format!("cannot resolve {}", addr)))?;
        let stream = TcpStream::connect_timeout(&socket_addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        debug!(addr, rank, "connected to monitored process");
        Ok(Channel {
            reader: BufReader::new(stream),
            writer,
            peer: addr.to_string(),
            rank,
        })
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send_line(&mut self, line: &str) -> Result<()> {
        trace!(rank = self.rank, line, "sending command");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reads one text line, without the trailing newline. A timeout maps
    /// to `Cancelled`, a closed connection to `ProtocolDesync`.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(|err| {
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                AgentError::Cancelled(format!(
                    "rank {} did not answer within the deadline",
                    self.rank
                ))
            } else {
                AgentError::Io(err)
            }
        })?;
        if n == 0 {
            return Err(AgentError::ProtocolDesync {
                rank: self.rank,
                detail: "connection closed by peer".to_string(),
            });
        }
        Ok(line.trim_end().to_string())
    }

    /// Waits for the peer's `OK`. The runtime interleaves informational
    /// chatter on the same channel; anything else is logged and skipped.
    pub fn await_ok(&mut self) -> Result<()> {
        loop {
            let line = self.read_line()?;
            if line.trim().eq_ignore_ascii_case("OK") {
                return Ok(());
            }
            debug!(rank = self.rank, %line, "skipping non-acknowledgement line");
        }
    }

    /// Receives one typed binary buffer: uppercase header line, a
    /// native-endian u32 element count, then count fixed-size records.
    pub fn receive_buffer(&mut self, kind: BufferKind) -> Result<Vec<u8>> {
        let header = self.read_line()?;
        if header.trim().to_uppercase() != kind.header() {
            return Err(AgentError::ProtocolDesync {
                rank: self.rank,
                detail: format!("expected {} header, got {:?}", kind.header(), header),
            });
        }
        let mut count_bytes = [0u8; 4];
        self.read_exact(&mut count_bytes)?;
        let count = u32::from_ne_bytes(count_bytes);
        if count == 0 {
            return Err(AgentError::ProtocolDesync {
                rank: self.rank,
                detail: format!("{} buffer announced zero elements", kind.header()),
            });
        }
        let mut data = vec![0u8; count as usize * kind.record_size()];
        self.read_exact(&mut data)?;
        trace!(rank = self.rank, header = kind.header(), count, "received buffer");
        Ok(data)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => AgentError::ProtocolDesync {
                rank: self.rank,
                detail: "buffer ended before the announced element count".to_string(),
            },
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                AgentError::Cancelled(format!(
                    "rank {} did not deliver a full buffer within the deadline",
                    self.rank
                ))
            }
            _ => AgentError::Io(err),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn channel_to(script: impl FnOnce(TcpStream) + Send + 'static) -> Channel {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(stream);
        });
        Channel::connect(&addr.to_string(), 0, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn await_ok_skips_chatter() {
        let mut channel = channel_to(|mut stream| {
            stream.write_all(b"some diagnostic line\nok\n").unwrap();
        });
        channel.await_ok().unwrap();
    }

    #[test]
    fn receive_buffer_validates_the_header() {
        let mut channel = channel_to(|mut stream| {
            stream.write_all(b"FLAT_PROFILE\n").unwrap();
        });
        let err = channel.receive_buffer(BufferKind::RegionDefinitions).unwrap_err();
        assert!(matches!(err, AgentError::ProtocolDesync { .. }));
    }

    #[test]
    fn receive_buffer_rejects_zero_elements() {
        let mut channel = channel_to(|mut stream| {
            stream.write_all(b"FLAT_PROFILE\n").unwrap();
            stream.write_all(&0u32.to_ne_bytes()).unwrap();
        });
        let err = channel.receive_buffer(BufferKind::FlatProfile).unwrap_err();
        assert!(matches!(err, AgentError::ProtocolDesync { .. }));
    }

    #[test]
    fn receive_buffer_rejects_short_payloads() {
        let mut channel = channel_to(|mut stream| {
            stream.write_all(b"FLAT_PROFILE\n").unwrap();
            stream.write_all(&2u32.to_ne_bytes()).unwrap();
            stream.write_all(&[0u8; 48]).unwrap();
        });
        let err = channel.receive_buffer(BufferKind::FlatProfile).unwrap_err();
        assert!(matches!(err, AgentError::ProtocolDesync { .. }));
    }
}
