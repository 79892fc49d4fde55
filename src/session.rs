//! Per-connection echo session.
//!
//! A session owns its stream for the whole lifetime of the connection.
//! Dropping the session closes the stream, so the connection is released
//! on every exit path, error and unwind included.

use std::io::{self, Read, Write};
use tracing::info;

/// Maximum number of bytes read from the peer in a single call.
pub const CHUNK_SIZE: usize = 1024;

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Blocked (or about to block) on a read from the peer.
    AwaitingData,
    /// Writing a received chunk back to the peer.
    Echoing,
    /// Peer closed its write side, or an I/O error occurred.
    Closed,
}

/// One accepted connection being echoed.
#[derive(Debug)]
pub struct Session<S> {
    stream: S,
    state: SessionState,
    bytes_echoed: u64,
    chunks_echoed: u64,
}

impl<S: Read + Write> Session<S> {
    /// Create a new session in the awaiting-data state.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: SessionState::AwaitingData,
            bytes_echoed: 0,
            chunks_echoed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Total bytes written back to the peer so far.
    pub fn bytes_echoed(&self) -> u64 {
        self.bytes_echoed
    }

    /// Number of chunks written back to the peer so far.
    pub fn chunks_echoed(&self) -> u64 {
        self.chunks_echoed
    }

    /// Run one read/echo cycle.
    ///
    /// Returns `Ok(true)` if the session should continue, `Ok(false)` once the
    /// peer has closed its write side. Any error leaves the session `Closed`.
    pub fn step(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        if self.state == SessionState::Closed {
            return Ok(false);
        }

        let n = match self.read_chunk(buf) {
            Ok(n) => n,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        if n == 0 {
            self.state = SessionState::Closed;
            return Ok(false);
        }

        let chunk = &buf[..n];
        info!(bytes = n, "Received: {}", String::from_utf8_lossy(chunk));

        self.state = SessionState::Echoing;
        if let Err(e) = self.stream.write_all(chunk) {
            self.state = SessionState::Closed;
            return Err(e);
        }

        self.bytes_echoed += n as u64;
        self.chunks_echoed += 1;
        self.state = SessionState::AwaitingData;
        Ok(true)
    }

    /// Echo until the peer closes its write side or an I/O error occurs.
    ///
    /// Returns the total number of bytes echoed.
    pub fn run(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; CHUNK_SIZE];
        while self.step(&mut buf)? {}
        Ok(self.bytes_echoed)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stream that replays scripted reads and accepts at most
    /// `max_write` bytes per write call.
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        write_calls: usize,
        max_write: usize,
        fail_write: Option<io::ErrorKind>,
    }

    impl ScriptedStream {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
                written: Vec::new(),
                write_calls: 0,
                max_write: usize::MAX,
                fail_write: None,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.fail_write {
                return Err(io::Error::from(kind));
            }
            self.write_calls += 1;
            let n = buf.len().min(self.max_write);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_echo_hello() {
        let mut session = Session::new(ScriptedStream::new(vec![Ok(b"hello".to_vec())]));

        assert_eq!(session.run().unwrap(), 5);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.stream.written, b"hello");
    }

    #[test]
    fn test_immediate_close_echoes_nothing() {
        let mut session = Session::new(ScriptedStream::new(vec![]));

        assert_eq!(session.run().unwrap(), 0);
        assert_eq!(session.chunks_echoed(), 0);
        assert!(session.stream.written.is_empty());
    }

    #[test]
    fn test_large_payload_split_into_chunks() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut session = Session::new(ScriptedStream::new(vec![Ok(payload.clone())]));

        assert_eq!(session.run().unwrap(), 5000);
        assert_eq!(session.chunks_echoed(), 5);
        assert_eq!(session.stream.written, payload);
    }

    #[test]
    fn test_partial_writes_are_completed() {
        let mut stream = ScriptedStream::new(vec![Ok(vec![7u8; 100])]);
        stream.max_write = 30;
        let mut session = Session::new(stream);

        session.run().unwrap();
        assert_eq!(session.stream.written, vec![7u8; 100]);
        assert_eq!(session.stream.write_calls, 4);
    }

    #[test]
    fn test_state_transitions() {
        let mut session = Session::new(ScriptedStream::new(vec![Ok(b"ab".to_vec())]));
        let mut buf = [0u8; CHUNK_SIZE];

        assert_eq!(session.state(), SessionState::AwaitingData);
        assert!(session.step(&mut buf).unwrap());
        assert_eq!(session.state(), SessionState::AwaitingData);
        assert!(!session.step(&mut buf).unwrap());
        assert_eq!(session.state(), SessionState::Closed);

        // Closed is terminal
        assert!(!session.step(&mut buf).unwrap());
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut session = Session::new(ScriptedStream::new(vec![
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(b"after".to_vec()),
        ]));

        assert_eq!(session.run().unwrap(), 5);
        assert_eq!(session.stream.written, b"after");
    }

    #[test]
    fn test_read_error_closes_session() {
        let mut session = Session::new(ScriptedStream::new(vec![
            Ok(b"one".to_vec()),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Ok(b"never".to_vec()),
        ]));

        let err = session.run().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.stream.written, b"one");
    }

    #[test]
    fn test_write_error_closes_session() {
        let mut stream = ScriptedStream::new(vec![Ok(b"data".to_vec())]);
        stream.fail_write = Some(io::ErrorKind::BrokenPipe);
        let mut session = Session::new(stream);

        let err = session.run().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.bytes_echoed(), 0);
    }

    #[test]
    fn test_zero_length_write_is_an_error() {
        let mut stream = ScriptedStream::new(vec![Ok(b"data".to_vec())]);
        stream.max_write = 0;
        let mut session = Session::new(stream);

        let err = session.run().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_invalid_utf8_is_echoed_verbatim() {
        let bytes = vec![0xff, 0xfe, b'o', b'k', 0xc3];
        let mut session = Session::new(ScriptedStream::new(vec![Ok(bytes.clone())]));

        session.run().unwrap();
        assert_eq!(session.stream.written, bytes);
    }
}
