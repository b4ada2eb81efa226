use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};

use dvt_error::{DvResult, ErrorCode, dv_err, err};

/// Channel-based non-blocking writer that performs writes on a separate
/// thread and flushes after every line, so each record is durable the moment
/// the write call returns to the producer side.
///
/// It stops accepting new writes after the first write or flush error, and
/// reports that error through the shutdown handle.
pub struct LineWriter {
    sender: mpsc::Sender<WriterMessage>,
    /// Flag used to avoid repeated error messages when the writer thread
    /// died early (e.g. disk full).
    shutdown_flag: Arc<AtomicBool>,
}

pub struct LineWriterShutdownHandle {
    sender: mpsc::Sender<WriterMessage>,
    writer_thread: Option<JoinHandle<()>>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_err: Arc<Mutex<Option<io::Error>>>,
}

enum WriterMessage {
    Write(Vec<u8>),
    Shutdown,
}

impl LineWriter {
    pub fn new<W>(mut writer: W) -> (Self, LineWriterShutdownHandle)
    where
        W: io::Write + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<WriterMessage>();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let shutdown_flag_clone = shutdown_flag.clone();
        let shutdown_err = Arc::new(Mutex::new(None));
        let shutdown_err_clone = shutdown_err.clone();

        let writer_thread = thread::spawn(move || {
            while let Ok(message) = receiver.recv() {
                match message {
                    WriterMessage::Write(data) => {
                        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                            let mut err_lock = shutdown_err_clone.lock().expect("mutex poisoned");
                            *err_lock = Some(e);
                            // Assume fatal; no further attempts
                            break;
                        }
                    }
                    WriterMessage::Shutdown => {
                        // Drain whatever is still queued
                        while let Ok(WriterMessage::Write(data)) = receiver.try_recv() {
                            let _ = writer.write_all(&data);
                        }
                        let _ = writer.flush();
                        break;
                    }
                }
            }
            shutdown_flag_clone.store(true, Ordering::Release);
        });

        (
            Self {
                sender: sender.clone(),
                shutdown_flag: shutdown_flag.clone(),
            },
            LineWriterShutdownHandle {
                sender,
                writer_thread: Some(writer_thread),
                shutdown_flag,
                shutdown_err,
            },
        )
    }

    /// Queues one line (a trailing newline is appended).
    pub fn write_line(&self, line: &str) -> DvResult<()> {
        if self.shutdown_flag.load(Ordering::Acquire) {
            return err!(ErrorCode::IoError, "output writer thread has terminated unexpectedly");
        }
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.sender.send(WriterMessage::Write(data)).map_err(|_| {
            self.shutdown_flag.store(true, Ordering::Release);
            dv_err!(ErrorCode::IoError, "output writer thread has terminated unexpectedly")
        })
    }
}

impl LineWriterShutdownHandle {
    pub fn shutdown(&mut self) -> DvResult<()> {
        if !self.shutdown_flag.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(WriterMessage::Shutdown);
        }
        if let Some(handle) = self.writer_thread.take() {
            handle
                .join()
                .map_err(|e| dv_err!(ErrorCode::IoError, "failed to close output writer: {e:?}"))?;
        }
        let err_lock = self.shutdown_err.lock().expect("mutex poisoned");
        if let Some(e) = err_lock.as_ref() {
            return err!(
                ErrorCode::IoError,
                "output writer encountered an error: {}. Some records may have been lost.",
                e
            );
        }
        Ok(())
    }
}

/// Ensure shutdown is called on drop
impl Drop for LineWriterShutdownHandle {
    fn drop(&mut self) {
        // Discard any error, as we can't return it from drop
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Mock writer that captures output and can be told to fail.
    struct MockWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
        fail_on_flush: bool,
        fail_after_writes: Option<usize>,
        writes: usize,
    }

    impl MockWriter {
        fn new() -> Self {
            Self {
                buffer: Arc::new(Mutex::new(Vec::new())),
                fail_on_flush: false,
                fail_after_writes: None,
                writes: 0,
            }
        }

        fn with_fail_on_flush(mut self) -> Self {
            self.fail_on_flush = true;
            self
        }

        fn with_fail_after_writes(mut self, count: usize) -> Self {
            self.fail_after_writes = Some(count);
            self
        }
    }

    impl Write for MockWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            if let Some(fail_after) = self.fail_after_writes {
                if self.writes > fail_after {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write error"));
                }
            }
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            if self.fail_on_flush {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock flush error"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_write_and_shutdown() {
        let mock = MockWriter::new();
        let buffer = mock.buffer.clone();
        let (writer, mut handle) = LineWriter::new(mock);

        writer.write_line("line one").unwrap();
        writer.write_line("line two").unwrap();
        handle.shutdown().unwrap();

        let contents = buffer.lock().unwrap();
        assert_eq!(String::from_utf8_lossy(&contents), "line one\nline two\n");
    }

    #[test]
    fn test_write_failure_surfaces_on_shutdown() {
        let mock = MockWriter::new().with_fail_after_writes(1);
        let buffer = mock.buffer.clone();
        let (writer, mut handle) = LineWriter::new(mock);

        writer.write_line("kept").unwrap();
        // This send may succeed; the writer thread fails while processing it
        let _ = writer.write_line("lost");

        let error = handle.shutdown().unwrap_err();
        assert_eq!(error.code, ErrorCode::IoError);
        assert!(error.to_string().contains("mock write error"));

        let contents = buffer.lock().unwrap();
        assert_eq!(String::from_utf8_lossy(&contents), "kept\n");
    }

    #[test]
    fn test_flush_failure_surfaces_on_shutdown() {
        let mock = MockWriter::new().with_fail_on_flush();
        let (writer, mut handle) = LineWriter::new(mock);
        writer.write_line("line").unwrap();

        let error = handle.shutdown().unwrap_err();
        assert!(error.to_string().contains("mock flush error"));

        // after shutdown, writes are refused
        assert!(writer.write_line("late").is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (writer, mut handle) = LineWriter::new(MockWriter::new());
        writer.write_line("line").unwrap();
        assert!(handle.shutdown().is_ok());
        assert!(handle.shutdown().is_ok());
    }
}
