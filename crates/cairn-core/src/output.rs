use std::io::Write;
use std::sync::{Arc, Mutex};

/// Shared handle to the process output stream.
///
/// Blob names and other machine-readable results go through this sink, one
/// line at a time, so that concurrent workers never interleave partial
/// lines. Diagnostics go through `tracing` instead. Constructed once at
/// program start and passed by handle.
#[derive(Clone)]
pub struct Output {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Output {
    pub fn stdout() -> Self {
        Output::new(Box::new(std::io::stdout()))
    }

    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Output {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Write one line atomically.
    pub fn line(&self, line: &str) {
        let mut sink = self.sink.lock().expect("output sink poisoned");
        let _ = writeln!(sink, "{line}");
        let _ = sink.flush();
    }

    /// Raw writer over the same sink, for byte streams (loose-blob
    /// decryption to stdout). Each `write` takes the lock once.
    pub fn writer(&self) -> OutputWriter {
        OutputWriter(self.clone())
    }
}

pub struct OutputWriter(Output);

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut sink = self.0.sink.lock().expect("output sink poisoned");
        sink.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut sink = self.0.sink.lock().expect("output sink poisoned");
        sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lines_are_newline_terminated() {
        let cap = Capture::default();
        let out = Output::new(Box::new(cap.clone()));
        out.line("abc");
        out.line("def");
        assert_eq!(&*cap.0.lock().unwrap(), b"abc\ndef\n");
    }
}
