//! `tracing` output routed to the browser console.
//!
//! Warnings and errors are always shown. Debug and info lines appear once any widget on the page
//! was created with `debug: true`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub(crate) fn enabled(metadata: &Metadata<'_>) -> bool {
    *metadata.level() <= Level::WARN || VERBOSE.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsoleMethod {
    Log,
    Warn,
    Error,
}

impl ConsoleMethod {
    pub(crate) fn for_level(level: &Level) -> Self {
        match *level {
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warn,
            _ => Self::Log,
        }
    }
}

pub(crate) type ConsoleSink = fn(ConsoleMethod, &str);

#[derive(Clone, Copy)]
pub(crate) struct ConsoleMakeWriter {
    sink: ConsoleSink,
}

/// Buffers one formatted event and hands it to the sink on drop.
pub(crate) struct ConsoleWriter {
    method: ConsoleMethod,
    sink: ConsoleSink,
    buffer: Vec<u8>,
}

impl io::Write for ConsoleWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ConsoleWriter {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buffer);
        (self.sink)(self.method, line.trim_end());
    }
}

impl<'a> MakeWriter<'a> for ConsoleMakeWriter {
    type Writer = ConsoleWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(ConsoleMethod::Log)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(ConsoleMethod::for_level(meta.level()))
    }
}

impl ConsoleMakeWriter {
    fn writer(self, method: ConsoleMethod) -> ConsoleWriter {
        ConsoleWriter {
            method,
            sink: self.sink,
            buffer: Vec::new(),
        }
    }
}

/// Plain-text fmt layer for the console. Timestamps are left to the browser devtools.
pub(crate) fn console_layer<S>(sink: ConsoleSink) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_writer(ConsoleMakeWriter { sink })
        .with_filter(filter_fn(enabled))
}
