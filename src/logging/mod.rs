pub mod ring;

use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use ring::RingBuffer;

/// Line capacity of the in-memory log ring attached to the controller.
const RING_CAPACITY: usize = 1000;

/// Initialize tracing with an stderr sink and a ring-buffer sink.
///
/// The returned ring holds the most recent log lines for any status surface
/// that wants to replay them (and for the `on_line` observer hook).
pub fn init(verbose: bool) -> Arc<RingBuffer> {
    let ring = Arc::new(RingBuffer::new(RING_CAPACITY));

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(RingMakeWriter(ring.clone())),
        )
        .init();

    ring
}

/// Adapter so the ring buffer can serve as a `tracing_subscriber` sink.
#[derive(Clone)]
pub struct RingMakeWriter(pub Arc<RingBuffer>);

impl<'a> MakeWriter<'a> for RingMakeWriter {
    type Writer = RingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RingWriter(self.0.clone())
    }
}

pub struct RingWriter(Arc<RingBuffer>);

impl std::io::Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
