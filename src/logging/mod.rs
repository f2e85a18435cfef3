pub mod event;
pub mod queue;
pub mod sink;

pub use event::AdEvent;
pub use queue::EventQueue;
pub use sink::{EventSink, FileSink, HttpSink, NullSink};
