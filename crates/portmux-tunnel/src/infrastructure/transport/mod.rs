//! Shared-link I/O: the serialized frame writer and the reader/dispatcher
//! task that together own the two halves of the tunnel transport.

pub mod reader;
pub mod writer;

pub use reader::run_reader;
pub use writer::TransportWriter;
