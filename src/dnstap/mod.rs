//! dnstap ingestion: Frame Streams connections carrying protobuf-encoded
//! DNS transactions from resolvers.

pub mod fstrm;
pub mod proto;
mod server;

pub use proto::{decode_answers, Answers};
pub use server::{IngestOptions, ListenAddr, ObservationHandler, StreamIngestor};
