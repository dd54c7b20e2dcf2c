//! Build engine invocation and its structured log protocol

mod command;
mod decoder;
mod event;
mod store;

pub use command::{LogDecoder, NixCommand, ProgressReporter};
pub use decoder::{decode_event, ProgressDecoder, PROTOCOL_PREFIX};
pub use event::{Event, LEVEL_ERROR};
pub use store::{
    add_path_to_store, display_name, query_store_hash, store_path_name, FixedOutputStoreEntry,
    STORE_DIR,
};
