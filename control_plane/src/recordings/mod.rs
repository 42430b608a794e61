//! Recording lifecycle management and archive storage.

pub mod archive;
pub mod manager;

pub use archive::{ArchiveStore, ArchivedRecording, FsArchiveStore, MemoryArchiveStore};
pub use manager::{archive_file_name, RecordingManager, ReplacementPolicy, StartRequest};
