//! metascrub — scrub privacy-sensitive metadata from files and archives.
//!
//! The library rebuilds supported containers (ZIP, tar, zipped document
//! formats) entry by entry, recursing into everything it recognizes, and
//! normalizes the container envelope itself: entry dates pinned to the ZIP
//! epoch, tar ownership zeroed, comments emptied. Leaf formats (PNG, JPEG)
//! get their metadata chunks and segments filtered out. The sanitized
//! artifact then replaces the original atomically, with optional backup.

pub mod core;
