//! Core module: the recursive container-aware metadata sanitizer.
//!
//! The factory ([`create_stripper`]) maps a file to its format handler;
//! container handlers extract each entry into a scratch area, dispatch the
//! entry through the same factory, and rebuild the container with a
//! normalized envelope before atomically replacing the source.

mod archive;
mod error;
mod factory;
mod image;
mod office;
mod secure;
mod stripper;
mod types;

pub mod envelope;

pub use archive::{TarStripper, ZipStripper};
pub use error::{StripError, StripResult};
pub use factory::{create_stripper, is_container, list_supported_formats, CHILD_FACTORY};
pub use image::{JpegStripper, PngStripper};
pub use office::{OpenDocumentStripper, OpenXmlStripper};
pub use secure::secure_remove;
pub use stripper::{is_nometa, ChildFactory, Metadata, ScratchDir, SourceFile, Stripper, NOMETA};
pub use types::{ArchivePolicy, Compression, FormatInfo, StripOptions};
