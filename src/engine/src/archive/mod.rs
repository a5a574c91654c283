//! Reading and writing OCI Image Layout tar archives.

mod load;
mod write;

pub use load::ArchiveLayout;
pub use write::write_image;

use std::io::Read;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::image::Index;

/// Load an image index from a tar archive complying with the OCI Image
/// Layout Specification. All blobs referenced by manifests must appear in
/// the archive itself.
pub async fn load<R: Read>(reader: R, cancel: &CancellationToken) -> Result<Index> {
    let layout = ArchiveLayout::load(reader)?;
    crate::loader::load(Arc::new(layout), cancel).await
}
