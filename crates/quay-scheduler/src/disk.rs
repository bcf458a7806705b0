//! Free-space probing through `statvfs(3)`.

use std::io;
use std::path::Path;

use nix::sys::statvfs::statvfs;

use crate::backend::DiskProbe;

/// [`DiskProbe`] backed by the host filesystem.
///
/// `statvfs` blocks the calling thread, and on network mounts it can block
/// for a long time. [`crate::SchedulerService`] moves scheduler work off the
/// async workers on multi-threaded runtimes. Direct callers on a runtime
/// should do the same.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    #[allow(
        clippy::useless_conversion,
        reason = "statvfs field widths differ between targets"
    )]
    fn free_space(&self, path: &Path) -> io::Result<u64> {
        let stats = statvfs(path).map_err(io::Error::from)?;
        let blocks = u64::from(stats.blocks_available());
        let fragment = u64::from(stats.fragment_size());
        Ok(blocks.saturating_mul(fragment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_the_temp_directory() {
        let free = StatvfsProbe
            .free_space(&std::env::temp_dir())
            .expect("temp dir is statable");
        assert!(free > 0);
    }

    #[test]
    fn missing_paths_surface_io_errors() {
        let err = StatvfsProbe
            .free_space(Path::new("/definitely/not/a/mount/point"))
            .expect_err("missing path");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
