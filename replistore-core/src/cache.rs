//! Best-effort persistence of the ring between restarts.
//!
//! Cache failures never surface to callers: a client that cannot load or
//! store its ring simply waits for the control plane.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use replistore_contracts::ring::{Ring, RingCodec};
use tracing::debug;

/// Load a previously persisted ring. Missing, unreadable, and undecodable
/// files all yield `None`.
pub(crate) fn load(path: &Path, codec: &dyn RingCodec) -> Option<Arc<dyn Ring>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no usable ring cache");
            return None;
        }
    };
    match codec.decode(&bytes) {
        Ok(ring) => Some(ring),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "cached ring failed to decode");
            None
        }
    }
}

/// Persist `ring` at `path`, replacing any previous cache atomically.
pub(crate) fn store(path: &Path, ring: &dyn Ring) {
    if let Err(err) = try_store(path, ring) {
        debug!(path = %path.display(), error = %err, "ring cache write failed");
    }
}

/// Strategy: write the encoding to a sibling uniquely-named temp file,
/// fsync, then rename over the destination (atomic on POSIX filesystems).
/// A crash at any point leaves either the old cache or the new one, never
/// a partial file.
fn try_store(path: &Path, ring: &dyn Ring) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let tmp_path =
        path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let written = (|| {
        let mut file = File::create(&tmp_path)?;
        ring.persist(&mut file)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return written;
    }

    // Best-effort fsync of the parent directory to persist rename metadata.
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
