use crate::{ImageRef, ImageTransport, RemoteError};
use kiln_schema::{Digest, Image};
use tracing::debug;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub copied: usize,
    pub skipped: usize,
}

/// Copy every blob in `digests` that `to` lacks from `from`.
///
/// Used when an exported image reuses layers that live under another
/// repository, e.g. run image layers or layers of the previous image.
pub fn copy_missing_blobs(
    transport: &dyn ImageTransport,
    from: &ImageRef,
    to: &ImageRef,
    digests: &[Digest],
) -> Result<TransferReport, RemoteError> {
    let mut report = TransferReport::default();
    for digest in digests {
        if transport.has_blob(to, digest)? {
            report.skipped += 1;
            continue;
        }
        let data = transport.fetch_blob(from, digest)?;
        transport.push_blob(to, digest, &data)?;
        debug!("copied {} from {} to {}", digest.short(), from, to);
        report.copied += 1;
    }
    Ok(report)
}

/// Upload `layers` (digest and content) that `image` lacks, then push the
/// sealed `manifest` under `image`.
pub fn push_image_with_layers(
    transport: &dyn ImageTransport,
    image: &ImageRef,
    manifest: &Image,
    layers: &[(Digest, Vec<u8>)],
) -> Result<(Digest, TransferReport), RemoteError> {
    let mut report = TransferReport::default();
    for (digest, data) in layers {
        if transport.has_blob(image, digest)? {
            report.skipped += 1;
        } else {
            transport.push_blob(image, digest, data)?;
            report.copied += 1;
        }
    }
    let digest = transport.push_image(image, manifest)?;
    Ok((digest, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalRegistry;

    #[test]
    fn copy_skips_present_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let reg = LocalRegistry::open(dir.path()).unwrap();
        let from = ImageRef::parse("acme/run").unwrap();
        let to = ImageRef::parse("acme/app").unwrap();
        let d = Digest::of(b"base");
        reg.push_blob(&from, &d, b"base").unwrap();

        let report = copy_missing_blobs(&reg, &from, &to, &[d.clone()]).unwrap();
        // The local directory shares blobs across repositories.
        assert_eq!(report, TransferReport { copied: 0, skipped: 1 });
        assert!(reg.has_blob(&to, &d).unwrap());
    }

    #[test]
    fn copy_missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reg = LocalRegistry::open(dir.path()).unwrap();
        let from = ImageRef::parse("acme/run").unwrap();
        let to = ImageRef::parse("acme/app").unwrap();
        let err = copy_missing_blobs(&reg, &from, &to, &[Digest::of(b"absent")]).unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[test]
    fn push_with_layers_uploads_then_tags() {
        let dir = tempfile::tempdir().unwrap();
        let reg = LocalRegistry::open(dir.path()).unwrap();
        let r = ImageRef::parse("acme/app:v2").unwrap();

        let layers = vec![
            (Digest::of(b"one"), b"one".to_vec()),
            (Digest::of(b"two"), b"two".to_vec()),
        ];
        let mut image = Image::empty("linux", "amd64");
        for (d, data) in &layers {
            image.push_layer(d.clone(), data.len() as u64);
        }
        image.seal().unwrap();

        let (digest, report) = push_image_with_layers(&reg, &r, &image, &layers).unwrap();
        assert_eq!(report.copied, 2);
        assert_eq!(digest, image.digest().unwrap());
        assert_eq!(reg.fetch_image(&r).unwrap().unwrap(), image);

        let (_, again) = push_image_with_layers(&reg, &r, &image, &layers).unwrap();
        assert_eq!(again, TransferReport { copied: 0, skipped: 2 });
    }
}
