//! End-to-end archive scenarios: build, write, reload, compare.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;

use zeroimage_engine::archive::{self, ArchiveLayout};
use zeroimage_engine::digest::Digest;
use zeroimage_engine::image::Image;
use zeroimage_engine::layer::LayerBuilder;
use zeroimage_engine::spec::{
    Descriptor, History, ImageIndex, MediaType, Platform,
};
use zeroimage_engine::tarbuild;

fn build_mod_time() -> std::time::SystemTime {
    // 2021-10-24T02:36:42Z
    UNIX_EPOCH + Duration::from_secs(1_635_043_002)
}

fn entrypoint_layer(name: &str, content: &[u8]) -> zeroimage_engine::image::Layer {
    let mut builder = LayerBuilder::new();
    builder.set_default_mod_time(build_mod_time());
    builder
        .add(
            &format!("/{name}"),
            tarbuild::File {
                reader: content,
                size: content.len() as u64,
                mode: 0o644,
                mod_time: build_mod_time(),
            },
        )
        .unwrap();
    builder.finish().unwrap()
}

fn scratch_image() -> Image {
    let mut image = Image::default();
    image.set_platform(Platform::parse("linux/amd64").unwrap());
    image.append_layer(entrypoint_layer("app", b"0123456789abcdef"));
    image.config.created = Some("2021-10-24T02:36:42Z".to_string());
    image.config.history.push(History {
        created: Some("2021-10-24T02:36:42Z".to_string()),
        created_by: Some("zeroimage".to_string()),
        comment: Some("entrypoint: /app".to_string()),
        ..History::default()
    });
    image.config.config.get_or_insert_with(Default::default).entrypoint =
        Some(vec!["/app".to_string()]);
    image.annotations = Some(
        [("org.example.test".to_string(), "roundtrip".to_string())]
            .into_iter()
            .collect(),
    );
    image
}

async fn write_to_bytes(image: &Image, cancel: &CancellationToken) -> Vec<u8> {
    let mut archive_bytes = Vec::new();
    archive::write_image(image, cancel, &mut archive_bytes)
        .await
        .unwrap();
    archive_bytes
}

async fn blob_bytes(layer: &zeroimage_engine::image::Layer, cancel: &CancellationToken) -> Vec<u8> {
    let mut data = Vec::new();
    let mut reader = layer.open_blob(cancel).await.unwrap();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut data)
        .await
        .unwrap();
    data
}

/// Image equality that ignores how blob readers are produced: everything
/// else, including the blob bytes themselves, must agree.
async fn assert_images_equal(a: &Image, b: &Image, cancel: &CancellationToken) {
    assert_eq!(a.config, b.config);
    assert_eq!(a.platform, b.platform);
    assert_eq!(a.annotations, b.annotations);
    assert_eq!(a.layers.len(), b.layers.len());
    for (la, lb) in a.layers.iter().zip(&b.layers) {
        assert_eq!(la.descriptor, lb.descriptor);
        assert_eq!(la.diff_id, lb.diff_id);
        assert_eq!(blob_bytes(la, cancel).await, blob_bytes(lb, cancel).await);
    }
}

#[tokio::test]
async fn test_round_trip_preserves_image() {
    let cancel = CancellationToken::new();
    let original = scratch_image();

    let archive_bytes = write_to_bytes(&original, &cancel).await;
    let index = archive::load(&archive_bytes[..], &cancel).await.unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.entries()[0].platform.to_string(), "linux/amd64");

    let reloaded = index.entries()[0].get_image(&cancel).await.unwrap();
    assert_images_equal(&original, &reloaded, &cancel).await;

    // Writing the reloaded image and loading it again must also converge.
    let rewritten = write_to_bytes(&reloaded, &cancel).await;
    let again = archive::load(&rewritten[..], &cancel).await.unwrap();
    let final_image = again.entries()[0].get_image(&cancel).await.unwrap();
    assert_images_equal(&reloaded, &final_image, &cancel).await;
}

#[tokio::test]
async fn test_multi_platform_index_preserves_order() {
    let cancel = CancellationToken::new();
    let platforms = [
        "linux/amd64",
        "linux/arm/v5",
        "linux/arm/v7",
        "linux/arm64/v8",
        "linux/386",
        "linux/mips64le",
        "linux/ppc64le",
        "linux/riscv64",
        "linux/s390x",
        "windows/amd64",
        "windows/amd64",
    ];

    let manifests = platforms
        .iter()
        .enumerate()
        .map(|(i, p)| Descriptor {
            media_type: MediaType::ImageManifest,
            digest: Digest::from_bytes(format!("manifest {i}").as_bytes()),
            size: 1,
            platform: Some(Platform::parse(p).unwrap()),
            annotations: None,
        })
        .collect();
    let index_json = serde_json::to_vec(&ImageIndex {
        schema_version: 2,
        media_type: Some(MediaType::ImageIndex),
        manifests,
        annotations: None,
    })
    .unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in [
        ("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#.to_vec()),
        ("index.json", index_json),
    ] {
        let mut header = tar::Header::new_ustar();
        header.set_path(name).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, content.as_slice()).unwrap();
    }
    let archive_bytes = builder.into_inner().unwrap();

    let index = archive::load(&archive_bytes[..], &cancel).await.unwrap();
    let listed: Vec<String> = index
        .entries()
        .iter()
        .map(|e| e.platform.to_string())
        .collect();
    assert_eq!(listed, platforms);
}

#[tokio::test]
async fn test_from_scratch_build_layout() {
    let cancel = CancellationToken::new();
    let image = scratch_image();
    let archive_bytes = write_to_bytes(&image, &cancel).await;

    // The archive carries exactly the layout files plus three blobs:
    // config, manifest, and the single layer.
    let mut regular_files = Vec::new();
    let mut layer_blob = Vec::new();
    let layer_path = format!(
        "blobs/sha256/{}",
        image.layers[0].descriptor.digest.encoded()
    );
    let mut ar = tar::Archive::new(&archive_bytes[..]);
    for entry in ar.entries().unwrap() {
        let mut entry = entry.unwrap();
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if name == layer_path {
            entry.read_to_end(&mut layer_blob).unwrap();
        }
        regular_files.push(name);
    }

    assert_eq!(regular_files.len(), 5);
    assert!(regular_files.contains(&"oci-layout".to_string()));
    assert!(regular_files.contains(&"index.json".to_string()));
    assert!(!layer_blob.is_empty());

    // The entrypoint file sits at the archive root, so the layer's tar
    // holds exactly one entry.
    let mut layer_tar = tar::Archive::new(GzDecoder::new(&layer_blob[..]));
    let names: Vec<String> = layer_tar
        .entries()
        .unwrap()
        .map(|e| String::from_utf8_lossy(&e.unwrap().path_bytes()).into_owned())
        .collect();
    assert_eq!(names, ["app"]);
}

#[tokio::test]
async fn test_layout_loader_reports_missing_blobs() {
    let cancel = CancellationToken::new();
    let image = scratch_image();
    let archive_bytes = write_to_bytes(&image, &cancel).await;

    let layout = ArchiveLayout::load(&archive_bytes[..]).unwrap();
    assert_eq!(layout.layout_version(), "1.0.0");
    let index = zeroimage_engine::loader::load(Arc::new(layout), &cancel)
        .await
        .unwrap();
    assert_eq!(index.len(), 1);
}
