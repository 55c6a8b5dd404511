//! End-to-end tests over a synthetic InteMedic container.

use std::path::PathBuf;

use wsi_reader::{can_open, Slide, SlideError};

use super::test_utils::{
    assert_pixel_near, encrypt_tron_metadata, pixel_at, solid_jpeg, ZipBuilder,
};

const C00: [u8; 3] = [210, 60, 60];
const C10: [u8; 3] = [60, 210, 60];
const C01: [u8; 3] = [60, 60, 210];

const METADATA: &str = r#"{
    "LevelCount": 2,
    "TileWidth": 32,
    "TileHeight": 32,
    "Levels": [
        {"Width": 64, "Height": 64, "Cols": 2, "Rows": 2},
        {"Width": 32, "Height": 32, "Cols": 1, "Rows": 1}
    ],
    "BackgroundColor": "255, 255, 255",
    "MppX": 0.5,
    "MppY": 0.5,
    "ScanObjective": 20
}"#;

/// Container with one level-0 tile omitted (cell (1,1) is background).
fn build_container(metadata_blob: Vec<u8>) -> Vec<u8> {
    let mut builder = ZipBuilder::new();
    builder.add("slide.tron", &metadata_blob);
    builder.add("0\\0\\0\\0.jpg", &solid_jpeg(32, 32, C00));
    builder.add("0\\0\\0\\1.jpg", &solid_jpeg(32, 32, C10));
    builder.add("0\\0\\1\\0.jpg", &solid_jpeg(32, 32, C01));
    builder.add("1\\0\\0\\0.jpg", &solid_jpeg(32, 32, [120, 120, 120]));
    builder.add("label", &solid_jpeg(12, 8, [10, 10, 10]));
    builder.add("macro", &solid_jpeg(24, 16, [20, 20, 20]));
    builder.add("preview", &solid_jpeg(16, 16, [30, 30, 30]));
    builder.finish()
}

async fn write_container(dir: &tempfile::TempDir) -> PathBuf {
    let blob = encrypt_tron_metadata(METADATA.as_bytes(), [7; 16], [9; 16]);
    let path = dir.path().join("specimen.tron");
    tokio::fs::write(&path, build_container(blob)).await.unwrap();
    path
}

#[tokio::test]
async fn test_open_tron_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.level_count(), 2);
    assert_eq!(slide.dimensions(), (64, 64));
    assert_eq!(slide.level_dimensions(1), Some((32, 32)));
    assert_eq!(slide.level_downsample(1), Some(2.0));

    slide.close().await;
}

#[tokio::test]
async fn test_tron_properties() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.property_value("openslide.vendor"), Some("intemedic"));
    assert_eq!(
        slide.property_value("openslide.background-color"),
        Some("ffffff")
    );
    assert_eq!(slide.property_value("openslide.mpp-x"), Some("0.5"));
    assert_eq!(slide.property_value("openslide.objective-power"), Some("20"));
    assert_eq!(slide.property_value("intemedic.LevelCount"), Some("2"));

    slide.close().await;
}

#[tokio::test]
async fn test_tron_region_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 64 * 64 * 4];
    slide.read_region(&mut buf, 0, 0, 0, 64, 64).await.unwrap();

    assert_pixel_near(pixel_at(&buf, 64, 8, 8), C00, 6);
    assert_pixel_near(pixel_at(&buf, 64, 40, 8), C10, 6);
    assert_pixel_near(pixel_at(&buf, 64, 8, 40), C01, 6);

    // The omitted cell renders as the metadata's background color
    assert_eq!(pixel_at(&buf, 64, 40, 40), 0xFFFFFFFF);
    assert_eq!(pixel_at(&buf, 64, 63, 63), 0xFFFFFFFF);

    slide.close().await;
}

#[tokio::test]
async fn test_tron_coarse_level_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 32 * 32 * 4];
    slide.read_region(&mut buf, 0, 0, 1, 32, 32).await.unwrap();
    assert_pixel_near(pixel_at(&buf, 32, 16, 16), [120, 120, 120], 6);

    slide.close().await;
}

#[tokio::test]
async fn test_tron_associated_images() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    let names: Vec<&str> = slide.associated_image_names().collect();
    assert_eq!(names, vec!["label", "macro", "preview"]);
    assert_eq!(slide.associated_image_dimensions("label"), Some((12, 8)));
    assert_eq!(slide.associated_image_dimensions("macro"), Some((24, 16)));
    assert_eq!(slide.associated_image_dimensions("preview"), Some((16, 16)));

    slide.close().await;
}

#[tokio::test]
async fn test_tron_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(&dir).await;

    assert!(can_open(&path).await);
}

#[tokio::test]
async fn test_tron_read_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    let mut first = vec![0u8; 48 * 48 * 4];
    let mut second = vec![0u8; 48 * 48 * 4];
    slide.read_region(&mut first, 8, 8, 0, 48, 48).await.unwrap();
    slide.read_region(&mut second, 8, 8, 0, 48, 48).await.unwrap();
    assert_eq!(first, second);

    slide.close().await;
}

#[tokio::test]
async fn test_tron_tampered_metadata_fails() {
    let dir = tempfile::tempdir().unwrap();

    // Flip one bit of the stored digest: decryption succeeds but the
    // checksum no longer matches
    let mut blob = encrypt_tron_metadata(METADATA.as_bytes(), [7; 16], [9; 16]);
    blob[0] ^= 0x01;

    let path = dir.path().join("tampered.tron");
    tokio::fs::write(&path, build_container(blob)).await.unwrap();

    let result = Slide::open(&path).await;
    assert!(matches!(result, Err(SlideError::BadData(_))));
}

#[tokio::test]
async fn test_tron_missing_metadata_entry_fails() {
    let dir = tempfile::tempdir().unwrap();

    let mut builder = ZipBuilder::new();
    builder.add("0\\0\\0\\0.jpg", &solid_jpeg(32, 32, C00));
    let path = dir.path().join("bare.tron");
    tokio::fs::write(&path, builder.finish()).await.unwrap();

    let result = Slide::open(&path).await;
    assert!(matches!(result, Err(SlideError::BadData(_))));
}
