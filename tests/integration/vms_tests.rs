//! End-to-end tests over a synthetic Hamamatsu VMS mosaic.
//!
//! The pieces carry no restart markers, so each piece is a single tile;
//! the restart index still drives the read path (scanning to the
//! end-of-image marker) and the background worker runs over the files.

use std::path::PathBuf;

use wsi_reader::{can_open, Slide, SlideError};

use super::test_utils::{assert_pixel_near, pixel_at, solid_jpeg};

const RED: [u8; 3] = [190, 40, 40];
const GREEN: [u8; 3] = [40, 190, 40];
const BLUE: [u8; 3] = [40, 40, 190];

/// Two 64x64 pieces side by side, a 20x10 map, and a macro photo.
async fn build_vms_slide(dir: &tempfile::TempDir) -> PathBuf {
    tokio::fs::write(dir.path().join("0001.jpg"), solid_jpeg(64, 64, RED))
        .await
        .unwrap();
    tokio::fs::write(dir.path().join("0002.jpg"), solid_jpeg(64, 64, GREEN))
        .await
        .unwrap();
    tokio::fs::write(dir.path().join("map.jpg"), solid_jpeg(20, 10, BLUE))
        .await
        .unwrap();
    tokio::fs::write(dir.path().join("macro.jpg"), solid_jpeg(30, 20, [99, 99, 99]))
        .await
        .unwrap();

    let key_file = "\
[Virtual Microscope Specimen]
NoLayers=1
NoJpegColumns=2
NoJpegRows=1
ImageFile=0001.jpg
ImageFile(1,0)=0002.jpg
MapFile=map.jpg
MacroImage=macro.jpg
PhysicalWidth=32000000
PhysicalHeight=16000000
SourceLens=40
";
    let path = dir.path().join("slide.vms");
    tokio::fs::write(&path, key_file).await.unwrap();
    path
}

#[tokio::test]
async fn test_open_vms_mosaic() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    // Mosaic (128x64), derived /2 /4 /8 levels, and the 20x10 map,
    // ordered by downsample
    assert_eq!(slide.level_count(), 5);
    assert_eq!(slide.dimensions(), (128, 64));
    assert_eq!(slide.level_dimensions(1), Some((64, 32)));
    assert_eq!(slide.level_dimensions(2), Some((32, 16)));
    assert_eq!(slide.level_dimensions(3), Some((20, 10)));
    assert_eq!(slide.level_dimensions(4), Some((16, 8)));

    assert_eq!(slide.level_downsample(0), Some(1.0));
    assert_eq!(slide.level_downsample(1), Some(2.0));
    assert_eq!(slide.level_downsample(4), Some(8.0));

    slide.close().await;
}

#[tokio::test]
async fn test_vms_properties() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.property_value("openslide.vendor"), Some("hamamatsu"));
    assert_eq!(slide.property_value("openslide.objective-power"), Some("40"));
    // 32,000,000 nm over 128 px = 250 um/px
    assert_eq!(slide.property_value("openslide.mpp-x"), Some("250"));
    assert_eq!(slide.property_value("openslide.mpp-y"), Some("250"));
    assert_eq!(slide.property_value("hamamatsu.MapFile"), Some("map.jpg"));

    slide.close().await;
}

#[tokio::test]
async fn test_vms_mosaic_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 128 * 64 * 4];
    slide.read_region(&mut buf, 0, 0, 0, 128, 64).await.unwrap();

    // Left piece red, right piece green
    assert_pixel_near(pixel_at(&buf, 128, 20, 30), RED, 6);
    assert_pixel_near(pixel_at(&buf, 128, 100, 30), GREEN, 6);

    slide.close().await;
}

#[tokio::test]
async fn test_vms_derived_level_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    // The /2 level delivers box-shrunk pixels from the same tile records
    let mut buf = vec![0u8; 64 * 32 * 4];
    slide.read_region(&mut buf, 0, 0, 1, 64, 32).await.unwrap();

    assert_pixel_near(pixel_at(&buf, 64, 10, 15), RED, 6);
    assert_pixel_near(pixel_at(&buf, 64, 50, 15), GREEN, 6);

    slide.close().await;
}

#[tokio::test]
async fn test_vms_map_level_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 20 * 10 * 4];
    slide.read_region(&mut buf, 0, 0, 3, 20, 10).await.unwrap();
    assert_pixel_near(pixel_at(&buf, 20, 10, 5), BLUE, 6);

    slide.close().await;
}

#[tokio::test]
async fn test_vms_macro_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;

    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.associated_image_dimensions("macro"), Some((30, 20)));
    let image = slide.read_associated_image("macro").unwrap();
    assert_pixel_near(image.argb[0], [99, 99, 99], 6);

    slide.close().await;
}

#[tokio::test]
async fn test_vms_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;

    assert!(can_open(&path).await);
}

#[tokio::test]
async fn test_vmu_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slide.vmu");
    tokio::fs::write(
        &path,
        "[Uncompressed Virtual Microscope Specimen]\nImageFile=a.ngr\n",
    )
    .await
    .unwrap();

    let result = Slide::open(&path).await;
    assert!(matches!(result, Err(SlideError::Unsupported { .. })));
}

#[tokio::test]
async fn test_vms_missing_piece_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = build_vms_slide(&dir).await;
    tokio::fs::remove_file(dir.path().join("0002.jpg")).await.unwrap();

    let result = Slide::open(&path).await;
    assert!(matches!(result, Err(SlideError::Io(_))));
}
