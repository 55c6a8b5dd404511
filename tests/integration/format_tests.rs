//! Format detection and open-dispatcher tests over synthetic TIFF slides.

use wsi_reader::{can_open, Slide, SlideError};

use super::test_utils::{TiffBuilder, TiffLevelSpec};

const APERIO_DESCRIPTION: &str = "Aperio Image Library v11.2.1\r\n\
    512x512 (256x256) JPEG/RGB Q=95|AppMag = 20|MPP = 0.4990|ScanScope ID = SS1302";

fn aperio_slide() -> TiffBuilder {
    let mut builder = TiffBuilder::new();
    builder.levels.push(TiffLevelSpec::solid(512, 512, 256, |col, row| {
        [60 + 40 * col as u8, 60 + 40 * row as u8, 90]
    }));
    builder.levels.push(TiffLevelSpec::solid(256, 256, 256, |_, _| [80, 80, 90]));
    builder.description = Some(APERIO_DESCRIPTION.to_string());
    builder.thumbnail = Some((16, 12, [10, 20, 30]));
    builder
}

#[tokio::test]
async fn test_open_aperio_slide() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specimen.svs");
    tokio::fs::write(&path, aperio_slide().build()).await.unwrap();

    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.level_count(), 2);
    assert_eq!(slide.dimensions(), (512, 512));
    assert_eq!(slide.level_dimensions(1), Some((256, 256)));
    assert_eq!(slide.level_downsample(0), Some(1.0));
    assert_eq!(slide.level_downsample(1), Some(2.0));
    assert_eq!(slide.level_dimensions(2), None);

    slide.close().await;
}

#[tokio::test]
async fn test_aperio_properties() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specimen.svs");
    tokio::fs::write(&path, aperio_slide().build()).await.unwrap();

    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.property_value("openslide.vendor"), Some("aperio"));
    assert_eq!(slide.property_value("openslide.mpp-x"), Some("0.499"));
    assert_eq!(slide.property_value("openslide.mpp-y"), Some("0.499"));
    assert_eq!(slide.property_value("openslide.objective-power"), Some("20"));
    assert_eq!(slide.property_value("aperio.ScanScope ID"), Some("SS1302"));
    assert_eq!(slide.property_value("no.such.key"), None);

    // Property names are sorted and include both namespaces
    let names: Vec<&str> = slide.property_names().collect();
    assert!(names.contains(&"openslide.vendor"));
    assert!(names.contains(&"aperio.AppMag"));
    assert!(names.windows(2).all(|w| w[0] <= w[1]));

    slide.close().await;
}

#[tokio::test]
async fn test_aperio_thumbnail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specimen.svs");
    tokio::fs::write(&path, aperio_slide().build()).await.unwrap();

    let slide = Slide::open(&path).await.unwrap();

    let names: Vec<&str> = slide.associated_image_names().collect();
    assert_eq!(names, vec!["thumbnail"]);
    assert_eq!(slide.associated_image_dimensions("thumbnail"), Some((16, 12)));

    // Uncompressed strips decode exactly
    let image = slide.read_associated_image("thumbnail").unwrap();
    assert_eq!(image.argb.len(), 16 * 12);
    assert!(image.argb.iter().all(|&p| p == 0xFF0A141E));

    assert_eq!(slide.associated_image_dimensions("label"), None);

    slide.close().await;
}

#[tokio::test]
async fn test_open_generic_tiff() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.tif");

    let mut builder = TiffBuilder::new();
    builder
        .levels
        .push(TiffLevelSpec::solid(256, 256, 256, |_, _| [1, 2, 3]));
    tokio::fs::write(&path, builder.build()).await.unwrap();

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.property_value("openslide.vendor"), Some("generic-tiff"));
    assert_eq!(slide.level_count(), 1);

    slide.close().await;
}

#[tokio::test]
async fn test_can_open_tiff() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specimen.svs");
    tokio::fs::write(&path, aperio_slide().build()).await.unwrap();

    assert!(can_open(&path).await);
}

#[tokio::test]
async fn test_growing_pyramid_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upside-down.tif");

    // Level 1 larger than level 0: downsamples would decrease
    let mut builder = TiffBuilder::new();
    builder
        .levels
        .push(TiffLevelSpec::solid(256, 256, 256, |_, _| [0, 0, 0]));
    builder
        .levels
        .push(TiffLevelSpec::solid(512, 512, 256, |_, _| [0, 0, 0]));
    tokio::fs::write(&path, builder.build()).await.unwrap();

    let result = Slide::open(&path).await;
    assert!(matches!(result, Err(SlideError::BadData(_))));
}

#[tokio::test]
async fn test_truncated_tiff_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.svs");

    let data = aperio_slide().build();
    tokio::fs::write(&path, &data[..data.len() / 2]).await.unwrap();

    // The IFD chain sits at the end of the file, so a truncated file has
    // no directories to read
    let result = Slide::open(&path).await;
    assert!(result.is_err());
}
