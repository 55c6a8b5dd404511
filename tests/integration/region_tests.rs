//! Region reading: composition, clipping, background fill, missing-tile
//! recursion, and the sticky error contract.

use wsi_reader::{Slide, SlideError};

use super::test_utils::{assert_pixel_near, pixel_at, solid_jpeg, TiffBuilder, TiffLevelSpec};

/// Quadrant colors of the standard 512x512 test slide.
const Q: [[u8; 3]; 4] = [
    [200, 40, 40],  // tile (0,0)
    [40, 200, 40],  // tile (1,0)
    [40, 40, 200],  // tile (0,1)
    [180, 180, 40], // tile (1,1)
];

fn quadrant_color(col: u32, row: u32) -> [u8; 3] {
    Q[(row * 2 + col) as usize]
}

fn quadrant_slide() -> Vec<u8> {
    let mut builder = TiffBuilder::new();
    builder
        .levels
        .push(TiffLevelSpec::solid(512, 512, 256, quadrant_color));
    builder.build()
}

async fn write_slide(dir: &tempfile::TempDir, name: &str, data: Vec<u8>) -> std::path::PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

#[tokio::test]
async fn test_full_level_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_slide(&dir, "q.tif", quadrant_slide()).await;
    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 512 * 512 * 4];
    slide.read_region(&mut buf, 0, 0, 0, 512, 512).await.unwrap();

    assert_pixel_near(pixel_at(&buf, 512, 64, 64), quadrant_color(0, 0), 6);
    assert_pixel_near(pixel_at(&buf, 512, 400, 64), quadrant_color(1, 0), 6);
    assert_pixel_near(pixel_at(&buf, 512, 64, 400), quadrant_color(0, 1), 6);
    assert_pixel_near(pixel_at(&buf, 512, 400, 400), quadrant_color(1, 1), 6);

    slide.close().await;
}

#[tokio::test]
async fn test_partial_read_across_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_slide(&dir, "q.tif", quadrant_slide()).await;
    let slide = Slide::open(&path).await.unwrap();

    // 128x128 window centered on the tile intersection
    let mut buf = vec![0u8; 128 * 128 * 4];
    slide
        .read_region(&mut buf, 192, 192, 0, 128, 128)
        .await
        .unwrap();

    assert_pixel_near(pixel_at(&buf, 128, 10, 10), quadrant_color(0, 0), 6);
    assert_pixel_near(pixel_at(&buf, 128, 120, 10), quadrant_color(1, 0), 6);
    assert_pixel_near(pixel_at(&buf, 128, 10, 120), quadrant_color(0, 1), 6);
    assert_pixel_near(pixel_at(&buf, 128, 120, 120), quadrant_color(1, 1), 6);

    slide.close().await;
}

#[tokio::test]
async fn test_read_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_slide(&dir, "q.tif", quadrant_slide()).await;
    let slide = Slide::open(&path).await.unwrap();

    let mut first = vec![0u8; 100 * 100 * 4];
    let mut second = vec![0u8; 100 * 100 * 4];
    slide.read_region(&mut first, 200, 200, 0, 100, 100).await.unwrap();
    slide.read_region(&mut second, 200, 200, 0, 100, 100).await.unwrap();

    assert_eq!(first, second);

    slide.close().await;
}

#[tokio::test]
async fn test_region_outside_bounds_is_background() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_slide(&dir, "q.tif", quadrant_slide()).await;
    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 32 * 32 * 4];
    slide
        .read_region(&mut buf, 100_000, 100_000, 0, 32, 32)
        .await
        .unwrap();

    let background = 0xFF000000 | slide.background_color();
    for y in 0..32 {
        for x in 0..32 {
            assert_eq!(pixel_at(&buf, 32, x, y), background);
        }
    }

    slide.close().await;
}

#[tokio::test]
async fn test_region_straddling_edge_is_clipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_slide(&dir, "q.tif", quadrant_slide()).await;
    let slide = Slide::open(&path).await.unwrap();

    // Half inside (tile (1,1)), half outside the level
    let mut buf = vec![0u8; 64 * 64 * 4];
    slide.read_region(&mut buf, 480, 480, 0, 64, 64).await.unwrap();

    assert_pixel_near(pixel_at(&buf, 64, 10, 10), quadrant_color(1, 1), 6);

    let background = 0xFF000000 | slide.background_color();
    assert_eq!(pixel_at(&buf, 64, 50, 50), background);

    slide.close().await;
}

#[tokio::test]
async fn test_invalid_level_fills_background() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_slide(&dir, "q.tif", quadrant_slide()).await;
    let slide = Slide::open(&path).await.unwrap();

    let background = 0xFF000000 | slide.background_color();

    let mut buf = vec![0u8; 8 * 8 * 4];
    slide.read_region(&mut buf, 0, 0, 99, 8, 8).await.unwrap();
    assert!(buf
        .chunks_exact(4)
        .all(|c| u32::from_ne_bytes(c.try_into().unwrap()) == background));

    // Negative extent: same contract
    buf.fill(0);
    slide.read_region(&mut buf, 0, 0, 0, -8, 8).await.unwrap();
    assert!(buf
        .chunks_exact(4)
        .all(|c| u32::from_ne_bytes(c.try_into().unwrap()) == background));

    slide.close().await;
}

#[tokio::test]
async fn test_wrong_buffer_size_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_slide(&dir, "q.tif", quadrant_slide()).await;
    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 16];
    let result = slide.read_region(&mut buf, 0, 0, 0, 100, 100).await;
    assert!(matches!(result, Err(SlideError::BadData(_))));

    // A buffer-size error is not sticky; a correct read still works
    let mut good = vec![0u8; 32 * 32 * 4];
    slide.read_region(&mut good, 0, 0, 0, 32, 32).await.unwrap();

    slide.close().await;
}

#[tokio::test]
async fn test_missing_tile_renders_from_finer_level() {
    let dir = tempfile::tempdir().unwrap();

    // Level 0: four solid quadrants. Level 1: one tile, missing.
    let mut builder = TiffBuilder::new();
    builder
        .levels
        .push(TiffLevelSpec::solid(512, 512, 256, quadrant_color));
    builder.levels.push(TiffLevelSpec {
        width: 256,
        height: 256,
        tile_width: 256,
        tile_height: 256,
        tiles: vec![Vec::new()],
    });
    let path = write_slide(&dir, "holes.svs", builder.build()).await;

    let slide = Slide::open(&path).await.unwrap();

    let mut buf = vec![0u8; 256 * 256 * 4];
    slide.read_region(&mut buf, 0, 0, 1, 256, 256).await.unwrap();

    // The missing tile shows level-0 content scaled down by 2
    assert_pixel_near(pixel_at(&buf, 256, 40, 40), quadrant_color(0, 0), 8);
    assert_pixel_near(pixel_at(&buf, 256, 200, 40), quadrant_color(1, 0), 8);
    assert_pixel_near(pixel_at(&buf, 256, 40, 200), quadrant_color(0, 1), 8);
    assert_pixel_near(pixel_at(&buf, 256, 200, 200), quadrant_color(1, 1), 8);

    slide.close().await;
}

#[tokio::test]
async fn test_missing_tile_at_level_zero_is_background() {
    let dir = tempfile::tempdir().unwrap();

    // Tile (1,0) of level 0 has no payload; there is nothing finer to
    // recurse into
    let mut builder = TiffBuilder::new();
    let mut level = TiffLevelSpec::solid(512, 512, 256, quadrant_color);
    level.tiles[1] = Vec::new();
    builder.levels.push(level);
    let path = write_slide(&dir, "holes.tif", builder.build()).await;

    let slide = Slide::open(&path).await.unwrap();
    let background = 0xFF000000 | slide.background_color();

    let mut buf = vec![0u8; 512 * 512 * 4];
    slide.read_region(&mut buf, 0, 0, 0, 512, 512).await.unwrap();

    assert_pixel_near(pixel_at(&buf, 512, 64, 64), quadrant_color(0, 0), 6);
    assert_eq!(pixel_at(&buf, 512, 400, 64), background);
    assert_pixel_near(pixel_at(&buf, 512, 400, 400), quadrant_color(1, 1), 6);

    slide.close().await;
}

#[tokio::test]
async fn test_corrupt_tile_sets_sticky_error() {
    let dir = tempfile::tempdir().unwrap();

    let mut builder = TiffBuilder::new();
    let mut level = TiffLevelSpec::solid(512, 512, 256, quadrant_color);
    // Non-empty garbage: not missing, just undecodable
    level.tiles[3] = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03];
    builder.levels.push(level);
    let path = write_slide(&dir, "corrupt.tif", builder.build()).await;

    let slide = Slide::open(&path).await.unwrap();

    // Reading only healthy tiles works
    let mut buf = vec![0u8; 64 * 64 * 4];
    slide.read_region(&mut buf, 0, 0, 0, 64, 64).await.unwrap();

    // Touching the corrupt tile fails...
    let mut big = vec![0u8; 512 * 512 * 4];
    let result = slide.read_region(&mut big, 0, 0, 0, 512, 512).await;
    assert!(result.is_err());

    // ...and the error sticks: even the previously fine region now fails
    let result = slide.read_region(&mut buf, 0, 0, 0, 64, 64).await;
    assert!(result.is_err());

    slide.close().await;
}

#[tokio::test]
async fn test_downsampled_level_read() {
    let dir = tempfile::tempdir().unwrap();

    let mut builder = TiffBuilder::new();
    builder
        .levels
        .push(TiffLevelSpec::solid(512, 512, 256, quadrant_color));
    builder.levels.push(TiffLevelSpec {
        width: 256,
        height: 256,
        tile_width: 256,
        tile_height: 256,
        tiles: vec![solid_jpeg(256, 256, [90, 120, 150])],
    });
    let path = write_slide(&dir, "pyramid.svs", builder.build()).await;

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.best_level_for_downsample(2.5), 1);

    // (x, y) are level-0 coordinates even when reading level 1
    let mut buf = vec![0u8; 128 * 128 * 4];
    slide.read_region(&mut buf, 256, 256, 1, 128, 128).await.unwrap();
    assert_pixel_near(pixel_at(&buf, 128, 64, 64), [90, 120, 150], 6);

    slide.close().await;
}
