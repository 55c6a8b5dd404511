//! Test utilities: synthetic slide containers built in temp directories.

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// The scanner software's fixed metadata secret.
const TRON_SECRET: &[u8] = b"iNteMedIc@TrOnSlide#2016";

// =============================================================================
// JPEG helpers
// =============================================================================

/// Encode a solid-color RGB JPEG.
pub fn solid_jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, 95);
    encoder.encode_image(&img).unwrap();
    buf
}

/// Read the native-endian ARGB pixel at `(x, y)` from a region buffer.
pub fn pixel_at(buf: &[u8], width: u32, x: u32, y: u32) -> u32 {
    let i = ((y * width + x) * 4) as usize;
    u32::from_ne_bytes(buf[i..i + 4].try_into().unwrap())
}

/// Assert a pixel is within JPEG tolerance of an RGB color.
pub fn assert_pixel_near(pixel: u32, rgb: [u8; 3], tolerance: i32) {
    assert_eq!(pixel >> 24, 0xFF, "pixel 0x{pixel:08X} is not opaque");
    let channels = [
        ((pixel >> 16) & 0xFF) as i32,
        ((pixel >> 8) & 0xFF) as i32,
        (pixel & 0xFF) as i32,
    ];
    for (actual, expected) in channels.iter().zip(rgb) {
        assert!(
            (actual - expected as i32).abs() <= tolerance,
            "pixel 0x{pixel:08X} not within {tolerance} of {rgb:?}"
        );
    }
}

// =============================================================================
// TIFF builder
// =============================================================================

/// One pyramid level of a synthetic tiled TIFF.
pub struct TiffLevelSpec {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,

    /// Row-major tile payloads; an empty payload marks a missing tile
    pub tiles: Vec<Vec<u8>>,
}

impl TiffLevelSpec {
    /// A level whose tiles are solid-color JPEGs produced by `color_of`.
    pub fn solid(
        width: u32,
        height: u32,
        tile: u32,
        color_of: impl Fn(u32, u32) -> [u8; 3],
    ) -> Self {
        let tiles_x = width.div_ceil(tile);
        let tiles_y = height.div_ceil(tile);
        let mut tiles = Vec::new();
        for row in 0..tiles_y {
            for col in 0..tiles_x {
                tiles.push(solid_jpeg(tile, tile, color_of(col, row)));
            }
        }
        Self {
            width,
            height,
            tile_width: tile,
            tile_height: tile,
            tiles,
        }
    }
}

/// Builder for little-endian classic TIFF slide files.
pub struct TiffBuilder {
    pub levels: Vec<TiffLevelSpec>,

    /// ImageDescription of the first level (vendor marker lives here)
    pub description: Option<String>,

    /// Uncompressed solid-color thumbnail `(width, height, rgb)`
    pub thumbnail: Option<(u32, u32, [u8; 3])>,
}

impl TiffBuilder {
    pub fn new() -> Self {
        Self {
            levels: Vec::new(),
            description: None,
            thumbnail: None,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(!self.levels.is_empty());

        let mut out = Vec::new();
        // Header; the first-IFD offset is patched at the end
        out.extend_from_slice(&[0x49, 0x49, 0x2A, 0x00, 0, 0, 0, 0]);

        // Data region: tile payloads and their location arrays. A
        // single-element array is stored inline in its IFD entry, so the
        // entry then carries the value itself rather than an array offset.
        struct LevelRefs {
            offsets_entry: u32,
            counts_entry: u32,
            count: u32,
        }
        let mut level_refs = Vec::new();

        for level in &self.levels {
            let mut offsets = Vec::new();
            let mut counts = Vec::new();
            for tile in &level.tiles {
                offsets.push(out.len() as u32);
                counts.push(tile.len() as u32);
                out.extend_from_slice(tile);
            }

            let (offsets_entry, counts_entry) = if offsets.len() == 1 {
                (offsets[0], counts[0])
            } else {
                let offsets_at = out.len() as u32;
                for v in &offsets {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                let counts_at = out.len() as u32;
                for v in &counts {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                (offsets_at, counts_at)
            };

            level_refs.push(LevelRefs {
                offsets_entry,
                counts_entry,
                count: offsets.len() as u32,
            });
        }

        let description_at = self.description.as_ref().map(|text| {
            let at = out.len() as u32;
            out.extend_from_slice(text.as_bytes());
            out.push(0);
            (at, text.len() as u32 + 1)
        });

        let thumbnail_at = self.thumbnail.map(|(w, h, rgb)| {
            let at = out.len() as u32;
            for _ in 0..(w * h) {
                out.extend_from_slice(&rgb);
            }
            (at, w * h * 3)
        });

        // IFD chain
        let ifd_count = self.levels.len() + usize::from(self.thumbnail.is_some());
        let first_ifd = out.len() as u32;
        out[4..8].copy_from_slice(&first_ifd.to_le_bytes());

        let mut written = 0usize;
        for (i, level) in self.levels.iter().enumerate() {
            let refs = &level_refs[i];
            let mut entries: Vec<[u8; 12]> = Vec::new();

            entries.push(entry(256, 4, 1, level.width));
            entries.push(entry(257, 4, 1, level.height));
            entries.push(entry(259, 3, 1, 7));
            if i == 0 {
                if let Some((at, len)) = description_at {
                    entries.push(entry(270, 2, len, at));
                }
            }
            entries.push(entry(322, 4, 1, level.tile_width));
            entries.push(entry(323, 4, 1, level.tile_height));
            entries.push(entry(324, 4, refs.count, refs.offsets_entry));
            entries.push(entry(325, 4, refs.count, refs.counts_entry));

            written += 1;
            let is_last = written == ifd_count;
            write_ifd(&mut out, &entries, is_last);
        }

        if let Some((at, _)) = thumbnail_at {
            let (w, h, _) = self.thumbnail.unwrap();
            let entries = vec![
                entry(256, 4, 1, w),
                entry(257, 4, 1, h),
                entry(259, 3, 1, 1),
                entry(273, 4, 1, at),
                entry(278, 4, 1, h),
                entry(279, 4, 1, w * h * 3),
            ];
            write_ifd(&mut out, &entries, true);
        }

        out
    }
}

/// Encode one classic IFD entry.
///
/// Single LONG/SHORT values are inline; multi-value LONG arrays store the
/// given offset, matching how the builder lays arrays out.
fn entry(tag: u16, ftype: u16, count: u32, value_or_offset: u32) -> [u8; 12] {
    let mut bytes = [0u8; 12];
    bytes[0..2].copy_from_slice(&tag.to_le_bytes());
    bytes[2..4].copy_from_slice(&ftype.to_le_bytes());
    bytes[4..8].copy_from_slice(&count.to_le_bytes());
    bytes[8..12].copy_from_slice(&value_or_offset.to_le_bytes());
    bytes
}

fn write_ifd(out: &mut Vec<u8>, entries: &[[u8; 12]], is_last: bool) {
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for e in entries {
        out.extend_from_slice(e);
    }
    let next = if is_last {
        0u32
    } else {
        out.len() as u32 + 4
    };
    out.extend_from_slice(&next.to_le_bytes());
}

// =============================================================================
// ZIP builder
// =============================================================================

const LOCAL_SIG: u32 = 0x0403_4B50;
const CENTRAL_SIG: u32 = 0x0201_4B50;
const EOCD_SIG: u32 = 0x0605_4B50;

/// Minimal stored-entry ZIP writer for synthetic containers.
pub struct ZipBuilder {
    data: Vec<u8>,
    central: Vec<u8>,
    count: u16,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            central: Vec::new(),
            count: 0,
        }
    }

    pub fn add(&mut self, name: &str, contents: &[u8]) {
        let header_offset = self.data.len() as u32;

        self.data.extend_from_slice(&LOCAL_SIG.to_le_bytes());
        self.data.extend_from_slice(&20u16.to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes()); // stored
        self.data.extend_from_slice(&[0u8; 4]);
        self.data.extend_from_slice(&0u32.to_le_bytes());
        self.data
            .extend_from_slice(&(contents.len() as u32).to_le_bytes());
        self.data
            .extend_from_slice(&(contents.len() as u32).to_le_bytes());
        self.data
            .extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.extend_from_slice(name.as_bytes());
        self.data.extend_from_slice(contents);

        self.central.extend_from_slice(&CENTRAL_SIG.to_le_bytes());
        self.central.extend_from_slice(&20u16.to_le_bytes());
        self.central.extend_from_slice(&20u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes()); // stored
        self.central.extend_from_slice(&[0u8; 4]);
        self.central.extend_from_slice(&0u32.to_le_bytes());
        self.central
            .extend_from_slice(&(contents.len() as u32).to_le_bytes());
        self.central
            .extend_from_slice(&(contents.len() as u32).to_le_bytes());
        self.central
            .extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u32.to_le_bytes());
        self.central
            .extend_from_slice(&header_offset.to_le_bytes());
        self.central.extend_from_slice(name.as_bytes());

        self.count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        let cd_offset = self.data.len() as u32;
        let cd_size = self.central.len() as u32;
        self.data.extend_from_slice(&self.central);

        self.data.extend_from_slice(&EOCD_SIG.to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.extend_from_slice(&self.count.to_le_bytes());
        self.data.extend_from_slice(&self.count.to_le_bytes());
        self.data.extend_from_slice(&cd_size.to_le_bytes());
        self.data.extend_from_slice(&cd_offset.to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data
    }
}

// =============================================================================
// Tron metadata encryption
// =============================================================================

/// Encrypt a metadata payload the way the scanner software does:
/// `[sha256(plaintext)] [salt] [iv] [AES-256-CBC ciphertext]`.
pub fn encrypt_tron_metadata(plaintext: &[u8], salt: [u8; 16], iv: [u8; 16]) -> Vec<u8> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(TRON_SECRET, &salt, 2000, &mut key);

    let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut blob = Vec::new();
    blob.extend_from_slice(&Sha256::digest(plaintext));
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    blob
}
