//! JPEG 2000 decoding for Aperio tile payloads.
//!
//! Aperio stores J2K codestreams with either YCbCr (TIFF compression 33003)
//! or RGB (33005) color, and the codestream itself does not say which. The
//! caller passes the color space from the TIFF tag.
//!
//! Decoding yields three component planes whose dimensions may differ:
//! chroma planes are commonly subsampled 2:1 horizontally. The ratios are
//! recovered by dividing the full frame dimensions by each plane's own
//! dimensions. Two hot configurations take dedicated paths; anything else
//! falls back to per-pixel plane sampling.

use jpeg2k::Image;

use crate::error::SlideError;

/// Color space of a J2K tile payload, taken from the TIFF compression code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jp2kColorSpace {
    /// Components are R, G, B
    Rgb,
    /// Components are Y, Cb, Cr (BT.601)
    Ycbcr,
}

/// One decoded component plane.
#[derive(Debug, Clone)]
pub struct ComponentPlane {
    /// Plane width in samples
    pub width: u32,
    /// Plane height in samples
    pub height: u32,
    /// Row-major samples
    pub samples: Vec<i32>,
}

// BT.601 chroma coefficients in 16.16 fixed point
const FIX_CR_R: i32 = 91881; // 1.40200
const FIX_CB_G: i32 = -22554; // -0.34414
const FIX_CR_G: i32 = -46802; // -0.71414
const FIX_CB_B: i32 = 116130; // 1.77200

#[inline]
fn clamp_u8(v: i32) -> u32 {
    v.clamp(0, 255) as u32
}

#[inline]
fn pack_rgb(r: i32, g: i32, b: i32) -> u32 {
    0xFF00_0000 | (clamp_u8(r) << 16) | (clamp_u8(g) << 8) | clamp_u8(b)
}

/// Decode a J2K codestream to packed ARGB pixels.
///
/// The decoded frame must be exactly `expected_w` x `expected_h` with
/// three components; anything else is `BadData`.
pub fn decode_jp2k(
    data: &[u8],
    colorspace: Jp2kColorSpace,
    expected_w: u32,
    expected_h: u32,
) -> Result<Vec<u32>, SlideError> {
    let image = Image::from_bytes(data)
        .map_err(|e| SlideError::decode(format!("JPEG 2000 decode failed: {e}")))?;

    if image.width() != expected_w || image.height() != expected_h {
        return Err(SlideError::bad_data(format!(
            "JPEG 2000 dimensions {}x{} do not match expected {}x{}",
            image.width(),
            image.height(),
            expected_w,
            expected_h
        )));
    }

    let planes: Vec<ComponentPlane> = image
        .components()
        .iter()
        .map(|c| ComponentPlane {
            width: c.width(),
            height: c.height(),
            samples: c.data().to_vec(),
        })
        .collect();

    compose_planes(&planes, colorspace, expected_w, expected_h)
}

/// Convert three component planes into packed ARGB pixels.
///
/// Subsampling ratios are `full dimension / plane dimension` per plane and
/// axis. Fast paths cover the two configurations scanners actually emit;
/// the general path divides per pixel.
pub fn compose_planes(
    planes: &[ComponentPlane],
    colorspace: Jp2kColorSpace,
    width: u32,
    height: u32,
) -> Result<Vec<u32>, SlideError> {
    if planes.len() != 3 {
        return Err(SlideError::bad_data(format!(
            "expected 3 JPEG 2000 components, got {}",
            planes.len()
        )));
    }
    if width == 0 || height == 0 {
        return Err(SlideError::bad_data("empty JPEG 2000 frame"));
    }

    for (i, plane) in planes.iter().enumerate() {
        if plane.width == 0 || plane.height == 0 {
            return Err(SlideError::bad_data(format!("component {i} has no samples")));
        }
        if plane.samples.len() != (plane.width as usize) * (plane.height as usize) {
            return Err(SlideError::bad_data(format!(
                "component {i} has {} samples for {}x{}",
                plane.samples.len(),
                plane.width,
                plane.height
            )));
        }
    }

    // Subsampled planes of odd frames are rounded up (a 89-wide frame has a
    // 45-wide half-resolution chroma plane), so the ratio rounds up too.
    let ratios: Vec<(u32, u32)> = planes
        .iter()
        .map(|p| (width.div_ceil(p.width), height.div_ceil(p.height)))
        .collect();

    match colorspace {
        Jp2kColorSpace::Ycbcr => {
            // Fast path: luma exactly full resolution, chroma halved
            // horizontally, no vertical subsampling, both chroma planes
            // congruent
            let luma_exact = planes[0].width == width && planes[0].height == height;
            let chroma_congruent = planes[1].width == planes[2].width
                && planes[1].height == height
                && planes[2].height == height;
            if luma_exact && chroma_congruent && ratios[1] == (2, 1) && ratios[2] == (2, 1) {
                Ok(compose_ycbcr_422(planes, width, height))
            } else {
                Ok(compose_general(planes, &ratios, colorspace, width, height))
            }
        }
        Jp2kColorSpace::Rgb => {
            let all_exact = planes
                .iter()
                .all(|p| p.width == width && p.height == height);
            if all_exact {
                Ok(compose_rgb_direct(planes, width, height))
            } else {
                Ok(compose_general(planes, &ratios, colorspace, width, height))
            }
        }
    }
}

/// YCbCr with chroma halved horizontally: two luma samples share one chroma
/// pair, so the chroma contribution is computed once per pair.
fn compose_ycbcr_422(planes: &[ComponentPlane], width: u32, height: u32) -> Vec<u32> {
    let (y_plane, cb_plane, cr_plane) = (&planes[0], &planes[1], &planes[2]);
    let mut out = Vec::with_capacity((width as usize) * (height as usize));

    for row in 0..height as usize {
        let y_row = &y_plane.samples[row * width as usize..(row + 1) * width as usize];
        let chroma_row_start = row * cb_plane.width as usize;

        let mut x = 0usize;
        while x < width as usize {
            let cb = cb_plane.samples[chroma_row_start + x / 2] - 128;
            let cr = cr_plane.samples[chroma_row_start + x / 2] - 128;

            let dr = (FIX_CR_R * cr) >> 16;
            let dg = (FIX_CB_G * cb + FIX_CR_G * cr) >> 16;
            let db = (FIX_CB_B * cb) >> 16;

            let y0 = y_row[x];
            out.push(pack_rgb(y0 + dr, y0 + dg, y0 + db));

            if x + 1 < width as usize {
                let y1 = y_row[x + 1];
                out.push(pack_rgb(y1 + dr, y1 + dg, y1 + db));
            }
            x += 2;
        }
    }

    out
}

/// RGB with all components at full resolution: straight copy.
fn compose_rgb_direct(planes: &[ComponentPlane], width: u32, height: u32) -> Vec<u32> {
    let n = (width as usize) * (height as usize);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(pack_rgb(
            planes[0].samples[i],
            planes[1].samples[i],
            planes[2].samples[i],
        ));
    }
    out
}

/// General path for arbitrary subsampling: each plane is sampled with a
/// per-pixel division.
fn compose_general(
    planes: &[ComponentPlane],
    ratios: &[(u32, u32)],
    colorspace: Jp2kColorSpace,
    width: u32,
    height: u32,
) -> Vec<u32> {
    let mut out = Vec::with_capacity((width as usize) * (height as usize));

    for y in 0..height {
        for x in 0..width {
            let sample = |i: usize| -> i32 {
                let (sx, sy) = ratios[i];
                let plane = &planes[i];
                let px = (x / sx).min(plane.width - 1) as usize;
                let py = (y / sy).min(plane.height - 1) as usize;
                plane.samples[py * plane.width as usize + px]
            };

            let pixel = match colorspace {
                Jp2kColorSpace::Rgb => pack_rgb(sample(0), sample(1), sample(2)),
                Jp2kColorSpace::Ycbcr => {
                    let luma = sample(0);
                    let cb = sample(1) - 128;
                    let cr = sample(2) - 128;
                    pack_rgb(
                        luma + ((FIX_CR_R * cr) >> 16),
                        luma + ((FIX_CB_G * cb + FIX_CR_G * cr) >> 16),
                        luma + ((FIX_CB_B * cb) >> 16),
                    )
                }
            };
            out.push(pixel);
        }
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
