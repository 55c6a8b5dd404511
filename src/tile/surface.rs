//! Minimal 2-D drawing surface over caller-owned ARGB pixels.
//!
//! Region reads compose tiles into the destination buffer through this
//! surface: a current transform (translate + scale only, with a save stack),
//! solid rectangle fills, and image painting with two composition
//! operators. Scaling is nearest-neighbor; tile composition never
//! interpolates.
//!
//! Pixels are non-premultiplied `0xAARRGGBB`.

/// Composition operator applied by paint and fill operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Source-over-destination alpha blending (the default)
    Over,

    /// Disjoint union: source contributes only where the destination has
    /// remaining transparency. Used when a region is assembled from
    /// adjacent scaled pieces whose edges would otherwise double-blend.
    Saturate,
}

/// Translate + scale transform mapping user space to device space.
#[derive(Debug, Clone, Copy)]
struct Transform {
    sx: f64,
    sy: f64,
    tx: f64,
    ty: f64,
}

impl Transform {
    const IDENTITY: Transform = Transform {
        sx: 1.0,
        sy: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    #[inline]
    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.sx * x + self.tx, self.sy * y + self.ty)
    }
}

/// Drawing surface over external pixel memory.
///
/// The buffer length must equal `width * height`.
pub struct Surface<'a> {
    data: &'a mut [u32],
    width: u32,
    height: u32,
    transform: Transform,
    saved: Vec<(Transform, Operator)>,
    operator: Operator,
}

impl<'a> Surface<'a> {
    /// Wrap a pixel buffer as a surface with the identity transform.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn new(data: &'a mut [u32], width: u32, height: u32) -> Self {
        assert_eq!(
            data.len(),
            (width as usize) * (height as usize),
            "surface buffer does not match dimensions"
        );
        Surface {
            data,
            width,
            height,
            transform: Transform::IDENTITY,
            saved: Vec::new(),
            operator: Operator::Over,
        }
    }

    /// Surface width in device pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Surface height in device pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Current composition operator.
    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Set the composition operator for subsequent paints and fills.
    pub fn set_operator(&mut self, operator: Operator) {
        self.operator = operator;
    }

    /// Push the current transform and operator onto the save stack.
    pub fn save(&mut self) {
        self.saved.push((self.transform, self.operator));
    }

    /// Pop the most recently saved transform and operator.
    ///
    /// Restoring with an empty stack resets to the defaults.
    pub fn restore(&mut self) {
        let (transform, operator) = self
            .saved
            .pop()
            .unwrap_or((Transform::IDENTITY, Operator::Over));
        self.transform = transform;
        self.operator = operator;
    }

    /// Translate user space by `(dx, dy)`.
    pub fn translate(&mut self, dx: f64, dy: f64) {
        self.transform.tx += self.transform.sx * dx;
        self.transform.ty += self.transform.sy * dy;
    }

    /// Scale user space by `(sx, sy)`.
    pub fn scale(&mut self, sx: f64, sy: f64) {
        self.transform.sx *= sx;
        self.transform.sy *= sy;
    }

    /// Fill the entire buffer with a color, ignoring transform and operator.
    pub fn clear(&mut self, argb: u32) {
        self.data.fill(argb);
    }

    /// Set a user-space rectangle to fully transparent, ignoring the
    /// operator.
    ///
    /// Used before a recursive fill so that composition can tell which
    /// pixels have been produced and which still need covering.
    pub fn clear_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        if w <= 0.0 || h <= 0.0 {
            return;
        }
        let (dx0, dy0) = self.transform.apply(x, y);
        let (dx1, dy1) = self.transform.apply(x + w, y + h);

        let px0 = dx0.floor().max(0.0) as i64;
        let py0 = dy0.floor().max(0.0) as i64;
        let px1 = (dx1.ceil() as i64).min(self.width as i64);
        let py1 = (dy1.ceil() as i64).min(self.height as i64);

        for py in py0..py1 {
            let row = (py as usize) * (self.width as usize);
            for px in px0..px1 {
                self.data[row + px as usize] = 0;
            }
        }
    }

    /// Composite a background color under every not-fully-opaque pixel,
    /// flattening the buffer to full opacity.
    pub fn flatten_onto(&mut self, background: u32) {
        for pixel in self.data.iter_mut() {
            let alpha = *pixel >> 24;
            if alpha == 255 {
                continue;
            }
            *pixel = composite(Operator::Over, background, *pixel);
        }
    }

    /// Fill a user-space rectangle with a solid color using the current
    /// operator.
    pub fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, argb: u32) {
        if w <= 0.0 || h <= 0.0 {
            return;
        }
        let (dx0, dy0) = self.transform.apply(x, y);
        let (dx1, dy1) = self.transform.apply(x + w, y + h);

        let px0 = dx0.floor().max(0.0) as i64;
        let py0 = dy0.floor().max(0.0) as i64;
        let px1 = (dx1.ceil() as i64).min(self.width as i64);
        let py1 = (dy1.ceil() as i64).min(self.height as i64);

        for py in py0..py1 {
            for px in px0..px1 {
                let idx = (py as usize) * (self.width as usize) + px as usize;
                self.data[idx] = composite(self.operator, self.data[idx], argb);
            }
        }
    }

    /// Paint an ARGB image with its top-left corner at the user-space
    /// origin, scaled by the current transform.
    ///
    /// Device pixels are mapped back into the source with nearest-neighbor
    /// sampling; anything outside the source footprint or the surface is
    /// clipped.
    pub fn paint_image(&mut self, src: &[u32], src_w: u32, src_h: u32) {
        if src_w == 0 || src_h == 0 || self.transform.sx <= 0.0 || self.transform.sy <= 0.0 {
            return;
        }
        debug_assert_eq!(src.len(), (src_w as usize) * (src_h as usize));

        let (dx0, dy0) = self.transform.apply(0.0, 0.0);
        let (dx1, dy1) = self.transform.apply(src_w as f64, src_h as f64);

        let px0 = dx0.floor().max(0.0) as i64;
        let py0 = dy0.floor().max(0.0) as i64;
        let px1 = (dx1.ceil() as i64).min(self.width as i64);
        let py1 = (dy1.ceil() as i64).min(self.height as i64);

        let inv_sx = 1.0 / self.transform.sx;
        let inv_sy = 1.0 / self.transform.sy;

        for py in py0..py1 {
            let v = ((py as f64 + 0.5) - self.transform.ty) * inv_sy;
            if v < 0.0 {
                continue;
            }
            let sj = v as u32;
            if sj >= src_h {
                continue;
            }
            let src_row = &src[(sj as usize) * (src_w as usize)..];
            for px in px0..px1 {
                let u = ((px as f64 + 0.5) - self.transform.tx) * inv_sx;
                if u < 0.0 {
                    continue;
                }
                let si = u as u32;
                if si >= src_w {
                    continue;
                }
                let idx = (py as usize) * (self.width as usize) + px as usize;
                self.data[idx] = composite(self.operator, self.data[idx], src_row[si as usize]);
            }
        }
    }
}

/// Composite one source pixel onto a destination pixel.
fn composite(operator: Operator, dst: u32, src: u32) -> u32 {
    let sa = src >> 24;
    let da = dst >> 24;

    match operator {
        Operator::Over => {
            if sa == 255 {
                return src;
            }
            if sa == 0 {
                return dst;
            }
            let out_a = sa + da * (255 - sa) / 255;
            if out_a == 0 {
                return 0;
            }
            let blend = |sc: u32, dc: u32| -> u32 {
                (sc * sa * 255 + dc * da * (255 - sa)) / (out_a * 255)
            };
            let r = blend((src >> 16) & 0xFF, (dst >> 16) & 0xFF);
            let g = blend((src >> 8) & 0xFF, (dst >> 8) & 0xFF);
            let b = blend(src & 0xFF, dst & 0xFF);
            (out_a << 24) | (r << 16) | (g << 8) | b
        }
        Operator::Saturate => {
            // Source fills only the destination's remaining transparency
            let add = sa.min(255 - da);
            if add == 0 {
                return dst;
            }
            let out_a = da + add;
            let blend = |sc: u32, dc: u32| -> u32 { (dc * da + sc * add) / out_a };
            let r = blend((src >> 16) & 0xFF, (dst >> 16) & 0xFF);
            let g = blend((src >> 8) & 0xFF, (dst >> 8) & 0xFF);
            let b = blend(src & 0xFF, dst & 0xFF);
            (out_a << 24) | (r << 16) | (g << 8) | b
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
