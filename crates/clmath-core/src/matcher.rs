//! Brute-force sliding-window template matching.
//!
//! The requested window count is spread over a near-square grid of tiles.
//! Each tile is one window position in the big image; the device scores
//! every tile in parallel by sum of absolute differences (SAD), and the host
//! drops tiles that fall outside the image.

#[cfg(feature = "metrics")]
use std::time::Instant;

use tracing::debug;

use crate::{
    ClError,
    backend::{ComputeBackend, KernelArg},
    buffer::{DeviceBuffer, Finished, Queued, Ready},
    session::{KernelKind, Session},
};

/// Score of a tile whose window leaves the big image.
pub const INVALID_SCORE: f32 = -1.0;

/// Largest per-pixel difference; pixels are 8-bit intensities stored as `i32`.
pub const MAX_PIXEL_DIFF: i64 = 255;

/// Row-major view of an integer image.
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    pixels: &'a [i32],
    height: usize,
    width: usize,
}

impl<'a> Image<'a> {
    pub fn new(pixels: &'a [i32], height: usize, width: usize) -> Result<Self, ClError> {
        if height == 0 || width == 0 {
            return Err(ClError::InvalidArgument("image dimensions must be positive"));
        }
        if i32::try_from(height).is_err() || i32::try_from(width).is_err() {
            return Err(ClError::InvalidArgument("image dimension exceeds i32::MAX"));
        }
        if height.checked_mul(width) != Some(pixels.len()) {
            return Err(ClError::InvalidArgument("pixel count does not match image shape"));
        }
        Ok(Self { pixels, height, width })
    }

    pub fn pixels(&self) -> &'a [i32] {
        self.pixels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn row(&self, y: usize) -> &'a [i32] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }
}

// ─── Tiling ──────────────────────────────────────────────────────────

/// Grid of window positions derived from a requested window count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTiling {
    pub times: usize,
    pub rows: usize,
    pub cols: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    /// SAD of a window where every pixel differs by [`MAX_PIXEL_DIFF`].
    pub max_sad: i64,
    big_h: usize,
    big_w: usize,
    tpl_h: usize,
    tpl_w: usize,
}

/// Smallest `r` with `r * r >= n`.
fn ceil_sqrt(n: usize) -> usize {
    let mut r = (n as f64).sqrt() as usize;
    while r * r < n {
        r += 1;
    }
    while r > 0 && (r - 1) * (r - 1) >= n {
        r -= 1;
    }
    r
}

/// Even spacing of `cells` windows over `span` pixels. Zero with a single
/// cell, or when the template does not fit at all.
fn stride(big: usize, tpl: usize, cells: usize) -> usize {
    match big.checked_sub(tpl) {
        Some(span) if cells > 1 => span / (cells - 1),
        _ => 0,
    }
}

impl WindowTiling {
    pub fn new(times: usize, big: &Image<'_>, template: &Image<'_>) -> Result<Self, ClError> {
        Self::for_shapes(times, (big.height, big.width), (template.height, template.width))
    }

    /// Tiling for a big image of `(height, width)` and a template of
    /// `(height, width)`.
    pub fn for_shapes(
        times: usize,
        (big_h, big_w): (usize, usize),
        (tpl_h, tpl_w): (usize, usize),
    ) -> Result<Self, ClError> {
        if times == 0 {
            return Err(ClError::InvalidArgument("requested window count must be at least 1"));
        }
        let rows = ceil_sqrt(times);
        let cols = times.div_ceil(rows);
        let max_sad = MAX_PIXEL_DIFF * (tpl_h as i64) * (tpl_w as i64);
        Ok(Self {
            times,
            rows,
            cols,
            stride_x: stride(big_w, tpl_w, cols),
            stride_y: stride(big_h, tpl_h, rows),
            max_sad,
            big_h,
            big_w,
            tpl_h,
            tpl_w,
        })
    }

    /// Number of tiles scored, `rows * cols`; never less than `times`.
    pub fn tile_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Top-left corner `(x, y)` of `tile`, row-major.
    pub fn origin(&self, tile: usize) -> (usize, usize) {
        let row = tile / self.cols;
        let col = tile % self.cols;
        (col * self.stride_x, row * self.stride_y)
    }

    /// `false` when the template is larger than the big image in either
    /// dimension; every tile is then invalid.
    pub fn template_fits(&self) -> bool {
        self.tpl_h <= self.big_h && self.tpl_w <= self.big_w
    }

    fn window_in_bounds(&self, x0: usize, y0: usize) -> bool {
        y0 + self.tpl_h <= self.big_h && x0 + self.tpl_w <= self.big_w
    }

    /// Integer kernel arguments, in slot order after each image buffer.
    fn kernel_scalars(&self) -> Result<SlideScalars, ClError> {
        let int = |v: usize| {
            i32::try_from(v).map_err(|_| ClError::InvalidArgument("tiling value exceeds i32::MAX"))
        };
        let tile_count = self.rows.checked_mul(self.cols).and_then(|n| i32::try_from(n).ok());
        if tile_count.is_none() {
            return Err(ClError::InvalidArgument("tile count exceeds i32::MAX"));
        }
        let last_x = (self.cols - 1).checked_mul(self.stride_x).map(|x| x + self.tpl_w);
        let last_y = (self.rows - 1).checked_mul(self.stride_y).map(|y| y + self.tpl_h);
        if last_x.and_then(|x| i32::try_from(x).ok()).is_none()
            || last_y.and_then(|y| i32::try_from(y).ok()).is_none()
        {
            return Err(ClError::InvalidArgument("window coordinates exceed i32::MAX"));
        }
        Ok(SlideScalars {
            big_w: int(self.big_w)?,
            big_h: int(self.big_h)?,
            tpl_w: int(self.tpl_w)?,
            tpl_h: int(self.tpl_h)?,
            rows: int(self.rows)?,
            cols: int(self.cols)?,
            stride_x: int(self.stride_x)?,
            stride_y: int(self.stride_y)?,
            max_sad: i32::try_from(self.max_sad)
                .map_err(|_| ClError::InvalidArgument("template too large for 32-bit SAD bound"))?,
        })
    }
}

struct SlideScalars {
    big_w: i32,
    big_h: i32,
    tpl_w: i32,
    tpl_h: i32,
    rows: i32,
    cols: i32,
    stride_x: i32,
    stride_y: i32,
    max_sad: i32,
}

// ─── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowResult {
    /// `1 - SAD / max_sad`: 1.0 for an exact match, negative for very poor
    /// ones, [`INVALID_SCORE`] for windows outside the image.
    pub score: f32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl WindowResult {
    pub const INVALID: WindowResult =
        WindowResult { score: INVALID_SCORE, x: 0, y: 0, width: 0, height: 0 };

    pub fn from_raw(score: f32, [x, y, width, height]: [i32; 4]) -> Self {
        Self { score, x, y, width, height }
    }

    pub fn geometry(&self) -> [i32; 4] {
        [self.x, self.y, self.width, self.height]
    }

    /// Kept by compaction; the sentinel and anything below zero is not.
    pub fn is_valid(&self) -> bool {
        self.score >= 0.0
    }
}

/// Scores the window with top-left corner `(x0, y0)`, or returns
/// [`WindowResult::INVALID`] when it does not fit inside `big`.
pub fn score_window(
    big: &Image<'_>,
    template: &Image<'_>,
    x0: usize,
    y0: usize,
    max_sad: i64,
) -> WindowResult {
    if y0 + template.height > big.height || x0 + template.width > big.width {
        return WindowResult::INVALID;
    }
    let mut sad: i64 = 0;
    for u in 0..template.height {
        let a = &big.row(y0 + u)[x0..x0 + template.width];
        let b = template.row(u);
        sad += a
            .iter()
            .zip(b)
            .map(|(&p, &q)| (i64::from(p) - i64::from(q)).abs())
            .sum::<i64>();
    }
    WindowResult {
        score: 1.0 - sad as f32 / max_sad as f32,
        x: x0 as i32,
        y: y0 as i32,
        width: template.width as i32,
        height: template.height as i32,
    }
}

/// Host version of one work-item of the matching kernel.
pub fn evaluate_tile(
    big: &Image<'_>,
    template: &Image<'_>,
    tiling: &WindowTiling,
    tile: usize,
) -> WindowResult {
    let (x0, y0) = tiling.origin(tile);
    if !tiling.window_in_bounds(x0, y0) {
        return WindowResult::INVALID;
    }
    score_window(big, template, x0, y0, tiling.max_sad)
}

/// Drops invalid tiles, keeps scan order, and stops after `limit` results.
pub fn compact<I>(tiles: I, limit: usize) -> Vec<WindowResult>
where
    I: IntoIterator<Item = WindowResult>,
{
    tiles.into_iter().filter(WindowResult::is_valid).take(limit).collect()
}

// ─── Search ──────────────────────────────────────────────────────────

/// [`search_on`] device 0.
pub fn search<B: ComputeBackend>(
    session: &Session<B>,
    big: Image<'_>,
    template: Image<'_>,
    times: usize,
) -> Result<Vec<WindowResult>, ClError> {
    search_on(session, big, template, times, 0)
}

/// Scores `times` (rounded up to a full grid) windows of `big` against
/// `template` on device `device_index`. Returns at most `times` valid
/// windows in row-major tile order.
#[tracing::instrument(
    level = "debug",
    skip(session, big, template),
    fields(big = ?(big.height, big.width), template = ?(template.height, template.width))
)]
pub fn search_on<B: ComputeBackend>(
    session: &Session<B>,
    big: Image<'_>,
    template: Image<'_>,
    times: usize,
    device_index: usize,
) -> Result<Vec<WindowResult>, ClError> {
    let tiling = WindowTiling::new(times, &big, &template)?;
    let scalars = tiling.kernel_scalars()?;
    let queue = session.queue(device_index)?;
    let total = tiling.tile_count();
    debug!(rows = tiling.rows, cols = tiling.cols, total, "tiling computed");

    #[cfg(feature = "metrics")]
    let t = Instant::now();

    let backend = session.backend();
    let context = session.context();
    let d_big =
        DeviceBuffer::<B, Ready>::from_slice(backend, context, bytemuck::cast_slice(big.pixels()))?;
    let d_tpl = DeviceBuffer::<B, Ready>::from_slice(
        backend,
        context,
        bytemuck::cast_slice(template.pixels()),
    )?;
    let d_scores =
        DeviceBuffer::<B, Queued>::new(backend, context, total * size_of::<f32>())?.launch();
    let d_infos =
        DeviceBuffer::<B, Queued>::new(backend, context, total * size_of::<[i32; 4]>())?.launch();

    {
        let args = [
            KernelArg::Mem(d_big.raw()),
            KernelArg::Int(scalars.big_w),
            KernelArg::Int(scalars.big_h),
            KernelArg::Mem(d_tpl.raw()),
            KernelArg::Int(scalars.tpl_w),
            KernelArg::Int(scalars.tpl_h),
            KernelArg::Int(scalars.rows),
            KernelArg::Int(scalars.cols),
            KernelArg::Int(scalars.stride_x),
            KernelArg::Int(scalars.stride_y),
            KernelArg::Int(scalars.max_sad),
            KernelArg::Mem(d_scores.raw()),
            KernelArg::Mem(d_infos.raw()),
        ];
        let mut kernel = session.lock_kernel(KernelKind::Slide);
        for (index, arg) in (0u32..).zip(args) {
            backend.set_kernel_arg(&mut kernel, index, arg)?;
        }
        backend.enqueue_kernel(queue, &kernel, total)?;
    }

    let fence = Finished::wait(backend, queue)?;
    let d_scores = d_scores.into_ready(&fence);
    let d_infos = d_infos.into_ready(&fence);

    let mut scores = vec![0.0f32; total];
    let mut infos = vec![[0i32; 4]; total];
    d_scores.read_into(backend, queue, bytemuck::cast_slice_mut(&mut scores))?;
    d_infos.read_into(backend, queue, bytemuck::cast_slice_mut(&mut infos))?;

    #[cfg(feature = "metrics")]
    crate::record("search", t);

    let hits = compact(
        scores.into_iter().zip(infos).map(|(s, g)| WindowResult::from_raw(s, g)),
        times,
    );
    debug!(valid = hits.len(), "search finished");
    Ok(hits)
}

/// The whole search on the host, tile by tile.
pub fn search_host(
    big: Image<'_>,
    template: Image<'_>,
    times: usize,
) -> Result<Vec<WindowResult>, ClError> {
    let tiling = WindowTiling::new(times, &big, &template)?;
    Ok(compact(
        (0..tiling.tile_count()).map(|tile| evaluate_tile(&big, &template, &tiling, tile)),
        times,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn gradient(h: usize, w: usize) -> Vec<i32> {
        (0..h * w).map(|i| ((i * 7) % 256) as i32).collect()
    }

    #[test]
    fn ceil_sqrt_small_values() {
        let expected = [0, 1, 2, 2, 2, 3, 3, 3, 3, 3, 4];
        for (n, &r) in expected.iter().enumerate() {
            assert_eq!(ceil_sqrt(n), r, "n = {n}");
        }
    }

    #[test]
    fn four_windows_on_four_by_four() {
        let tiling = WindowTiling::for_shapes(4, (4, 4), (2, 2)).unwrap();
        assert_eq!((tiling.rows, tiling.cols), (2, 2));
        assert_eq!((tiling.stride_x, tiling.stride_y), (2, 2));
        assert_eq!(tiling.max_sad, 255 * 4);
        let origins: Vec<_> = (0..4).map(|t| tiling.origin(t)).collect();
        assert_eq!(origins, vec![(0, 0), (2, 0), (0, 2), (2, 2)]);
    }

    #[test]
    fn single_window_has_zero_stride() {
        let tiling = WindowTiling::for_shapes(1, (10, 20), (3, 3)).unwrap();
        assert_eq!((tiling.rows, tiling.cols), (1, 1));
        assert_eq!((tiling.stride_x, tiling.stride_y), (0, 0));
        assert_eq!(tiling.origin(0), (0, 0));
    }

    #[test]
    fn oversized_template_gets_zero_stride() {
        let tiling = WindowTiling::for_shapes(9, (4, 4), (5, 2)).unwrap();
        assert!(!tiling.template_fits());
        assert_eq!(tiling.stride_y, 0);
        assert_eq!(tiling.stride_x, 1);
    }

    #[test]
    fn zero_times_is_rejected() {
        assert!(matches!(
            WindowTiling::for_shapes(0, (4, 4), (2, 2)),
            Err(ClError::InvalidArgument(_))
        ));
    }

    #[test]
    fn image_shape_is_checked() {
        let pixels = [0; 6];
        assert!(Image::new(&pixels, 2, 3).is_ok());
        assert!(Image::new(&pixels, 3, 3).is_err());
        assert!(Image::new(&[], 0, 3).is_err());
    }

    #[test]
    fn exact_sub_block_scores_one() {
        let big_px = gradient(6, 6);
        let big = Image::new(&big_px, 6, 6).unwrap();
        let tpl_px: Vec<i32> = (0..2)
            .flat_map(|u| big_px[(3 + u) * 6 + 2..(3 + u) * 6 + 5].to_vec())
            .collect();
        let tpl = Image::new(&tpl_px, 2, 3).unwrap();
        let hit = score_window(&big, &tpl, 2, 3, 255 * 6);
        assert_eq!(hit.score, 1.0);
        assert_eq!(hit.geometry(), [2, 3, 3, 2]);
    }

    #[test]
    fn worst_case_scores_zero() {
        let big_px = vec![255; 4];
        let tpl_px = vec![0; 4];
        let big = Image::new(&big_px, 2, 2).unwrap();
        let tpl = Image::new(&tpl_px, 2, 2).unwrap();
        assert_eq!(score_window(&big, &tpl, 0, 0, 255 * 4).score, 0.0);
    }

    #[test]
    fn out_of_bounds_window_is_sentinel() {
        let big_px = gradient(4, 4);
        let tpl_px = gradient(2, 2);
        let big = Image::new(&big_px, 4, 4).unwrap();
        let tpl = Image::new(&tpl_px, 2, 2).unwrap();
        let result = score_window(&big, &tpl, 3, 0, 255 * 4);
        assert_eq!(result, WindowResult::INVALID);
        assert!(!result.is_valid());
    }

    #[test]
    fn compact_keeps_order_and_limit() {
        let tiles = [
            WindowResult::from_raw(0.5, [0, 0, 2, 2]),
            WindowResult::INVALID,
            WindowResult::from_raw(0.9, [2, 0, 2, 2]),
            WindowResult::from_raw(0.1, [0, 2, 2, 2]),
        ];
        let kept = compact(tiles, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].geometry(), [0, 0, 2, 2]);
        assert_eq!(kept[1].geometry(), [2, 0, 2, 2]);
    }

    #[test]
    fn negative_but_valid_scores_are_dropped_by_sign_only() {
        // Scores below zero share the filter with the sentinel.
        let kept = compact([WindowResult::from_raw(-0.25, [1, 1, 1, 1])], 4);
        assert!(kept.is_empty());
    }

    #[test]
    fn host_search_on_four_by_four() {
        let big_px = gradient(4, 4);
        let tpl_px = gradient(2, 2);
        let big = Image::new(&big_px, 4, 4).unwrap();
        let tpl = Image::new(&tpl_px, 2, 2).unwrap();
        let hits = search_host(big, tpl, 4).unwrap();
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].geometry(), [0, 0, 2, 2]);
        assert_eq!(hits[3].geometry(), [2, 2, 2, 2]);
    }

    proptest! {
        #[test]
        fn tiling_covers_requested_count(times in 1usize..5000, bh in 1usize..64, bw in 1usize..64, th in 1usize..64, tw in 1usize..64) {
            let tiling = WindowTiling::for_shapes(times, (bh, bw), (th, tw)).unwrap();
            prop_assert!(tiling.rows * tiling.cols >= times);
            prop_assert_eq!(tiling.rows, ceil_sqrt(times));
            prop_assert!(tiling.rows * tiling.rows >= times);
            prop_assert!((tiling.rows - 1) * (tiling.rows - 1) < times);
        }

        #[test]
        fn fitting_template_keeps_every_tile_in_bounds(times in 1usize..400, bh in 1usize..48, bw in 1usize..48, th in 1usize..48, tw in 1usize..48) {
            prop_assume!(th <= bh && tw <= bw);
            let tiling = WindowTiling::for_shapes(times, (bh, bw), (th, tw)).unwrap();
            for tile in 0..tiling.tile_count() {
                let (x, y) = tiling.origin(tile);
                prop_assert!(x + tw <= bw && y + th <= bh);
            }
        }
    }
}
