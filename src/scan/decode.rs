//! Code reader for retail barcodes (EAN-13 / EAN-8, UPC-A read as EAN-13)
//! and QR codes.
//!
//! Linear pipeline: RGBA → luma → global Otsu threshold → horizontal scanlines
//! fanning out from the middle row → run lengths → guard and digit pattern
//! matching → check digit. Each scanline is also read right-to-left so a label
//! photographed upside down still decodes.
//!
//! When no linear symbol is found the same luma plane goes to `rqrr`, which
//! locates QR finder patterns, samples the grid and applies error correction.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Luma weights, Y = (76*R + 150*G + 29*B) >> 8.
const COEF_R: u32 = 76;
const COEF_G: u32 = 150;
const COEF_B: u32 = 29;

const MAX_AVG_VARIANCE: f32 = 0.48;
const MAX_INDIVIDUAL_VARIANCE: f32 = 0.7;

/// Light/dark module widths of the L-code digits, starting with a light module.
/// R-codes share the widths but start dark; G-codes are the widths reversed.
const L_WIDTHS: [[u32; 4]; 10] = [
    [3, 2, 1, 1],
    [2, 2, 2, 1],
    [2, 1, 2, 2],
    [1, 4, 1, 1],
    [1, 1, 3, 2],
    [1, 2, 3, 1],
    [1, 1, 1, 4],
    [1, 3, 1, 2],
    [1, 2, 1, 3],
    [3, 1, 1, 2],
];

/// L/G parity of the six left-hand EAN-13 digits, indexed by the implied first digit.
/// Bit (5 - i) set means digit i is G-coded.
const FIRST_DIGIT_PARITY: [u8; 10] = [0x00, 0x0B, 0x0D, 0x0E, 0x13, 0x19, 0x1C, 0x15, 0x16, 0x1A];

const GUARD: [u32; 3] = [1, 1, 1];
const MIDDLE_GUARD: [u32; 5] = [1, 1, 1, 1, 1];

/// Minimum light margin on either side of a symbol, in modules.
const QUIET_ZONE_MODULES: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbology {
    #[serde(rename = "EAN-13")]
    Ean13,
    #[serde(rename = "EAN-8")]
    Ean8,
    #[serde(rename = "QR")]
    Qr,
}

impl Symbology {
    const LINEAR: [Symbology; 2] = [Symbology::Ean13, Symbology::Ean8];

    fn digits(self) -> usize {
        match self {
            Self::Ean13 => 13,
            Self::Ean8 => 8,
            // matrix symbol, not read by the scanline path
            Self::Qr => 0,
        }
    }

    /// Runs from the first start-guard bar through the last end-guard bar.
    fn runs(self) -> usize {
        let half = (self.digits() / 2) * 4;
        3 + half + 5 + half + 3
    }
}

impl fmt::Display for Symbology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ean13 => "EAN-13",
            Self::Ean8 => "EAN-8",
            Self::Qr => "QR",
        })
    }
}

/// A decoded barcode value. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedCode {
    value: String,
    format: Symbology,
}

impl DecodedCode {
    pub fn new(value: impl Into<String>, format: Symbology) -> Option<Self> {
        let value = value.into();
        if value.is_empty() {
            return None;
        }
        Some(Self { value, format })
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn format(&self) -> Symbology {
        self.format
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BarcodeDecoder {
    max_scanlines: usize,
}

impl Default for BarcodeDecoder {
    fn default() -> Self {
        Self { max_scanlines: 24 }
    }
}

impl BarcodeDecoder {
    /// Reads at most one code from an RGBA buffer. Linear symbols are tried
    /// first, then QR. Returns `None` when nothing decodes cleanly or the
    /// buffer does not match the dimensions.
    pub fn decode(&self, pixels: &[u8], width: usize, height: usize) -> Option<DecodedCode> {
        if width == 0 || height == 0 || width.checked_mul(height)?.checked_mul(4)? != pixels.len() {
            return None;
        }

        let gray = rgba_to_luma(pixels);
        let threshold = otsu_threshold(&gray);

        for y in scanline_rows(height, self.max_scanlines) {
            let row = &gray[y * width..(y + 1) * width];

            let forward = run_lengths(row.iter().map(|&p| p < threshold));
            if let Some(code) = scan_row(&forward) {
                return Some(code);
            }
            let backward = run_lengths(row.iter().rev().map(|&p| p < threshold));
            if let Some(code) = scan_row(&backward) {
                return Some(code);
            }
        }
        decode_qr(&gray, width, height)
    }
}

fn decode_qr(gray: &[u8], width: usize, height: usize) -> Option<DecodedCode> {
    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(width, height, |x, y| gray[y * width + x]);
    let grids = prepared.detect_grids();
    let found = grids.iter().find_map(|grid| match grid.decode() {
        Ok((_, content)) => DecodedCode::new(content, Symbology::Qr),
        Err(_) => None,
    });
    found
}

/// Alpha is composited over white so transparent margins read as light.
fn rgba_to_luma(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4)
        .map(|px| {
            let y = (COEF_R * px[0] as u32 + COEF_G * px[1] as u32 + COEF_B * px[2] as u32) >> 8;
            let a = px[3] as u32;
            ((y * a + 255 * (255 - a)) / 255) as u8
        })
        .collect()
}

/// Otsu threshold; pixels strictly below it are dark. When several thresholds
/// tie, the middle of the plateau is used.
fn otsu_threshold(gray: &[u8]) -> u8 {
    let mut histogram = [0u64; 256];
    for &p in gray {
        histogram[p as usize] += 1;
    }

    let total = gray.len() as f64;
    let sum_all: f64 = histogram.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();

    let mut below = 0f64;
    let mut sum_below = 0f64;
    let mut best = 0f64;
    let (mut lo, mut hi) = (128usize, 128usize);

    // threshold t splits [0, t) from [t, 255]
    for t in 1..256usize {
        below += histogram[t - 1] as f64;
        sum_below += (t - 1) as f64 * histogram[t - 1] as f64;
        let above = total - below;
        if below == 0.0 || above == 0.0 {
            continue;
        }
        let mean_below = sum_below / below;
        let mean_above = (sum_all - sum_below) / above;
        let variance = below * above * (mean_below - mean_above).powi(2);

        if variance > best {
            best = variance;
            lo = t;
            hi = t;
        } else if variance == best && best > 0.0 {
            hi = t;
        }
    }
    ((lo + hi) / 2) as u8
}

fn scanline_rows(height: usize, max_lines: usize) -> impl Iterator<Item = usize> {
    let mid = height / 2;
    let step = (height / (max_lines + 1)).max(1);
    (0..max_lines.min(height)).filter_map(move |i| {
        let offset = (i + 1) / 2 * step;
        let y = if i % 2 == 0 {
            mid + offset
        } else {
            mid.checked_sub(offset)?
        };
        (y < height).then_some(y)
    })
}

/// Alternating run lengths; index 0 is always a light run (possibly empty),
/// so odd indices are dark.
fn run_lengths(dark: impl Iterator<Item = bool>) -> Vec<u32> {
    let mut runs = vec![0u32];
    let mut current_dark = false;
    for d in dark {
        if d != current_dark {
            runs.push(0);
            current_dark = d;
        }
        if let Some(last) = runs.last_mut() {
            *last += 1;
        }
    }
    runs
}

fn pattern_variance(counters: &[u32], pattern: &[u32]) -> f32 {
    let total: u32 = counters.iter().sum();
    let modules: u32 = pattern.iter().sum();
    if total < modules {
        return f32::INFINITY;
    }
    let unit = total as f32 / modules as f32;
    let max_individual = MAX_INDIVIDUAL_VARIANCE * unit;

    let mut variance = 0f32;
    for (&c, &p) in counters.iter().zip(pattern) {
        let diff = (c as f32 - p as f32 * unit).abs();
        if diff > max_individual {
            return f32::INFINITY;
        }
        variance += diff;
    }
    variance / total as f32
}

fn matches(counters: &[u32], pattern: &[u32]) -> bool {
    pattern_variance(counters, pattern) < MAX_AVG_VARIANCE
}

/// Best digit for a four-run window. `with_g` also considers G-codes, which
/// are reported as digit + 10.
fn match_digit(counters: &[u32], with_g: bool) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    let candidates = if with_g { 20 } else { 10 };
    for idx in 0..candidates {
        let mut pattern = L_WIDTHS[idx % 10];
        if idx >= 10 {
            pattern.reverse();
        }
        let v = pattern_variance(counters, &pattern);
        if v < MAX_AVG_VARIANCE && best.map_or(true, |(_, b)| v < b) {
            best = Some((idx, v));
        }
    }
    best.map(|(idx, _)| idx)
}

fn scan_row(runs: &[u32]) -> Option<DecodedCode> {
    for start in (1..runs.len()).step_by(2) {
        for format in Symbology::LINEAR {
            if let Some(code) = decode_at(runs, start, format) {
                return Some(code);
            }
        }
    }
    None
}

fn decode_at(runs: &[u32], start: usize, format: Symbology) -> Option<DecodedCode> {
    let end = start + format.runs();
    // a light run must follow the end guard
    if end >= runs.len() {
        return None;
    }
    let r = &runs[start..end];
    if !matches(&r[0..3], &GUARD) {
        return None;
    }
    let module = r[0..3].iter().sum::<u32>() as f32 / 3.0;
    let quiet = module * QUIET_ZONE_MODULES;
    if (runs[start - 1] as f32) < quiet || (runs[end] as f32) < quiet {
        return None;
    }

    let half = format.digits() / 2;
    let left_digits = if format == Symbology::Ean13 { 6 } else { 4 };
    let mut digits: Vec<u8> = Vec::with_capacity(format.digits());
    let mut parity = 0u8;
    let mut pos = 3;

    for i in 0..left_digits {
        let idx = match_digit(&r[pos..pos + 4], format == Symbology::Ean13)?;
        if idx >= 10 {
            parity |= 1 << (left_digits - 1 - i);
        }
        digits.push((idx % 10) as u8);
        pos += 4;
    }

    if !matches(&r[pos..pos + 5], &MIDDLE_GUARD) {
        return None;
    }
    pos += 5;

    for _ in 0..half {
        let idx = match_digit(&r[pos..pos + 4], false)?;
        digits.push(idx as u8);
        pos += 4;
    }

    if !matches(&r[pos..pos + 3], &GUARD) {
        return None;
    }

    if format == Symbology::Ean13 {
        let first = FIRST_DIGIT_PARITY.iter().position(|&p| p == parity)?;
        digits.insert(0, first as u8);
    }

    if !check_digit_valid(&digits) {
        return None;
    }
    let value: String = digits.iter().map(|d| char::from(b'0' + d)).collect();
    DecodedCode::new(value, format)
}

/// GS1 mod-10 check over a full code (data digits followed by the check digit).
pub fn check_digit_valid(digits: &[u8]) -> bool {
    let Some((&check, data)) = digits.split_last() else {
        return false;
    };
    check == check_digit(data)
}

pub fn check_digit(data: &[u8]) -> u8 {
    let sum: u32 = data
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| d as u32 * if i % 2 == 0 { 3 } else { 1 })
        .sum();
    ((10 - sum % 10) % 10) as u8
}
