//! Image output: 8-bit RGBA PNG and 32-bit float FITS.
//!
//! PNG goes through the `image` crate. FITS has no maintained encoder in
//! the ecosystem, so the minimal single-HDU form is emitted directly:
//! one file per channel with `_r`, `_g`, `_b`, `_a` suffixes, 80-byte
//! header cards in a 2880-byte block, then big-endian floats padded to a
//! block multiple.

use std::io::Write;
use std::path::Path;

use crate::errors::Result;
use crate::rendering::FrameBuffer;

const FITS_BLOCK: usize = 2880;
const FITS_CARD: usize = 80;

/// Write the buffer as an 8-bit RGBA PNG, values clamped to [0, 1].
pub fn write_png(fb: &FrameBuffer, path: impl AsRef<Path>) -> Result<()> {
    let (w, h) = (fb.width(), fb.height());
    let mut bytes = Vec::with_capacity(w * h * 4);
    for v in fb.raw() {
        bytes.push((v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8);
    }
    let img = image::RgbaImage::from_raw(w as u32, h as u32, bytes)
        .expect("buffer length matches dimensions");
    img.save_with_format(path.as_ref(), image::ImageFormat::Png)?;
    Ok(())
}

/// Write the buffer as four single-channel float FITS files,
/// `<base>_r.fits` through `<base>_a.fits`.
pub fn write_fits(fb: &FrameBuffer, base: &str) -> Result<()> {
    for (channel, suffix) in ["_r", "_g", "_b", "_a"].iter().enumerate() {
        write_fits_channel(fb, channel, &format!("{base}{suffix}.fits"))?;
    }
    Ok(())
}

fn fits_card(text: &str) -> [u8; FITS_CARD] {
    let mut card = [b' '; FITS_CARD];
    card[..text.len()].copy_from_slice(text.as_bytes());
    card
}

fn write_fits_channel(fb: &FrameBuffer, channel: usize, path: &str) -> Result<()> {
    let (w, h) = (fb.width(), fb.height());
    let mut file = std::fs::File::create(path)?;

    let cards = [
        format!("{:<8}= {:>20}", "SIMPLE", "T"),
        format!("{:<8}= {:>20}", "BITPIX", -32),
        format!("{:<8}= {:>20}", "NAXIS", 2),
        format!("{:<8}= {:>20}", "NAXIS1", w),
        format!("{:<8}= {:>20}", "NAXIS2", h),
        "END".to_string(),
    ];

    let mut header = Vec::with_capacity(FITS_BLOCK);
    for c in &cards {
        header.extend_from_slice(&fits_card(c));
    }
    header.resize(FITS_BLOCK, b' ');
    file.write_all(&header)?;

    let mut data = Vec::with_capacity(w * h * 4);
    for px in fb.raw().chunks_exact(4) {
        data.extend_from_slice(&px[channel].to_be_bytes());
    }
    let pad = data.len().next_multiple_of(FITS_BLOCK) - data.len();
    data.resize(data.len() + pad, 0);
    file.write_all(&data)?;
    Ok(())
}

/// Image filename for one rendering of a save request:
/// `<base>_<index><annotation>` plus the format extension.
#[must_use]
pub fn image_basename(base: &str, index: usize, annotation: &str) -> String {
    format!("{base}_{index:05}{annotation}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Pixel;

    fn small_buffer() -> FrameBuffer {
        let mut fb = FrameBuffer::new(3, 2);
        fb.add_pixels(
            &[Pixel { x: 1, y: 0, r: 0.5, g: 1.5, b: -0.25, o: 1.0 }],
            1,
        );
        fb
    }

    #[test]
    fn png_round_trip_clamps_channels() {
        let dir = std::env::temp_dir().join("nebula-png-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.png");

        let fb = small_buffer();
        write_png(&fb, &path).unwrap();

        let img = image::open(&path).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (3, 2));
        let px = img.get_pixel(1, 0);
        assert_eq!(px.0[0], 128); // 0.5
        assert_eq!(px.0[1], 255); // clamped high
        assert_eq!(px.0[2], 0); // clamped low
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn fits_files_have_block_structure() {
        let dir = std::env::temp_dir().join("nebula-fits-test");
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("out").to_string_lossy().into_owned();

        let fb = small_buffer();
        write_fits(&fb, &base).unwrap();

        for suffix in ["_r", "_g", "_b", "_a"] {
            let path = format!("{base}{suffix}.fits");
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(bytes.len() % FITS_BLOCK, 0);
            assert!(bytes.starts_with(b"SIMPLE  ="));

            if *suffix == *"_r" {
                // Pixel (1, 0) red = 0.5, big-endian, second value in row 0
                let v = f32::from_be_bytes(bytes[FITS_BLOCK + 4..FITS_BLOCK + 8].try_into().unwrap());
                assert!((v - 0.5).abs() < 1e-6);
            }
            std::fs::remove_file(&path).ok();
        }
    }

    #[test]
    fn basenames_are_zero_padded_and_annotated() {
        assert_eq!(image_basename("out", 3, "_vol"), "out_00003_vol");
        assert_eq!(image_basename("frame", 12345, ""), "frame_12345");
    }
}
