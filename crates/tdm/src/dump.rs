//! Buffer dump writers.
//!
//! When dumping is switched on, layer submissions, PP traffic and capture
//! completions are additionally written to the dump directory: PNG for the
//! 32-bit RGB formats, raw planar data for everything else.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::buffer::Surface;
use crate::debug::DebugState;
use crate::types::monotonic_us;

/// Dump a layer buffer as `NNN_out_P_lyr_Z.png` or
/// `NNN_out_P_lyr_Z_SxH_FOURCC.yuv`.
pub(crate) fn dump_layer_buffer(debug: &mut DebugState, pipe: u32, zpos: i32, buffer: &Surface) {
    let Some(dir) = debug.dump_dir.clone() else {
        return;
    };
    let index = debug.dump_index;
    debug.dump_index = debug.dump_index.wrapping_add(1);

    let path = if buffer.format().is_rgb32() {
        dir.join(format!("{index:03}_out_{pipe}_lyr_{zpos}.png"))
    } else {
        let stride = buffer.planes()[0].stride;
        dir.join(format!(
            "{index:03}_out_{pipe}_lyr_{zpos}_{stride}x{}_{}.yuv",
            buffer.height(),
            buffer.format()
        ))
    };
    write_buffer(&path, buffer);
}

/// Dump one side of a PP pair as `pp_src_NNN` / `pp_dst_NNN`.
pub(crate) fn dump_pp_buffer(debug: &mut DebugState, side: &str, buffer: &Surface) {
    let Some(dir) = debug.dump_dir.clone() else {
        return;
    };
    let index = debug.pp_dump_index;
    debug.pp_dump_index = debug.pp_dump_index.wrapping_add(1);
    let path = named(&dir, &format!("pp_{side}_{index:03}"), buffer);
    write_buffer(&path, buffer);
}

/// Dump a finished capture buffer, named by object stamp plus timestamp.
pub(crate) fn dump_capture_buffer(debug: &mut DebugState, stamp: u64, buffer: &Surface) {
    let Some(dir) = debug.dump_dir.clone() else {
        return;
    };
    let path = named(&dir, &format!("capture_{stamp}_{}", monotonic_us()), buffer);
    write_buffer(&path, buffer);
}

fn named(dir: &Path, base: &str, buffer: &Surface) -> PathBuf {
    if buffer.format().is_rgb32() {
        dir.join(format!("{base}.png"))
    } else {
        let stride = buffer.planes()[0].stride;
        dir.join(format!("{base}_{stride}x{}_{}.yuv", buffer.height(), buffer.format()))
    }
}

fn write_buffer(path: &Path, buffer: &Surface) {
    let result = if buffer.format().is_rgb32() {
        write_png(path, buffer)
    } else {
        write_raw(path, buffer)
    };
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "dumped buffer"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "buffer dump failed"),
    }
}

fn write_png(path: &Path, buffer: &Surface) -> std::io::Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);

    let mut encoder = png::Encoder::new(writer, buffer.width(), buffer.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder
        .write_header()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    // Scanout memory is BGRA in byte order; PNG wants RGBA.
    let data = buffer.map();
    let mut rgba = Vec::with_capacity(data.len());
    for px in data.chunks_exact(4) {
        rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
    }
    drop(data);

    writer
        .write_image_data(&rgba)
        .map_err(|e| std::io::Error::other(e.to_string()))
}

fn write_raw(path: &Path, buffer: &Surface) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    let data = buffer.map();
    for plane in buffer.planes() {
        let start = plane.offset as usize;
        let end = start + plane.size as usize;
        file.write_all(&data[start..end])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::DumpFlags;
    use crate::types::Format;

    #[test]
    fn png_and_yuv_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut debug = DebugState {
            dump: DumpFlags::LAYER,
            dump_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let rgb = Surface::alloc(8, 8, Format::ARGB8888);
        dump_layer_buffer(&mut debug, 0, 1, &rgb);
        assert!(dir.path().join("000_out_0_lyr_1.png").exists());

        let yuv = Surface::alloc(8, 8, Format::NV12);
        dump_layer_buffer(&mut debug, 0, 1, &yuv);
        assert!(dir.path().join("001_out_0_lyr_1_8x8_NV12.yuv").exists());
    }

    #[test]
    fn pp_names_count_independently() {
        let dir = tempfile::tempdir().unwrap();
        let mut debug = DebugState {
            dump: DumpFlags::PP,
            dump_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let src = Surface::alloc(4, 4, Format::XRGB8888);
        dump_pp_buffer(&mut debug, "src", &src);
        dump_pp_buffer(&mut debug, "dst", &src);
        assert!(dir.path().join("pp_src_000.png").exists());
        assert!(dir.path().join("pp_dst_001.png").exists());
    }
}
