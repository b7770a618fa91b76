//! CPU-side conversion of read-back pixels.

use crate::error::{RenderError, Result};
use ash::vk;

/// Pixel formats a readback can be converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    /// Depth as 32-bit float in `[0, 1]`.
    D32Float,
    S8Uint,
}

impl DataFormat {
    /// Bytes per pixel.
    pub fn texel_size(self) -> usize {
        match self {
            Self::R8G8B8A8Unorm | Self::B8G8R8A8Unorm | Self::D32Float => 4,
            Self::S8Uint => 1,
        }
    }
}

/// Bytes per texel when copying `aspect` of a `format` image to a buffer.
///
/// Returns `None` for formats the readback path does not handle.
pub fn texel_size(format: vk::Format, aspect: vk::ImageAspectFlags) -> Option<usize> {
    if aspect == vk::ImageAspectFlags::STENCIL {
        return crate::framebuffer::has_stencil(format).then_some(1);
    }
    if aspect == vk::ImageAspectFlags::DEPTH {
        return match format {
            vk::Format::D32_SFLOAT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::X8_D24_UNORM_PACK32 => Some(4),
            vk::Format::D16_UNORM | vk::Format::D16_UNORM_S8_UINT => Some(2),
            _ => None,
        };
    }
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Conversion {
    Copy4,
    Swizzle,
    DepthF32,
    Depth24,
    Depth16,
    Stencil,
}

fn is_rgba(format: vk::Format) -> bool {
    matches!(format, vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB)
}

fn is_bgra(format: vk::Format) -> bool {
    matches!(format, vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB)
}

fn conversion(src: vk::Format, aspect: vk::ImageAspectFlags, dst: DataFormat) -> Option<Conversion> {
    use DataFormat as D;
    if aspect == vk::ImageAspectFlags::COLOR {
        return match dst {
            D::R8G8B8A8Unorm if is_rgba(src) => Some(Conversion::Copy4),
            D::R8G8B8A8Unorm if is_bgra(src) => Some(Conversion::Swizzle),
            D::B8G8R8A8Unorm if is_bgra(src) => Some(Conversion::Copy4),
            D::B8G8R8A8Unorm if is_rgba(src) => Some(Conversion::Swizzle),
            _ => None,
        };
    }
    if aspect == vk::ImageAspectFlags::DEPTH && dst == D::D32Float {
        return match src {
            vk::Format::D32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => Some(Conversion::DepthF32),
            vk::Format::D24_UNORM_S8_UINT | vk::Format::X8_D24_UNORM_PACK32 => {
                Some(Conversion::Depth24)
            }
            vk::Format::D16_UNORM | vk::Format::D16_UNORM_S8_UINT => Some(Conversion::Depth16),
            _ => None,
        };
    }
    if aspect == vk::ImageAspectFlags::STENCIL && dst == D::S8Uint && texel_size(src, aspect).is_some() {
        return Some(Conversion::Stencil);
    }
    None
}

/// Check that `aspect` of a `src` image can be read back as `dst`.
pub fn check_conversion(src: vk::Format, aspect: vk::ImageAspectFlags, dst: DataFormat) -> Result<()> {
    match (conversion(src, aspect, dst), texel_size(src, aspect)) {
        (Some(_), Some(_)) => Ok(()),
        _ => Err(RenderError::UnsupportedReadback { src, aspect, dst }),
    }
}

/// Convert tightly packed `src` pixels of a `width` x `height` region into `out`.
///
/// `out` rows are `row_stride` pixels apart.
///
/// # Panics
/// If `row_stride < width`, or `src`/`out` are too small for the region.
#[allow(clippy::too_many_arguments)]
pub fn convert_readback(
    src_format: vk::Format,
    aspect: vk::ImageAspectFlags,
    dst: DataFormat,
    width: u32,
    height: u32,
    src: &[u8],
    out: &mut [u8],
    row_stride: u32,
) -> Result<()> {
    let unsupported = || RenderError::UnsupportedReadback {
        src: src_format,
        aspect,
        dst,
    };
    let conversion = conversion(src_format, aspect, dst).ok_or_else(unsupported)?;
    let src_texel = texel_size(src_format, aspect).ok_or_else(unsupported)?;
    let dst_texel = dst.texel_size();

    assert!(
        row_stride >= width,
        "row stride {row_stride} is smaller than width {width}"
    );
    let (width, height, row_stride) = (width as usize, height as usize, row_stride as usize);
    assert!(
        src.len() >= width * height * src_texel,
        "readback source holds {} bytes, region needs {}",
        src.len(),
        width * height * src_texel
    );
    if height > 0 {
        let needed = ((height - 1) * row_stride + width) * dst_texel;
        assert!(
            out.len() >= needed,
            "readback output holds {} bytes, region needs {needed}",
            out.len()
        );
    }

    for y in 0..height {
        let src_row = &src[y * width * src_texel..(y + 1) * width * src_texel];
        let out_start = y * row_stride * dst_texel;
        let out_row = &mut out[out_start..out_start + width * dst_texel];
        convert_row(conversion, src_row, out_row, src_texel, dst_texel);
    }
    Ok(())
}

fn convert_row(conversion: Conversion, src: &[u8], out: &mut [u8], src_texel: usize, dst_texel: usize) {
    let texels = src.chunks_exact(src_texel).zip(out.chunks_exact_mut(dst_texel));
    match conversion {
        Conversion::Copy4 | Conversion::Stencil => out.copy_from_slice(src),
        Conversion::Swizzle => {
            for (s, d) in texels {
                d.copy_from_slice(&[s[2], s[1], s[0], s[3]]);
            }
        }
        Conversion::DepthF32 => {
            for (s, d) in texels {
                let depth: f32 = bytemuck::pod_read_unaligned(s);
                d.copy_from_slice(bytemuck::bytes_of(&depth));
            }
        }
        Conversion::Depth24 => {
            for (s, d) in texels {
                let raw: u32 = bytemuck::pod_read_unaligned(s);
                let depth = (raw & 0x00FF_FFFF) as f32 / 16_777_215.0;
                d.copy_from_slice(bytemuck::bytes_of(&depth));
            }
        }
        Conversion::Depth16 => {
            for (s, d) in texels {
                let raw: u16 = bytemuck::pod_read_unaligned(s);
                let depth = f32::from(raw) / 65_535.0;
                d.copy_from_slice(bytemuck::bytes_of(&depth));
            }
        }
    }
}
