//! ThumbHash codec.
//!
//! A ThumbHash is a ~25 byte representation of an image: average color plus
//! a handful of low-frequency DCT coefficients for luminance, the two color
//! axes, and (when present) alpha. It decompresses to a small blurry preview
//! suitable as a loading placeholder.
//!
//! Layout: a 24-bit header (L DC, P DC, Q DC, L scale, alpha flag), a 16-bit
//! header (L grid size, P scale, Q scale, orientation), an optional alpha
//! byte, then the AC coefficients packed two nibbles per byte, low nibble
//! first.

use std::f32::consts::PI;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};

/// Encode a small RGBA image (at most 100x100) into a ThumbHash.
pub(crate) fn rgba_to_thumb_hash(w: usize, h: usize, rgba: &[u8]) -> Vec<u8> {
    debug_assert!(w <= 100 && h <= 100);
    debug_assert_eq!(rgba.len(), w * h * 4);

    // Average color, weighted by alpha.
    let mut avg_r = 0.0f32;
    let mut avg_g = 0.0f32;
    let mut avg_b = 0.0f32;
    let mut avg_a = 0.0f32;
    for pixel in rgba.chunks_exact(4) {
        let alpha = pixel[3] as f32 / 255.0;
        avg_r += alpha / 255.0 * pixel[0] as f32;
        avg_g += alpha / 255.0 * pixel[1] as f32;
        avg_b += alpha / 255.0 * pixel[2] as f32;
        avg_a += alpha;
    }
    if avg_a > 0.0 {
        avg_r /= avg_a;
        avg_g /= avg_a;
        avg_b /= avg_a;
    }

    let has_alpha = avg_a < (w * h) as f32;
    let l_limit = if has_alpha { 5 } else { 7 };
    let longest = w.max(h);
    let lx = ((l_limit * w) as f32 / longest as f32).round().max(1.0) as usize;
    let ly = ((l_limit * h) as f32 / longest as f32).round().max(1.0) as usize;

    // Decompose into luminance (L), color axes (P, Q), and alpha channels,
    // compositing transparent pixels over the average color.
    let mut l = Vec::with_capacity(w * h);
    let mut p = Vec::with_capacity(w * h);
    let mut q = Vec::with_capacity(w * h);
    let mut a = Vec::with_capacity(w * h);
    for pixel in rgba.chunks_exact(4) {
        let alpha = pixel[3] as f32 / 255.0;
        let r = avg_r * (1.0 - alpha) + alpha / 255.0 * pixel[0] as f32;
        let g = avg_g * (1.0 - alpha) + alpha / 255.0 * pixel[1] as f32;
        let b = avg_b * (1.0 - alpha) + alpha / 255.0 * pixel[2] as f32;
        l.push((r + g + b) / 3.0);
        p.push((r + g) / 2.0 - b);
        q.push(r - g);
        a.push(alpha);
    }

    let (l_dc, l_ac, l_scale) = encode_channel(&l, lx.max(3), ly.max(3), w, h);
    let (p_dc, p_ac, p_scale) = encode_channel(&p, 3, 3, w, h);
    let (q_dc, q_ac, q_scale) = encode_channel(&q, 3, 3, w, h);
    let (a_dc, a_ac, a_scale) = if has_alpha {
        encode_channel(&a, 5, 5, w, h)
    } else {
        (1.0, Vec::new(), 1.0)
    };

    let is_landscape = w > h;
    let header24 = (63.0 * l_dc).round() as u32
        | ((31.5 + 31.5 * p_dc).round() as u32) << 6
        | ((31.5 + 31.5 * q_dc).round() as u32) << 12
        | ((31.0 * l_scale).round() as u32) << 18
        | (has_alpha as u32) << 23;
    let header16 = (if is_landscape { ly } else { lx }) as u16
        | ((63.0 * p_scale).round() as u16) << 3
        | ((63.0 * q_scale).round() as u16) << 9
        | (is_landscape as u16) << 15;

    let mut hash = vec![
        (header24 & 255) as u8,
        ((header24 >> 8) & 255) as u8,
        (header24 >> 16) as u8,
        (header16 & 255) as u8,
        (header16 >> 8) as u8,
    ];
    if has_alpha {
        hash.push((15.0 * a_dc).round() as u8 | ((15.0 * a_scale).round() as u8) << 4);
    }

    // AC coefficients, two per byte, low nibble first.
    let mut ac_index = 0usize;
    let alpha_ac = if has_alpha { &a_ac[..] } else { &[] };
    for ac in [&l_ac[..], &p_ac[..], &q_ac[..], alpha_ac] {
        for &f in ac {
            let nibble = (15.0 * f).round() as u8;
            if ac_index & 1 == 0 {
                hash.push(nibble);
            } else if let Some(last) = hash.last_mut() {
                *last |= nibble << 4;
            }
            ac_index += 1;
        }
    }
    hash
}

/// DCT of one channel over a triangular frequency grid. Returns the DC term,
/// the AC terms normalized into [0, 1], and the scale they were divided by.
fn encode_channel(
    channel: &[f32],
    nx: usize,
    ny: usize,
    w: usize,
    h: usize,
) -> (f32, Vec<f32>, f32) {
    let mut dc = 0.0f32;
    let mut ac = Vec::new();
    let mut scale = 0.0f32;
    let mut fx = vec![0.0f32; w];
    for cy in 0..ny {
        let mut cx = 0usize;
        while cx * ny < nx * (ny - cy) {
            let mut f = 0.0f32;
            for x in 0..w {
                fx[x] = (PI / w as f32 * cx as f32 * (x as f32 + 0.5)).cos();
            }
            for y in 0..h {
                let fy = (PI / h as f32 * cy as f32 * (y as f32 + 0.5)).cos();
                for x in 0..w {
                    f += channel[x + y * w] * fx[x] * fy;
                }
            }
            f /= (w * h) as f32;
            if cx > 0 || cy > 0 {
                ac.push(f);
                scale = scale.max(f.abs());
            } else {
                dc = f;
            }
            cx += 1;
        }
    }
    if scale > 0.0 {
        for f in &mut ac {
            *f = 0.5 + 0.5 / scale * *f;
        }
    }
    (dc, ac, scale)
}

/// Decode a ThumbHash into an RGBA preview, at most 32 pixels on the longer
/// edge. Returns `None` when the hash is too short to carry its headers.
pub(crate) fn thumb_hash_to_rgba(hash: &[u8]) -> Option<(usize, usize, Vec<u8>)> {
    if hash.len() < 5 {
        return None;
    }
    let header24 = hash[0] as u32 | (hash[1] as u32) << 8 | (hash[2] as u32) << 16;
    let l_dc = (header24 & 63) as f32 / 63.0;
    let p_dc = ((header24 >> 6) & 63) as f32 / 31.5 - 1.0;
    let q_dc = ((header24 >> 12) & 63) as f32 / 31.5 - 1.0;
    let l_scale = ((header24 >> 18) & 31) as f32 / 31.0;
    let has_alpha = header24 >> 23 != 0;

    let header16 = hash[3] as u16 | (hash[4] as u16) << 8;
    let is_landscape = header16 >> 15 != 0;
    let l_max = if has_alpha { 5 } else { 7 };
    let lx = (if is_landscape { l_max } else { (header16 & 7) as usize }).max(3);
    let ly = (if is_landscape { (header16 & 7) as usize } else { l_max }).max(3);
    let p_scale = ((header16 >> 3) & 63) as f32 / 63.0;
    let q_scale = ((header16 >> 9) & 63) as f32 / 63.0;

    let (a_dc, a_scale) = if has_alpha {
        if hash.len() < 6 {
            return None;
        }
        ((hash[5] & 15) as f32 / 15.0, (hash[5] >> 4) as f32 / 15.0)
    } else {
        (1.0, 1.0)
    };

    let ac_start = if has_alpha { 6 } else { 5 };
    let mut ac_index = 0usize;
    let mut decode_channel = |nx: usize, ny: usize, scale: f32| -> Option<Vec<f32>> {
        let mut ac = Vec::new();
        for cy in 0..ny {
            let mut cx = if cy > 0 { 0 } else { 1 };
            while cx * ny < nx * (ny - cy) {
                let byte = *hash.get(ac_start + (ac_index >> 1))?;
                let nibble = (byte >> ((ac_index & 1) << 2)) & 15;
                ac.push((nibble as f32 / 7.5 - 1.0) * scale);
                ac_index += 1;
                cx += 1;
            }
        }
        Some(ac)
    };
    let l_ac = decode_channel(lx, ly, l_scale)?;
    let p_ac = decode_channel(3, 3, p_scale * 1.25)?;
    let q_ac = decode_channel(3, 3, q_scale * 1.25)?;
    let a_ac = if has_alpha {
        decode_channel(5, 5, a_scale)?
    } else {
        Vec::new()
    };

    let ratio = lx as f32 / ly as f32;
    let (w, h) = if ratio > 1.0 {
        (32, (32.0 / ratio).round() as usize)
    } else {
        ((32.0 * ratio).round() as usize, 32)
    };

    let mut rgba = Vec::with_capacity(w * h * 4);
    let fx_count = lx.max(if has_alpha { 5 } else { 3 });
    let fy_count = ly.max(if has_alpha { 5 } else { 3 });
    let mut fx = vec![0.0f32; fx_count];
    let mut fy = vec![0.0f32; fy_count];
    for y in 0..h {
        for x in 0..w {
            let mut l = l_dc;
            let mut p = p_dc;
            let mut q = q_dc;
            let mut a = a_dc;

            for (cx, value) in fx.iter_mut().enumerate() {
                *value = (PI * (x as f32 + 0.5) * cx as f32 / w as f32).cos();
            }
            for (cy, value) in fy.iter_mut().enumerate() {
                *value = (PI * (y as f32 + 0.5) * cy as f32 / h as f32).cos();
            }

            let mut j = 0usize;
            for cy in 0..ly {
                let fy2 = fy[cy] * 2.0;
                let mut cx = if cy > 0 { 0 } else { 1 };
                while cx * ly < lx * (ly - cy) {
                    l += l_ac[j] * fx[cx] * fy2;
                    j += 1;
                    cx += 1;
                }
            }

            let mut j = 0usize;
            for cy in 0..3 {
                let fy2 = fy[cy] * 2.0;
                let mut cx = if cy > 0 { 0 } else { 1 };
                while cx < 3 - cy {
                    let f = fx[cx] * fy2;
                    p += p_ac[j] * f;
                    q += q_ac[j] * f;
                    j += 1;
                    cx += 1;
                }
            }

            if has_alpha {
                let mut j = 0usize;
                for cy in 0..5 {
                    let fy2 = fy[cy] * 2.0;
                    let mut cx = if cy > 0 { 0 } else { 1 };
                    while cx < 5 - cy {
                        a += a_ac[j] * fx[cx] * fy2;
                        j += 1;
                        cx += 1;
                    }
                }
            }

            let b = l - 2.0 / 3.0 * p;
            let r = (3.0 * l - b + q) / 2.0;
            let g = r - q;
            rgba.push((r.clamp(0.0, 1.0) * 255.0) as u8);
            rgba.push((g.clamp(0.0, 1.0) * 255.0) as u8);
            rgba.push((b.clamp(0.0, 1.0) * 255.0) as u8);
            rgba.push((a.clamp(0.0, 1.0) * 255.0) as u8);
        }
    }
    Some((w, h, rgba))
}

/// Decode a ThumbHash into an inline `data:image/bmp` URL.
pub(crate) fn thumb_hash_to_data_url(hash: &[u8]) -> Option<String> {
    let (w, h, rgba) = thumb_hash_to_rgba(hash)?;
    let bmp = encode_bmp(w, h, &rgba);
    Some(format!("data:image/bmp;base64,{}", BASE64_STANDARD.encode(bmp)))
}

/// 32-bit BMP with BITFIELDS masks so the alpha channel survives. Rows are
/// stored top-down via a negative height, which keeps the pixel data in the
/// same order as the RGBA input.
fn encode_bmp(w: usize, h: usize, rgba: &[u8]) -> Vec<u8> {
    const FILE_HEADER: usize = 14;
    const INFO_HEADER: usize = 108; // BITMAPV4HEADER

    let data_offset = FILE_HEADER + INFO_HEADER;
    let file_size = data_offset + rgba.len();
    let mut bmp = Vec::with_capacity(file_size);

    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&(file_size as u32).to_le_bytes());
    bmp.extend_from_slice(&[0; 4]);
    bmp.extend_from_slice(&(data_offset as u32).to_le_bytes());

    bmp.extend_from_slice(&(INFO_HEADER as u32).to_le_bytes());
    bmp.extend_from_slice(&(w as i32).to_le_bytes());
    bmp.extend_from_slice(&(-(h as i32)).to_le_bytes());
    bmp.extend_from_slice(&1u16.to_le_bytes()); // planes
    bmp.extend_from_slice(&32u16.to_le_bytes()); // bits per pixel
    bmp.extend_from_slice(&3u32.to_le_bytes()); // BI_BITFIELDS
    bmp.extend_from_slice(&(rgba.len() as u32).to_le_bytes());
    bmp.extend_from_slice(&2835u32.to_le_bytes()); // 72 dpi
    bmp.extend_from_slice(&2835u32.to_le_bytes());
    bmp.extend_from_slice(&[0; 8]); // palette sizes
    bmp.extend_from_slice(&0x0000_00FFu32.to_le_bytes()); // red mask
    bmp.extend_from_slice(&0x0000_FF00u32.to_le_bytes()); // green mask
    bmp.extend_from_slice(&0x00FF_0000u32.to_le_bytes()); // blue mask
    bmp.extend_from_slice(&0xFF00_0000u32.to_le_bytes()); // alpha mask
    bmp.extend_from_slice(&0x7352_4742u32.to_le_bytes()); // "sRGB"
    bmp.extend_from_slice(&[0; 48]); // endpoints and gamma, unused for sRGB

    bmp.extend_from_slice(rgba);
    bmp
}
