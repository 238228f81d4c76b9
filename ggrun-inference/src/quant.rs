//! Block quantization codecs and half-precision conversion.
//!
//! Both block formats hold [`QK`] weights per block behind a half-precision scale:
//! - `Q4_0`: 2-byte scale + 16 bytes of nibbles. Element `j` lives in the low nibble of byte `j`,
//!   element `j + 16` in the high nibble, each biased by 8.
//! - `Q8_0`: 2-byte scale + 32 signed bytes.

use byteorder::{ByteOrder, LittleEndian};
use rayon::prelude::*;

use crate::gguf::GgmlType;

#[cfg(test)]
#[path = "../tests/unit/quant_test.rs"]
mod quant_test;

/// Number of weights per quantization block.
pub const QK: usize = 32;
/// Bytes per `Q4_0` block.
pub const Q4_0_BLOCK_BYTES: usize = 2 + QK / 2;
/// Bytes per `Q8_0` block.
pub const Q8_0_BLOCK_BYTES: usize = 2 + QK;

/// Expands an IEEE-754 binary16 value.
pub fn f16_to_f32(half: u16) -> f32 {
    let sign = ((half as u32) & 0x8000) << 16;
    let exp = ((half >> 10) & 0x1F) as u32;
    let mant = (half & 0x3FF) as u32;

    let bits = match (exp, mant) {
        (0, 0) => sign,
        (0, _) => {
            // subnormal: shift the mantissa until the implicit bit appears
            let mut exp = 127 - 15 + 1;
            let mut mant = mant;
            while mant & 0x400 == 0 {
                mant <<= 1;
                exp -= 1;
            }
            sign | (exp << 23) | ((mant & 0x3FF) << 13)
        }
        (0x1F, _) => sign | 0x7F80_0000 | (mant << 13),
        _ => sign | ((exp + 127 - 15) << 23) | (mant << 13),
    };

    f32::from_bits(bits)
}

/// Narrows to IEEE-754 binary16 with round-to-nearest-even.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let mant = bits & 0x7F_FFFF;

    if exp == 0xFF {
        if mant == 0 {
            return sign | 0x7C00;
        }
        // keep NaN a NaN even when the payload lives in the dropped bits
        let payload = (mant >> 13) as u16;
        return sign | 0x7C00 | if payload == 0 { 0x200 } else { payload };
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1F {
        return sign | 0x7C00;
    }

    if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        let significand = mant | 0x80_0000;
        let shift = (14 - half_exp) as u32;
        let mut half_mant = significand >> shift;
        let rem = significand & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        if rem > halfway || (rem == halfway && half_mant & 1 == 1) {
            half_mant += 1;
        }
        return sign | half_mant as u16;
    }

    let mut half = ((half_exp as u32) << 10) | (mant >> 13);
    let rem = mant & 0x1FFF;
    if rem > 0x1000 || (rem == 0x1000 && half & 1 == 1) {
        // a carry out of the mantissa bumps the exponent, possibly to infinity
        half += 1;
    }
    sign | half as u16
}

/// Reads the half-precision scale that prefixes every block.
#[inline]
pub fn block_scale(block: &[u8]) -> f32 {
    f16_to_f32(LittleEndian::read_u16(&block[..2]))
}

/// Dequantizes one `Q4_0` block into up to [`QK`] values.
pub fn dequantize_q4_0_block(block: &[u8], out: &mut [f32]) {
    let d = block_scale(block);
    let qs = &block[2..Q4_0_BLOCK_BYTES];
    let half = QK / 2;

    for (j, &byte) in qs.iter().enumerate() {
        let lo = ((byte & 0x0F) as i32 - 8) as f32 * d;
        let hi = ((byte >> 4) as i32 - 8) as f32 * d;
        if let Some(slot) = out.get_mut(j) {
            *slot = lo;
        }
        if let Some(slot) = out.get_mut(j + half) {
            *slot = hi;
        }
    }
}

/// Dequantizes one `Q8_0` block into up to [`QK`] values.
pub fn dequantize_q8_0_block(block: &[u8], out: &mut [f32]) {
    let d = block_scale(block);
    out.iter_mut()
        .zip(&block[2..Q8_0_BLOCK_BYTES])
        .for_each(|(slot, &q)| *slot = (q as i8) as f32 * d);
}

/// Quantizes up to [`QK`] values into one `Q4_0` block; missing tail values count as zero.
pub fn quantize_q4_0_block(values: &[f32], block: &mut [u8]) {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in values {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }

    let scale = f32_to_f16(max / -8.0);
    let d = f16_to_f32(scale);
    let id = if d != 0.0 { d.recip() } else { 0.0 };

    LittleEndian::write_u16(&mut block[..2], scale);
    let value_at = |i: usize| values.get(i).copied().unwrap_or(0.0);
    let half = QK / 2;

    for j in 0..half {
        let lo = (value_at(j) * id + 8.5).floor().clamp(0.0, 15.0) as u8;
        let hi = (value_at(j + half) * id + 8.5).floor().clamp(0.0, 15.0) as u8;
        block[2 + j] = lo | (hi << 4);
    }
}

/// Quantizes up to [`QK`] values into one `Q8_0` block; missing tail values count as zero.
pub fn quantize_q8_0_block(values: &[f32], block: &mut [u8]) {
    let amax = values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));

    let scale = f32_to_f16(amax / 127.0);
    let d = f16_to_f32(scale);
    let id = if d != 0.0 { d.recip() } else { 0.0 };

    LittleEndian::write_u16(&mut block[..2], scale);
    for (j, slot) in block[2..Q8_0_BLOCK_BYTES].iter_mut().enumerate() {
        let q = values.get(j).map_or(0.0, |&v| (v * id).round().clamp(-127.0, 127.0));
        *slot = (q as i8) as u8;
    }
}

/// Dequantizes a run of `Q4_0` blocks in parallel. `out.len()` decides how many values are produced.
pub fn dequantize_q4_0(data: &[u8], out: &mut [f32]) {
    out.par_chunks_mut(QK)
        .zip(data.par_chunks(Q4_0_BLOCK_BYTES))
        .for_each(|(chunk, block)| dequantize_q4_0_block(block, chunk));
}

/// Dequantizes a run of `Q8_0` blocks in parallel. `out.len()` decides how many values are produced.
pub fn dequantize_q8_0(data: &[u8], out: &mut [f32]) {
    out.par_chunks_mut(QK)
        .zip(data.par_chunks(Q8_0_BLOCK_BYTES))
        .for_each(|(chunk, block)| dequantize_q8_0_block(block, chunk));
}

pub fn quantize_q4_0(values: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(QK) * Q4_0_BLOCK_BYTES];
    out.par_chunks_mut(Q4_0_BLOCK_BYTES)
        .zip(values.par_chunks(QK))
        .for_each(|(block, chunk)| quantize_q4_0_block(chunk, block));
    out
}

pub fn quantize_q8_0(values: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(QK) * Q8_0_BLOCK_BYTES];
    out.par_chunks_mut(Q8_0_BLOCK_BYTES)
        .zip(values.par_chunks(QK))
        .for_each(|(block, chunk)| quantize_q8_0_block(chunk, block));
    out
}

/// Encodes values into the byte layout of `ty`. Returns `None` for element types without an encoder.
pub fn encode(ty: GgmlType, values: &[f32]) -> Option<Vec<u8>> {
    match ty {
        GgmlType::F32 => {
            let mut out = vec![0u8; values.len() * 4];
            LittleEndian::write_f32_into(values, &mut out);
            Some(out)
        }
        GgmlType::F16 => {
            let halves: Vec<u16> = values.iter().map(|&v| f32_to_f16(v)).collect();
            let mut out = vec![0u8; halves.len() * 2];
            LittleEndian::write_u16_into(&halves, &mut out);
            Some(out)
        }
        GgmlType::Q4_0 => Some(quantize_q4_0(values)),
        GgmlType::Q8_0 => Some(quantize_q8_0(values)),
        _ => None,
    }
}

/// Decodes `out.len()` values stored as `ty`. Returns `false` for element types without a decoder.
///
/// `data` must hold at least `ty.byte_size(out.len())` bytes.
pub fn decode_into(ty: GgmlType, data: &[u8], out: &mut [f32]) -> bool {
    match ty {
        GgmlType::F32 => LittleEndian::read_f32_into(&data[..out.len() * 4], out),
        GgmlType::F16 => {
            let mut halves = vec![0u16; out.len()];
            LittleEndian::read_u16_into(&data[..out.len() * 2], &mut halves);
            out.par_iter_mut().zip(halves.par_iter()).for_each(|(slot, &h)| *slot = f16_to_f32(h));
        }
        GgmlType::Q4_0 => dequantize_q4_0(data, out),
        GgmlType::Q8_0 => dequantize_q8_0(data, out),
        _ => return false,
    }
    true
}

/// Nominal size reduction relative to `F32` storage.
pub fn compression_ratio(ty: GgmlType) -> f32 {
    match ty {
        GgmlType::Q4_0 | GgmlType::Q4_1 => 8.0,
        GgmlType::Q8_0 | GgmlType::Q8_1 => 4.0,
        GgmlType::F16 => 2.0,
        _ => 1.0,
    }
}
