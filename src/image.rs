//! ワイヤ画像バッファ ⇔ ndarray 変換
//!
//! デコード失敗は `DecodeError` として返す。NaN の除去は行わない
//! （深度のサニタイズはパイプライン側の責務）。

use ndarray::{Array2, Array3};
use thiserror::Error;

use crate::protocol::{ImageBuffer, ImageEncoding};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("{encoding:?} buffer length {actual} (expected {expected})")]
    LengthMismatch {
        encoding: ImageEncoding,
        expected: usize,
        actual: usize,
    },
    #[error("expected {expected} image, got {actual:?}")]
    EncodingMismatch {
        expected: &'static str,
        actual: ImageEncoding,
    },
}

fn check_dims(img: &ImageBuffer) -> Result<(usize, usize), DecodeError> {
    if img.width == 0 || img.height == 0 {
        return Err(DecodeError::InvalidDimensions {
            width: img.width,
            height: img.height,
        });
    }
    Ok((img.height as usize, img.width as usize))
}

/// 期待バイト長を溢れ無しで計算し、データ長と突き合わせる
///
/// ワイヤ上の寸法は信用しない。積が usize を溢れる寸法は
/// `InvalidDimensions` として弾く。
fn check_byte_len(
    img: &ImageBuffer,
    h: usize,
    w: usize,
    bytes_per_px: usize,
) -> Result<usize, DecodeError> {
    let expected = h
        .checked_mul(w)
        .and_then(|n| n.checked_mul(bytes_per_px))
        .ok_or(DecodeError::InvalidDimensions {
            width: img.width,
            height: img.height,
        })?;
    if img.data.len() != expected {
        return Err(DecodeError::LengthMismatch {
            encoding: img.encoding,
            expected,
            actual: img.data.len(),
        });
    }
    Ok(expected)
}

/// RGB画像をデコード（shape: (H, W, 3)）
pub fn decode_rgb(img: &ImageBuffer) -> Result<Array3<u8>, DecodeError> {
    if img.encoding != ImageEncoding::Rgb8 {
        return Err(DecodeError::EncodingMismatch {
            expected: "Rgb8",
            actual: img.encoding,
        });
    }
    let (h, w) = check_dims(img)?;
    let expected = check_byte_len(img, h, w, 3)?;
    Array3::from_shape_vec((h, w, 3), img.data.clone()).map_err(|_| {
        DecodeError::LengthMismatch {
            encoding: img.encoding,
            expected,
            actual: img.data.len(),
        }
    })
}

/// 深度画像をデコード（shape: (H, W)、単位メートル）
pub fn decode_depth(img: &ImageBuffer) -> Result<Array2<f32>, DecodeError> {
    if img.encoding != ImageEncoding::Depth32F {
        return Err(DecodeError::EncodingMismatch {
            expected: "Depth32F",
            actual: img.encoding,
        });
    }
    let (h, w) = check_dims(img)?;
    let expected = check_byte_len(img, h, w, 4)?;
    let vals: Vec<f32> = img
        .data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((h, w), vals).map_err(|_| DecodeError::LengthMismatch {
        encoding: img.encoding,
        expected,
        actual: img.data.len(),
    })
}

/// セグメンテーションマップをデコード（shape: (H, W)、Seg8 / Seg16 両対応）
pub fn decode_segmap(img: &ImageBuffer) -> Result<Array2<i32>, DecodeError> {
    let (h, w) = check_dims(img)?;
    let (expected, vals): (usize, Vec<i32>) = match img.encoding {
        ImageEncoding::Seg8 => {
            let expected = check_byte_len(img, h, w, 1)?;
            (expected, img.data.iter().map(|&b| b as i32).collect())
        }
        ImageEncoding::Seg16 => {
            let expected = check_byte_len(img, h, w, 2)?;
            let vals = img
                .data
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as i32)
                .collect();
            (expected, vals)
        }
        other => {
            return Err(DecodeError::EncodingMismatch {
                expected: "Seg8/Seg16",
                actual: other,
            })
        }
    };
    Array2::from_shape_vec((h, w), vals).map_err(|_| DecodeError::LengthMismatch {
        encoding: img.encoding,
        expected,
        actual: img.data.len(),
    })
}

/// RGB画像をエンコード
pub fn encode_rgb(rgb: &Array3<u8>) -> ImageBuffer {
    let (h, w, _) = rgb.dim();
    ImageBuffer {
        width: w as u32,
        height: h as u32,
        encoding: ImageEncoding::Rgb8,
        data: rgb.iter().copied().collect(),
    }
}

/// 深度画像をエンコード（f32 LE）
pub fn encode_depth(depth: &Array2<f32>) -> ImageBuffer {
    let (h, w) = depth.dim();
    let mut data = Vec::with_capacity(h * w * 4);
    for v in depth.iter() {
        data.extend_from_slice(&v.to_le_bytes());
    }
    ImageBuffer {
        width: w as u32,
        height: h as u32,
        encoding: ImageEncoding::Depth32F,
        data,
    }
}

/// セグメンテーションマップをエンコード（Seg8）
pub fn encode_seg8(segmap: &Array2<u8>) -> ImageBuffer {
    let (h, w) = segmap.dim();
    ImageBuffer {
        width: w as u32,
        height: h as u32,
        encoding: ImageEncoding::Seg8,
        data: segmap.iter().copied().collect(),
    }
}
