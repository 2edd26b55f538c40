//! 深度画像からの点群抽出
//!
//! ピンホールモデルによる逆投影、zレンジによる外れ点除去、
//! セグメンテーションマップに基づくセグメント別点群の切り出しを行う。

use std::collections::BTreeMap;

use nalgebra::Matrix3;
use ndarray::{Array2, Array3};
use rand::Rng;

/// 画像端オブジェクト判定のマージン（ピクセル）
const BORDER_MARGIN_PX: usize = 5;

/// 抽出済み点群一式
pub struct PointCloudSet {
    /// 全シーン点群 (N, 3)、カメラ座標系
    pub full: Array2<f32>,
    /// セグメントID別点群（ID 0 は背景として除外）
    pub segments: BTreeMap<i32, Array2<f32>>,
    /// `full` と行対応する RGB 色 (N, 3)
    pub colors: Option<Array2<u8>>,
}

fn rows_to_array(rows: &[[f32; 3]]) -> Array2<f32> {
    let mut out = Array2::zeros((rows.len(), 3));
    for (i, p) in rows.iter().enumerate() {
        out[[i, 0]] = p[0];
        out[[i, 1]] = p[1];
        out[[i, 2]] = p[2];
    }
    out
}

/// 深度画像を逆投影して点群を生成（depth > 0 の画素のみ）
///
/// 戻り値の色配列は `rgb` が与えられた場合のみ Some。
pub fn depth_to_cloud(
    depth: &Array2<f32>,
    k: &Matrix3<f32>,
    rgb: Option<&Array3<u8>>,
) -> (Array2<f32>, Option<Array2<u8>>) {
    let fx = k[(0, 0)];
    let fy = k[(1, 1)];
    let cx = k[(0, 2)];
    let cy = k[(1, 2)];

    let (h, w) = depth.dim();
    let mut pts: Vec<[f32; 3]> = Vec::new();
    let mut cols: Vec<[u8; 3]> = Vec::new();
    for v in 0..h {
        for u in 0..w {
            let z = depth[[v, u]];
            if z <= 0.0 {
                continue;
            }
            let x = (u as f32 - cx) * z / fx;
            let y = (v as f32 - cy) * z / fy;
            pts.push([x, y, z]);
            if let Some(rgb) = rgb {
                cols.push([rgb[[v, u, 0]], rgb[[v, u, 1]], rgb[[v, u, 2]]]);
            }
        }
    }

    let cloud = rows_to_array(&pts);
    let colors = rgb.map(|_| {
        let mut out = Array2::zeros((cols.len(), 3));
        for (i, c) in cols.iter().enumerate() {
            out[[i, 0]] = c[0];
            out[[i, 1]] = c[1];
            out[[i, 2]] = c[2];
        }
        out
    });
    (cloud, colors)
}

/// zレンジ外の点を除去（色配列も行対応で間引く）
pub fn filter_z_range(
    cloud: &Array2<f32>,
    colors: Option<&Array2<u8>>,
    z_range: [f32; 2],
) -> (Array2<f32>, Option<Array2<u8>>) {
    let keep: Vec<usize> = (0..cloud.nrows())
        .filter(|&i| {
            let z = cloud[[i, 2]];
            z > z_range[0] && z < z_range[1]
        })
        .collect();

    let mut out = Array2::zeros((keep.len(), 3));
    for (row, &i) in keep.iter().enumerate() {
        for j in 0..3 {
            out[[row, j]] = cloud[[i, j]];
        }
    }
    let out_colors = colors.map(|c| {
        let mut oc = Array2::zeros((keep.len(), 3));
        for (row, &i) in keep.iter().enumerate() {
            for j in 0..3 {
                oc[[row, j]] = c[[i, j]];
            }
        }
        oc
    });
    (out, out_colors)
}

/// セグメントが画像端マージンに掛かっているか
fn touches_border(segmap: &Array2<i32>, id: i32) -> bool {
    let (h, w) = segmap.dim();
    if h <= 2 * BORDER_MARGIN_PX || w <= 2 * BORDER_MARGIN_PX {
        return true;
    }
    for v in 0..h {
        for u in 0..w {
            if segmap[[v, u]] == id
                && (v < BORDER_MARGIN_PX
                    || v >= h - BORDER_MARGIN_PX
                    || u < BORDER_MARGIN_PX
                    || u >= w - BORDER_MARGIN_PX)
            {
                return true;
            }
        }
    }
    false
}

/// 深度・K・セグメンテーションから点群一式を抽出
///
/// 全シーン点群とセグメント別点群の両方に zレンジを適用する。
/// `skip_border_objects` 時は画像端に掛かるセグメントを除外する。
pub fn extract_point_clouds(
    depth: &Array2<f32>,
    k: &Matrix3<f32>,
    segmap: &Array2<i32>,
    rgb: Option<&Array3<u8>>,
    skip_border_objects: bool,
    z_range: [f32; 2],
) -> PointCloudSet {
    let (cloud, colors) = depth_to_cloud(depth, k, rgb);
    let (full, colors) = filter_z_range(&cloud, colors.as_ref(), z_range);

    let mut ids: Vec<i32> = segmap.iter().copied().filter(|&id| id > 0).collect();
    ids.sort_unstable();
    ids.dedup();

    let (h, w) = depth.dim();
    let mut segments = BTreeMap::new();
    for id in ids {
        if skip_border_objects && touches_border(segmap, id) {
            continue;
        }
        let mut pts: Vec<[f32; 3]> = Vec::new();
        for v in 0..h {
            for u in 0..w {
                if segmap[[v, u]] != id {
                    continue;
                }
                let z = depth[[v, u]];
                if z <= 0.0 || z <= z_range[0] || z >= z_range[1] {
                    continue;
                }
                let x = (u as f32 - k[(0, 2)]) * z / k[(0, 0)];
                let y = (v as f32 - k[(1, 2)]) * z / k[(1, 1)];
                pts.push([x, y, z]);
            }
        }
        segments.insert(id, rows_to_array(&pts));
    }

    PointCloudSet {
        full,
        segments,
        colors,
    }
}

/// 点数をちょうど `n` 行に揃える
///
/// 多い場合は重複なしランダム間引き、少ない場合は既存点の
/// 重複ありサンプルを末尾に追加する。空の点群はそのまま返す。
pub fn regularize_cloud<R: Rng>(cloud: &Array2<f32>, n: usize, rng: &mut R) -> Array2<f32> {
    let len = cloud.nrows();
    if len == 0 || len == n {
        return cloud.clone();
    }

    if len > n {
        let mut picks: Vec<usize> = rand::seq::index::sample(rng, len, n).into_vec();
        picks.sort_unstable();
        let mut out = Array2::zeros((n, 3));
        for (row, &i) in picks.iter().enumerate() {
            for j in 0..3 {
                out[[row, j]] = cloud[[i, j]];
            }
        }
        out
    } else {
        let mut out = Array2::zeros((n, 3));
        for i in 0..len {
            for j in 0..3 {
                out[[i, j]] = cloud[[i, j]];
            }
        }
        for row in len..n {
            let i = rng.gen_range(0..len);
            for j in 0..3 {
                out[[row, j]] = cloud[[i, j]];
            }
        }
        out
    }
}

/// セグメント重心周りの立方体領域で全シーン点群をクロップ
///
/// 立方体の辺長はセグメントの最大軸長を [min_size, max_size] に
/// クランプした値。
pub fn crop_local_region(
    full: &Array2<f32>,
    segment: &Array2<f32>,
    min_size: f32,
    max_size: f32,
) -> Array2<f32> {
    let n = segment.nrows();
    if n == 0 {
        return Array2::zeros((0, 3));
    }

    let mut center = [0.0f32; 3];
    let mut lo = [f32::MAX; 3];
    let mut hi = [f32::MIN; 3];
    for i in 0..n {
        for j in 0..3 {
            let v = segment[[i, j]];
            center[j] += v;
            lo[j] = lo[j].min(v);
            hi[j] = hi[j].max(v);
        }
    }
    for c in center.iter_mut() {
        *c /= n as f32;
    }
    let extent = (hi[0] - lo[0]).max(hi[1] - lo[1]).max(hi[2] - lo[2]);
    let half = extent.clamp(min_size, max_size) / 2.0;

    let mut pts: Vec<[f32; 3]> = Vec::new();
    for i in 0..full.nrows() {
        let p = [full[[i, 0]], full[[i, 1]], full[[i, 2]]];
        if (p[0] - center[0]).abs() < half
            && (p[1] - center[1]).abs() < half
            && (p[2] - center[2]).abs() < half
        {
            pts.push(p);
        }
    }
    rows_to_array(&pts)
}
