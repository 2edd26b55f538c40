use nalgebra::{Matrix3, Matrix4};

/// セグメントIDの塗り分け色 (RGB)
pub const SEGMENT_COLORS: [u32; 6] = [
    0xE6194B, // 赤
    0x3CB44B, // 緑
    0xFFE119, // 黄
    0x4363D8, // 青
    0xF58231, // 橙
    0x911EB4, // 紫
];

/// 接触点マーカーの半径（ピクセル）
pub const CONTACT_MARKER_RADIUS: i32 = 3;

/// アプローチ線の長さ（メートル）
pub const APPROACH_LINE_LEN: f32 = 0.05;

pub fn segment_color(id: i32) -> u32 {
    SEGMENT_COLORS[id.rem_euclid(SEGMENT_COLORS.len() as i32) as usize]
}

/// スコア [0, 1] を赤→緑に補間 (RGB)
pub fn score_color(score: f32) -> u32 {
    let t = score.clamp(0.0, 1.0);
    let r = ((1.0 - t) * 255.0) as u32;
    let g = (t * 255.0) as u32;
    (r << 16) | (g << 8)
}

/// カメラ座標の点を画素へ投影。z <= 0 は不可視として None。
pub fn project_point(k: &Matrix3<f32>, p: &[f32; 3]) -> Option<(i32, i32)> {
    if p[2] <= 0.0 {
        return None;
    }
    let u = k[(0, 0)] * p[0] / p[2] + k[(0, 2)];
    let v = k[(1, 1)] * p[1] / p[2] + k[(1, 2)];
    Some((u.round() as i32, v.round() as i32))
}

/// 接触点からアプローチ軸（姿勢の +Z 列）に沿って伸ばした端点
pub fn approach_endpoint(pose: &Matrix4<f32>, contact: &[f32; 3], length: f32) -> [f32; 3] {
    [
        contact[0] + pose[(0, 2)] * length,
        contact[1] + pose[(1, 2)] * length,
        contact[2] + pose[(2, 2)] * length,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_point() {
        let k = Matrix3::new(100.0, 0.0, 2.0, 0.0, 100.0, 2.0, 0.0, 0.0, 1.0);
        // 逆投影 (u=3, v=1, z=2) に対応する点
        let (u, v) = project_point(&k, &[0.02, -0.02, 2.0]).unwrap();
        assert_eq!((u, v), (3, 1));
        // カメラ後方は不可視
        assert!(project_point(&k, &[0.0, 0.0, 0.0]).is_none());
        assert!(project_point(&k, &[0.0, 0.0, -1.0]).is_none());
    }

    #[test]
    fn test_score_color_endpoints() {
        assert_eq!(score_color(0.0), 0xFF0000);
        assert_eq!(score_color(1.0), 0x00FF00);
        assert_eq!(score_color(2.0), 0x00FF00); // クランプ
    }

    #[test]
    fn test_segment_color_cycles() {
        assert_eq!(segment_color(1), segment_color(7));
        assert_eq!(segment_color(-1), segment_color(5));
    }

    #[test]
    fn test_approach_endpoint_identity_pose() {
        let end = approach_endpoint(&Matrix4::identity(), &[0.1, 0.2, 0.5], 0.05);
        assert_eq!(end, [0.1, 0.2, 0.55]);
    }
}
