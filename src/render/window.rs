use anyhow::Result;
use minifb::{Key, Window, WindowOptions};
use nalgebra::Matrix3;
use ndarray::{Array2, Array3};

use crate::estimator::ScenePrediction;
use crate::render::overlay::{
    approach_endpoint, project_point, score_color, segment_color, APPROACH_LINE_LEN,
    CONTACT_MARKER_RADIUS,
};

/// minifbを使用した把持結果ビューア
pub struct GraspViewer {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl GraspViewer {
    /// ウィンドウを作成
    pub fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let window = Window::new(
            title,
            width,
            height,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )?;

        let buffer = vec![0u32; width * height];

        Ok(Self {
            window,
            buffer,
            width,
            height,
        })
    }

    /// ウィンドウが開いているか
    pub fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(Key::Escape)
    }

    /// RGB画像をバッファにコピーし、セグメント画素を塗り分け
    pub fn render_image(&mut self, rgb: &Array3<u8>, segmap: &Array2<i32>) {
        let (fh, fw, _) = rgb.dim();
        let (sh, sw) = segmap.dim();

        // サイズが異なる場合はクロップ/パディング
        for y in 0..self.height.min(fh) {
            for x in 0..self.width.min(fw) {
                let r = rgb[[y, x, 0]] as u32;
                let g = rgb[[y, x, 1]] as u32;
                let b = rgb[[y, x, 2]] as u32;
                let mut px = (r << 16) | (g << 8) | b;

                let id = if y < sh && x < sw { segmap[[y, x]] } else { 0 };
                if id > 0 {
                    px = blend(px, segment_color(id));
                }
                self.buffer[y * self.width + x] = px;
            }
        }
    }

    /// 全シーン点群を1ピクセルずつ描画（色配列がなければ白）
    pub fn render_cloud(
        &mut self,
        k: &Matrix3<f32>,
        cloud: &Array2<f32>,
        colors: Option<&Array2<u8>>,
    ) {
        for i in 0..cloud.nrows() {
            let p = [cloud[[i, 0]], cloud[[i, 1]], cloud[[i, 2]]];
            if let Some((x, y)) = project_point(k, &p) {
                let color = match colors {
                    Some(c) if i < c.nrows() => {
                        ((c[[i, 0]] as u32) << 16) | ((c[[i, 1]] as u32) << 8) | c[[i, 2]] as u32
                    }
                    _ => 0xFFFFFF,
                };
                self.set_pixel(x, y, color);
            }
        }
    }

    /// 予測された把持をスコア色で描画（接触点マーカー + アプローチ線）
    pub fn render_grasps(&mut self, k: &Matrix3<f32>, prediction: &ScenePrediction) {
        for grasps in prediction.values() {
            let n = grasps
                .scores
                .len()
                .min(grasps.poses.len())
                .min(grasps.contacts.len());
            for i in 0..n {
                let contact = grasps.contacts[i];
                let Some((cx, cy)) = project_point(k, &contact) else {
                    continue;
                };
                let color = score_color(grasps.scores[i]);
                let end = approach_endpoint(&grasps.poses[i], &contact, APPROACH_LINE_LEN);
                if let Some((ex, ey)) = project_point(k, &end) {
                    self.draw_line(cx, cy, ex, ey, color);
                }
                self.draw_circle(cx, cy, CONTACT_MARKER_RADIUS, color);
            }
        }
    }

    /// バッファをウィンドウに表示
    pub fn update(&mut self) -> Result<()> {
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)?;
        Ok(())
    }

    /// イベントのみ処理（描画対象がないフレーム用）
    pub fn pump_events(&mut self) {
        self.window.update();
    }

    /// Bresenhamのアルゴリズムで線を描画
    fn draw_line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, color: u32) {
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;

        let mut x = x0;
        let mut y = y0;

        loop {
            self.set_pixel(x, y, color);

            if x == x1 && y == y1 {
                break;
            }

            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// 円を描画（塗りつぶし）
    fn draw_circle(&mut self, cx: i32, cy: i32, radius: i32, color: u32) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.set_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    /// ピクセルをセット（境界チェック付き）
    fn set_pixel(&mut self, x: i32, y: i32, color: u32) {
        if x >= 0 && x < self.width as i32 && y >= 0 && y < self.height as i32 {
            self.buffer[y as usize * self.width + x as usize] = color;
        }
    }
}

/// 50/50 のチャンネル混合
fn blend(base: u32, tint: u32) -> u32 {
    let r = (((base >> 16) & 0xFF) + ((tint >> 16) & 0xFF)) / 2;
    let g = (((base >> 8) & 0xFF) + ((tint >> 8) & 0xFF)) / 2;
    let b = ((base & 0xFF) + (tint & 0xFF)) / 2;
    (r << 16) | (g << 8) | b
}
