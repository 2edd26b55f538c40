//! Grasp client: builds a synthetic tabletop scene, sends one grasp request
//! over TCP, and prints the returned grasp poses.
//!
//! Smoke-test tool for the grasp server. Usage:
//!   grasp_client [server_addr] [segmap_id]

use anyhow::{bail, Result};
use ndarray::{Array2, Array3};

use graspnet_server::image;
use graspnet_server::protocol::{self, ClientMessage, ServerMessage};

const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:9040";
const DEFAULT_SEGMAP_ID: i32 = 1;

// シーン寸法とカメラパラメータ
const WIDTH: usize = 160;
const HEIGHT: usize = 120;
const FX: f64 = 200.0;
const FY: f64 = 200.0;

// ---------------------------------------------------------------------------
// Synthetic scene
// ---------------------------------------------------------------------------

struct Scene {
    rgb: Array3<u8>,
    depth: Array2<f32>,
    seg: Array2<u8>,
}

/// 机平面 (z=0.8) の上に箱 (z=0.6, セグメント1) を置いたシーンを作る。
/// NaN 画素を少量混ぜてサーバ側のサニタイズも通す。
fn build_scene() -> Scene {
    let mut rgb = Array3::from_elem((HEIGHT, WIDTH, 3), 90u8);
    let mut depth = Array2::from_elem((HEIGHT, WIDTH), 0.8f32);
    let mut seg = Array2::zeros((HEIGHT, WIDTH));

    // 中央の箱: 幅の 1/4、高さの 1/4
    let (bx0, bx1) = (WIDTH * 3 / 8, WIDTH * 5 / 8);
    let (by0, by1) = (HEIGHT * 3 / 8, HEIGHT * 5 / 8);
    for y in by0..by1 {
        for x in bx0..bx1 {
            depth[[y, x]] = 0.6;
            seg[[y, x]] = 1;
            rgb[[y, x, 0]] = 200;
            rgb[[y, x, 1]] = 120;
            rgb[[y, x, 2]] = 40;
        }
    }

    // センサ欠損を模した NaN
    depth[[0, 0]] = f32::NAN;
    depth[[HEIGHT - 1, WIDTH - 1]] = f32::NAN;

    Scene { rgb, depth, seg }
}

fn camera_k() -> [f64; 9] {
    let cx = WIDTH as f64 / 2.0;
    let cy = HEIGHT as f64 / 2.0;
    [FX, 0.0, cx, 0.0, FY, cy, 0.0, 0.0, 1.0]
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let server_addr = args
        .get(1)
        .map(String::as_str)
        .unwrap_or(DEFAULT_SERVER_ADDR);
    let segmap_id: i32 = match args.get(2) {
        Some(s) => s.parse()?,
        None => DEFAULT_SEGMAP_ID,
    };

    println!("Grasp Client ({})", env!("GIT_VERSION"));
    println!("Server: {}", server_addr);
    println!("Requesting grasps for segmap_id {}", segmap_id);

    let scene = build_scene();
    let request = ClientMessage::GraspRequest {
        request_id: 1,
        rgb: image::encode_rgb(&scene.rgb),
        depth: image::encode_depth(&scene.depth),
        seg: image::encode_seg8(&scene.seg),
        camera_k: camera_k(),
        segmap_id,
    };

    let stream = tokio::net::TcpStream::connect(server_addr).await?;
    stream.set_nodelay(true)?;
    let mut framed = protocol::message_stream(stream);

    protocol::send_message(&mut framed, &request).await?;
    let response: ServerMessage = protocol::recv_message(&mut framed).await?;

    match response {
        ServerMessage::GraspResult { request_id, grasps } => {
            println!("[req {}] {} grasps", request_id, grasps.len());

            // スコア降順で上位を表示
            let mut order: Vec<usize> = (0..grasps.len()).collect();
            order.sort_by(|&a, &b| {
                grasps[b]
                    .score
                    .partial_cmp(&grasps[a].score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for &i in order.iter().take(5) {
                let g = &grasps[i];
                // 行優先 4x4 の平行移動成分は 3, 7, 11 番目
                println!(
                    "  score {:.3}  t = ({:+.3}, {:+.3}, {:+.3})  contact = ({:+.3}, {:+.3}, {:+.3})",
                    g.score,
                    g.pose[3],
                    g.pose[7],
                    g.pose[11],
                    g.contact_pt[0],
                    g.contact_pt[1],
                    g.contact_pt[2]
                );
            }
        }
        ServerMessage::GraspError { request_id, message } => {
            bail!("[req {}] server error: {}", request_id, message);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_scene() {
        let scene = build_scene();
        assert_eq!(scene.rgb.dim(), (HEIGHT, WIDTH, 3));
        assert_eq!(scene.depth.dim(), (HEIGHT, WIDTH));

        // 箱のセグメント画素が存在し、画像端には掛からない
        let box_pixels = scene.seg.iter().filter(|&&s| s == 1).count();
        assert!(box_pixels > 0);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                if scene.seg[[y, x]] == 1 {
                    assert!(y >= 5 && y < HEIGHT - 5);
                    assert!(x >= 5 && x < WIDTH - 5);
                    assert_eq!(scene.depth[[y, x]], 0.6);
                }
            }
        }
        assert!(scene.depth[[0, 0]].is_nan());
    }
}
