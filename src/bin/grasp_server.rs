//! Grasp pose estimation server: receives RGBD scenes over TCP, runs ONNX
//! contact grasp inference, and returns scored 6-DoF grasp poses per request.
//!
//! The main thread owns the window and polls a single-slot mailbox for the
//! latest scene to render; inference runs on the TCP runtime thread and never
//! waits for rendering.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nalgebra::Matrix3;
use serde::Deserialize;

use graspnet_server::estimator::{self, GraspEstimator};
use graspnet_server::image::{self, DecodeError};
use graspnet_server::mailbox::VizMailbox;
use graspnet_server::pipeline::{self, PipelineSettings, SceneInput};
use graspnet_server::protocol::{self, ClientMessage, GraspPose, ImageBuffer, ServerMessage};
use graspnet_server::render::GraspViewer;

// ===========================================================================
// Config (reads grasp_server.toml)
// ===========================================================================

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default = "default_listen_addr")]
    listen_addr: String,
    #[serde(default = "default_ckpt_dir")]
    ckpt_dir: String,
    /// [z_min, z_max] メートル。範囲外の点は外れ値として捨てる。
    #[serde(default = "default_z_range")]
    z_range: [f32; 2],
    #[serde(default)]
    local_regions: bool,
    #[serde(default = "default_filter_grasps")]
    filter_grasps: bool,
    #[serde(default)]
    skip_border_objects: bool,
    #[serde(default = "default_visualize")]
    visualize: bool,
    #[serde(default = "default_forward_passes")]
    forward_passes: usize,
    /// 描画ループのポーリング周波数 (Hz)
    #[serde(default = "default_poll_hz")]
    poll_hz: f32,
    /// モデル設定への上書き ("dotted.path:value")
    #[serde(default)]
    arg_configs: Vec<String>,
    #[serde(default)]
    verbose: bool,
}

fn default_listen_addr() -> String { "0.0.0.0:9040".to_string() }
fn default_ckpt_dir() -> String { "checkpoints/scene_test_2048_bs3_hor_sigma_001".to_string() }
fn default_z_range() -> [f32; 2] { [0.2, 1.1] }
fn default_filter_grasps() -> bool { true }
fn default_visualize() -> bool { true }
fn default_forward_passes() -> usize { 5 }
fn default_poll_hz() -> f32 { 10.0 }

impl Config {
    fn validate(&self) -> Result<()> {
        if self.forward_passes == 0 {
            bail!("forward_passes must be >= 1");
        }
        if self.poll_hz <= 0.0 {
            bail!("poll_hz must be positive");
        }
        if self.z_range[0] >= self.z_range[1] {
            bail!("z_range must satisfy z_min < z_max");
        }
        Ok(())
    }

    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            z_range: self.z_range,
            local_regions: self.local_regions,
            filter_grasps: self.filter_grasps,
            skip_border_objects: self.skip_border_objects,
            visualize: self.visualize,
            forward_passes: self.forward_passes,
        }
    }
}

// ===========================================================================
// Logging
// ===========================================================================

type LogFile = Arc<Mutex<std::io::BufWriter<std::fs::File>>>;

fn open_log_file() -> Result<LogFile> {
    std::fs::create_dir_all("logs")?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = format!("logs/grasp_server_{}.log", ts);
    let file = std::fs::File::create(&path)?;
    eprintln!("Log: {}", path);
    Ok(Arc::new(Mutex::new(std::io::BufWriter::new(file))))
}

macro_rules! log {
    ($logfile:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        eprintln!("{}", msg);
        if let Ok(mut f) = $logfile.lock() {
            let _ = writeln!(f, "{}", msg);
            let _ = f.flush();
        }
    }};
}

// ===========================================================================
// Request handling
// ===========================================================================

struct GraspService {
    estimator: Mutex<GraspEstimator>,
    settings: PipelineSettings,
    mailbox: Arc<VizMailbox>,
    logfile: LogFile,
    verbose: bool,
}

/// ワイヤ形式の K (row-major 3x3, f64) を計算用の行列へ
fn intrinsics_from_wire(k: &[f64; 9]) -> Matrix3<f32> {
    Matrix3::new(
        k[0] as f32, k[1] as f32, k[2] as f32,
        k[3] as f32, k[4] as f32, k[5] as f32,
        k[6] as f32, k[7] as f32, k[8] as f32,
    )
}

fn decode_scene(
    rgb: &ImageBuffer,
    depth: &ImageBuffer,
    seg: &ImageBuffer,
    camera_k: &[f64; 9],
    segmap_id: i32,
) -> Result<SceneInput, DecodeError> {
    Ok(SceneInput {
        rgb: image::decode_rgb(rgb)?,
        depth: image::decode_depth(depth)?,
        segmap: image::decode_segmap(seg)?,
        camera_k: intrinsics_from_wire(camera_k),
        segmap_id,
    })
}

/// リクエスト1件を処理してレスポンスを作る。失敗は GraspError で返し、
/// サーバ自体は落とさない。
fn handle_request(
    service: &GraspService,
    request_id: u64,
    rgb: &ImageBuffer,
    depth: &ImageBuffer,
    seg: &ImageBuffer,
    camera_k: &[f64; 9],
    segmap_id: i32,
) -> ServerMessage {
    let begin = Instant::now();

    let scene = match decode_scene(rgb, depth, seg, camera_k, segmap_id) {
        Ok(s) => s,
        Err(e) => {
            log!(service.logfile, "[req {}] decode error: {}", request_id, e);
            return ServerMessage::GraspError {
                request_id,
                message: format!("decode error: {}", e),
            };
        }
    };

    if service.verbose {
        log!(
            service.logfile,
            "[req {}] {}x{} scene, segmap_id {}: converting depth to point cloud(s)...",
            request_id,
            scene.depth.ncols(),
            scene.depth.nrows(),
            segmap_id
        );
    }

    let result = {
        let mut est = service.estimator.lock().unwrap();
        pipeline::infer(&mut *est, &service.settings, &scene, &service.mailbox)
    };

    match result {
        Ok(candidates) => {
            let grasps: Vec<GraspPose> = candidates
                .iter()
                .map(|c| GraspPose {
                    pose: estimator::flatten_row_major(&c.pose),
                    score: c.score,
                    contact_pt: c.contact,
                })
                .collect();
            log!(
                service.logfile,
                "[req {}] {} grasps, inference time: {:.3}s",
                request_id,
                grasps.len(),
                begin.elapsed().as_secs_f32()
            );
            ServerMessage::GraspResult { request_id, grasps }
        }
        Err(e) => {
            log!(service.logfile, "[req {}] inference error: {:#}", request_id, e);
            ServerMessage::GraspError {
                request_id,
                message: format!("inference error: {:#}", e),
            }
        }
    }
}

// ===========================================================================
// TCP accept loop (runs on a dedicated runtime thread)
// ===========================================================================

async fn handle_connection(
    stream: tokio::net::TcpStream,
    service: Arc<GraspService>,
) -> Result<()> {
    let mut framed = protocol::message_stream(stream);
    loop {
        let msg: ClientMessage = protocol::recv_message(&mut framed).await?;
        match msg {
            ClientMessage::GraspRequest {
                request_id,
                rgb,
                depth,
                seg,
                camera_k,
                segmap_id,
            } => {
                // 推論は同期処理なのでワーカースレッドをブロックして実行
                let response = tokio::task::block_in_place(|| {
                    handle_request(&service, request_id, &rgb, &depth, &seg, &camera_k, segmap_id)
                });
                protocol::send_message(&mut framed, &response).await?;
            }
        }
    }
}

async fn serve(listener: std::net::TcpListener, service: Arc<GraspService>) -> Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    loop {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        log!(service.logfile, "Client connected: {}", addr);

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, Arc::clone(&service)).await {
                log!(service.logfile, "Client {} disconnected: {}", addr, e);
            }
        });
    }
}

// ===========================================================================
// Render loop (main thread)
// ===========================================================================

fn run_render_loop(
    mailbox: &VizMailbox,
    shutdown: &AtomicBool,
    poll_hz: f32,
    logfile: &LogFile,
) -> Result<()> {
    let poll_interval = Duration::from_secs_f32(1.0 / poll_hz);
    let mut viewer: Option<GraspViewer> = None;

    log!(logfile, "Render loop at {} Hz (Esc or Ctrl-C to quit)", poll_hz);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log!(logfile, "Shutting down...");
            return Ok(());
        }
        let start = Instant::now();

        if let Some(payload) = mailbox.try_take() {
            let (h, w, _) = payload.rgb.dim();
            if viewer.is_none() {
                // ウィンドウは最初のペイロードが届いてから作る
                match GraspViewer::new("Contact GraspNet", w, h) {
                    Ok(v) => viewer = Some(v),
                    Err(e) => log!(logfile, "Failed to open window: {}", e),
                }
            }
            if let Some(v) = viewer.as_mut() {
                v.render_image(&payload.rgb, &payload.segmap);
                v.render_cloud(&payload.camera_k, &payload.cloud, payload.colors.as_ref());
                v.render_grasps(&payload.camera_k, &payload.prediction);
                if let Err(e) = v.update() {
                    log!(logfile, "Render error: {}", e);
                }
            }
        } else if let Some(v) = viewer.as_mut() {
            v.pump_events();
        }

        if let Some(v) = viewer.as_ref() {
            if !v.is_open() {
                log!(logfile, "Window closed, shutting down...");
                return Ok(());
            }
        }

        let elapsed = start.elapsed();
        if elapsed < poll_interval {
            std::thread::sleep(poll_interval - elapsed);
        }
    }
}

// ===========================================================================
// Main
// ===========================================================================

fn main() -> Result<()> {
    let config_str = std::fs::read_to_string("grasp_server.toml")
        .context("failed to read grasp_server.toml")?;
    let config: Config = toml::from_str(&config_str)?;
    config.validate()?;

    let logfile = open_log_file()?;
    log!(logfile, "Grasp Server ({})", env!("GIT_VERSION"));
    log!(logfile, "Listen: {}", config.listen_addr);
    log!(logfile, "Checkpoint: {}", config.ckpt_dir);
    log!(
        logfile,
        "z_range: [{}, {}]  local_regions: {}  filter_grasps: {}  skip_border_objects: {}  forward_passes: {}  visualize: {}",
        config.z_range[0],
        config.z_range[1],
        config.local_regions,
        config.filter_grasps,
        config.skip_border_objects,
        config.forward_passes,
        config.visualize
    );
    if config.verbose {
        log!(logfile, "Verbose mode: ON");
    }

    let grasp_estimator = GraspEstimator::from_checkpoint_dir(&config.ckpt_dir, &config.arg_configs)?;
    log!(
        logfile,
        "Model loaded (raw_num_points: {}, score_thres: {})",
        grasp_estimator.config().raw_num_points,
        grasp_estimator.config().score_thres
    );

    // 起動時にバインドしてエラーを即座に報告する
    let listener = std::net::TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    listener.set_nonblocking(true)?;
    log!(logfile, "Listening on {}", config.listen_addr);

    let mailbox = Arc::new(VizMailbox::new());
    let service = Arc::new(GraspService {
        estimator: Mutex::new(grasp_estimator),
        settings: config.pipeline_settings(),
        mailbox: Arc::clone(&mailbox),
        logfile: Arc::clone(&logfile),
        verbose: config.verbose,
    });

    // SIGINT/SIGTERM → 終了フラグ
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    // TCP は専用スレッドのランタイムで受け、メインスレッドは描画に使う
    {
        let service = Arc::clone(&service);
        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("failed to build tokio runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                let logfile = Arc::clone(&service.logfile);
                if let Err(e) = serve(listener, service).await {
                    log!(logfile, "Server error: {}", e);
                }
            });
        });
    }

    run_render_loop(&mailbox, &shutdown, config.poll_hz, &logfile)
}
