//! ONNX モデルによる把持姿勢予測
//!
//! チェックポイントディレクトリ（config.json + model.onnx）から
//! セッションを一度だけ構築し、リクエストごとに点群を推論する。
//!
//! モデル入出力の契約:
//! - 入力 `points`: f32 [1, N, 3]
//! - 出力 `pred_grasps_cam`: f32 [1, M, 4, 4]（カメラ座標系、行優先）
//! - 出力 `scores`: f32 [1, M]
//! - 出力 `contact_pts`: f32 [1, M, 3]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{Matrix3, Matrix4};
use ndarray::{Array2, Array3, ArrayViewD};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;

use crate::cloud::{self, PointCloudSet};

// --- モデル設定 (config.json) ---

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// チェックポイント内のモデルファイル名
    #[serde(default = "default_model_file")]
    pub model_file: String,
    /// 1パスあたりの入力点数
    #[serde(default = "default_raw_num_points")]
    pub raw_num_points: usize,
    /// このスコア未満の候補を破棄
    #[serde(default = "default_score_thres")]
    pub score_thres: f32,
    /// 接触点をセグメントに割り当てる距離閾値（二乗メートル）
    #[serde(default = "default_segment_assign_thres")]
    pub segment_assign_thres: f32,
    /// 局所クロップ立方体の最小辺長（メートル）
    #[serde(default = "default_local_crop_min_size")]
    pub local_crop_min_size: f32,
    /// 局所クロップ立方体の最大辺長（メートル）
    #[serde(default = "default_local_crop_max_size")]
    pub local_crop_max_size: f32,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default = "default_output_grasps")]
    pub output_grasps: String,
    #[serde(default = "default_output_scores")]
    pub output_scores: String,
    #[serde(default = "default_output_contacts")]
    pub output_contacts: String,
}

fn default_model_file() -> String { "model.onnx".to_string() }
fn default_raw_num_points() -> usize { 20000 }
fn default_score_thres() -> f32 { 0.19 }
fn default_segment_assign_thres() -> f32 { 1e-4 }
fn default_local_crop_min_size() -> f32 { 0.3 }
fn default_local_crop_max_size() -> f32 { 0.6 }
fn default_input_name() -> String { "points".to_string() }
fn default_output_grasps() -> String { "pred_grasps_cam".to_string() }
fn default_output_scores() -> String { "scores".to_string() }
fn default_output_contacts() -> String { "contact_pts".to_string() }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_file: default_model_file(),
            raw_num_points: default_raw_num_points(),
            score_thres: default_score_thres(),
            segment_assign_thres: default_segment_assign_thres(),
            local_crop_min_size: default_local_crop_min_size(),
            local_crop_max_size: default_local_crop_max_size(),
            input_name: default_input_name(),
            output_grasps: default_output_grasps(),
            output_scores: default_output_scores(),
            output_contacts: default_output_contacts(),
        }
    }
}

impl ModelConfig {
    /// config.json を読み込み、`dotted.path:value` 形式の上書きを適用
    pub fn load<P: AsRef<Path>>(path: P, arg_configs: &[String]) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        let mut value: serde_json::Value =
            serde_json::from_str(&content).context("invalid model config json")?;
        apply_overrides(&mut value, arg_configs)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// `dotted.path:value` の上書きを JSON 値へ適用
///
/// 値は JSON として解釈し、解釈できなければ文字列として挿入する。
pub fn apply_overrides(value: &mut serde_json::Value, overrides: &[String]) -> Result<()> {
    for entry in overrides {
        let (path, raw) = entry
            .split_once(':')
            .with_context(|| format!("invalid override (expected path:value): {}", entry))?;
        let parsed: serde_json::Value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));

        let mut segs = path.split('.').peekable();
        let mut cur = &mut *value;
        loop {
            let seg = match segs.next() {
                Some(s) if !s.is_empty() => s,
                _ => anyhow::bail!("invalid override path: {}", entry),
            };
            let obj = cur
                .as_object_mut()
                .with_context(|| format!("override path {} does not address an object", path))?;
            if segs.peek().is_none() {
                obj.insert(seg.to_string(), parsed);
                break;
            }
            cur = obj
                .entry(seg.to_string())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }
    }
    Ok(())
}

// --- 予測結果 ---

/// セグメント1件分の予測（3つの Vec は添字対応）
#[derive(Debug, Clone, Default)]
pub struct SegmentGrasps {
    pub poses: Vec<Matrix4<f32>>,
    pub scores: Vec<f32>,
    pub contacts: Vec<[f32; 3]>,
}

impl SegmentGrasps {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// セグメントID → 予測。シーン全体の予測は ID -1 に入る。
pub type ScenePrediction = BTreeMap<i32, SegmentGrasps>;

/// 全シーン予測のセンチネルキー
pub const WHOLE_SCENE_ID: i32 = -1;

// --- 推論シーム ---

/// パイプラインから見た推論器のインタフェース
pub trait Estimator {
    fn extract_point_clouds(
        &mut self,
        depth: &Array2<f32>,
        k: &Matrix3<f32>,
        segmap: &Array2<i32>,
        rgb: Option<&Array3<u8>>,
        skip_border_objects: bool,
        z_range: [f32; 2],
    ) -> PointCloudSet;

    fn predict_scene_grasps(
        &mut self,
        clouds: &PointCloudSet,
        local_regions: bool,
        filter_grasps: bool,
        forward_passes: usize,
    ) -> Result<ScenePrediction>;
}

// --- ONNX 推論器 ---

fn build_session(model_path: &Path) -> Result<Session> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "cuda")]
    let builder = {
        eprintln!("[ort] Attempting CUDA execution provider...");
        builder.with_execution_providers([ort::execution_providers::CUDAExecutionProvider::default().build()])?
    };

    builder
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model {}", model_path.display()))
}

pub struct GraspEstimator {
    session: Session,
    config: ModelConfig,
    rng: StdRng,
}

impl GraspEstimator {
    /// チェックポイントディレクトリから構築
    pub fn from_checkpoint_dir<P: AsRef<Path>>(ckpt_dir: P, arg_configs: &[String]) -> Result<Self> {
        let ckpt_dir = ckpt_dir.as_ref();
        let config = ModelConfig::load(ckpt_dir.join("config.json"), arg_configs)?;
        let session = build_session(&ckpt_dir.join(&config.model_file))?;
        Ok(Self {
            session,
            config,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// 点群1つに対して forward_passes 回推論し、候補を連結する
    ///
    /// 各パスで点数を regularize し直すため、入力サンプリングが
    /// パスごとに変わる。score_thres 未満の候補はここで落とす。
    fn predict_raw(&mut self, cloud: &Array2<f32>, forward_passes: usize) -> Result<SegmentGrasps> {
        let mut out = SegmentGrasps::default();
        if cloud.nrows() == 0 {
            return Ok(out);
        }

        for _ in 0..forward_passes {
            let reg = cloud::regularize_cloud(cloud, self.config.raw_num_points, &mut self.rng);
            let n = reg.nrows();
            let mut input = Array3::<f32>::zeros((1, n, 3));
            for i in 0..n {
                for j in 0..3 {
                    input[[0, i, j]] = reg[[i, j]];
                }
            }

            let input_tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.config.input_name.as_str() => input_tensor])
                .context("Inference failed")?;

            let grasps: ArrayViewD<f32> = outputs[self.config.output_grasps.as_str()]
                .try_extract_array()
                .context("Failed to extract grasp output")?;
            let scores: ArrayViewD<f32> = outputs[self.config.output_scores.as_str()]
                .try_extract_array()
                .context("Failed to extract score output")?;
            let contacts: ArrayViewD<f32> = outputs[self.config.output_contacts.as_str()]
                .try_extract_array()
                .context("Failed to extract contact output")?;

            let m = check_output_shapes(&grasps, &scores, &contacts)?;
            for i in 0..m {
                let score = scores[[0, i]];
                if score < self.config.score_thres {
                    continue;
                }
                let pose = Matrix4::from_fn(|r, c| grasps[[0, i, r, c]]);
                out.poses.push(pose);
                out.scores.push(score);
                out.contacts
                    .push([contacts[[0, i, 0]], contacts[[0, i, 1]], contacts[[0, i, 2]]]);
            }
        }
        Ok(out)
    }
}

impl Estimator for GraspEstimator {
    fn extract_point_clouds(
        &mut self,
        depth: &Array2<f32>,
        k: &Matrix3<f32>,
        segmap: &Array2<i32>,
        rgb: Option<&Array3<u8>>,
        skip_border_objects: bool,
        z_range: [f32; 2],
    ) -> PointCloudSet {
        cloud::extract_point_clouds(depth, k, segmap, rgb, skip_border_objects, z_range)
    }

    /// シーン点群から把持候補を予測
    ///
    /// - local_regions: セグメントごとに局所クロップして推論（キー = セグメントID）
    /// - filter_grasps: 接触点の近接でセグメントへ割り当て
    /// - どちらも無効: 全シーン1件、キー = WHOLE_SCENE_ID
    fn predict_scene_grasps(
        &mut self,
        clouds: &PointCloudSet,
        local_regions: bool,
        filter_grasps: bool,
        forward_passes: usize,
    ) -> Result<ScenePrediction> {
        let mut prediction = ScenePrediction::new();

        if local_regions {
            for (id, segment) in &clouds.segments {
                if segment.nrows() == 0 {
                    continue;
                }
                let local = cloud::crop_local_region(
                    &clouds.full,
                    segment,
                    self.config.local_crop_min_size,
                    self.config.local_crop_max_size,
                );
                if local.nrows() == 0 {
                    continue;
                }
                let raw = self.predict_raw(&local, forward_passes)?;
                let grasps = if filter_grasps {
                    filter_to_segment(&raw, segment, self.config.segment_assign_thres)
                } else {
                    raw
                };
                prediction.insert(*id, grasps);
            }
        } else {
            if clouds.full.nrows() == 0 {
                return Ok(prediction);
            }
            let raw = self.predict_raw(&clouds.full, forward_passes)?;
            if filter_grasps {
                for (id, segment) in &clouds.segments {
                    prediction.insert(
                        *id,
                        filter_to_segment(&raw, segment, self.config.segment_assign_thres),
                    );
                }
            } else {
                prediction.insert(WHOLE_SCENE_ID, raw);
            }
        }
        Ok(prediction)
    }
}

/// モデル出力3本の形状を照合し、候補数 M を返す
///
/// ランクだけでなく各次元を突き合わせる。契約
/// （[1, M, 4, 4] / [1, M] / [1, M, 3]）を満たさない出力は
/// 添字アクセスに入る前にエラーとして返す。
fn check_output_shapes(
    grasps: &ArrayViewD<f32>,
    scores: &ArrayViewD<f32>,
    contacts: &ArrayViewD<f32>,
) -> Result<usize> {
    if scores.ndim() != 2 || scores.shape()[0] != 1 {
        anyhow::bail!("unexpected score output shape: {:?}", scores.shape());
    }
    let m = scores.shape()[1];
    if grasps.shape() != &[1, m, 4, 4] || contacts.shape() != &[1, m, 3] {
        anyhow::bail!(
            "unexpected output shapes: grasps {:?}, scores {:?}, contacts {:?}",
            grasps.shape(),
            scores.shape(),
            contacts.shape()
        );
    }
    Ok(m)
}

/// 接触点がセグメント点群から `thres`（二乗距離）以内の候補のみ残す
pub fn filter_to_segment(raw: &SegmentGrasps, segment: &Array2<f32>, thres: f32) -> SegmentGrasps {
    let mut out = SegmentGrasps::default();
    if segment.nrows() == 0 {
        return out;
    }
    for i in 0..raw.len() {
        let c = raw.contacts[i];
        let mut best = f32::MAX;
        for s in 0..segment.nrows() {
            let dx = c[0] - segment[[s, 0]];
            let dy = c[1] - segment[[s, 1]];
            let dz = c[2] - segment[[s, 2]];
            let d2 = dx * dx + dy * dy + dz * dz;
            if d2 < best {
                best = d2;
            }
        }
        if best < thres {
            out.poses.push(raw.poses[i]);
            out.scores.push(raw.scores[i]);
            out.contacts.push(c);
        }
    }
    out
}

/// 4x4 姿勢を行優先でフラット化（ワイヤ形式）
pub fn flatten_row_major(pose: &Matrix4<f32>) -> [f32; 16] {
    let mut out = [0.0; 16];
    for i in 0..4 {
        for j in 0..4 {
            out[i * 4 + j] = pose[(i, j)];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array1, Array4};
    use std::io::Write;

    #[test]
    fn test_apply_overrides_nested() {
        let mut value = serde_json::json!({"a": {"b": 1}, "x": 2.0});
        let overrides = vec!["a.b:2".to_string(), "x:0.5".to_string(), "a.c.d:true".to_string()];
        apply_overrides(&mut value, &overrides).unwrap();
        assert_eq!(value["a"]["b"], serde_json::json!(2));
        assert_eq!(value["x"], serde_json::json!(0.5));
        assert_eq!(value["a"]["c"]["d"], serde_json::json!(true));
    }

    #[test]
    fn test_apply_overrides_string_fallback() {
        let mut value = serde_json::json!({});
        apply_overrides(&mut value, &["name:model2.onnx".to_string()]).unwrap();
        assert_eq!(value["name"], serde_json::json!("model2.onnx"));
    }

    #[test]
    fn test_apply_overrides_rejects_malformed() {
        let mut value = serde_json::json!({});
        assert!(apply_overrides(&mut value, &["no_colon".to_string()]).is_err());
        assert!(apply_overrides(&mut value, &[":5".to_string()]).is_err());
    }

    #[test]
    fn test_model_config_load_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"raw_num_points": 123}}"#).unwrap();
        drop(f);

        let config =
            ModelConfig::load(&path, &["score_thres:0.5".to_string()]).unwrap();
        assert_eq!(config.raw_num_points, 123);
        assert_eq!(config.score_thres, 0.5);
        // 未指定フィールドはデフォルト
        assert_eq!(config.input_name, "points");
        assert_eq!(config.model_file, "model.onnx");
    }

    #[test]
    fn test_check_output_shapes() {
        let grasps = Array4::<f32>::zeros((1, 2, 4, 4)).into_dyn();
        let scores = Array2::<f32>::zeros((1, 2)).into_dyn();
        let contacts = Array3::<f32>::zeros((1, 2, 3)).into_dyn();
        let m = check_output_shapes(&grasps.view(), &scores.view(), &contacts.view()).unwrap();
        assert_eq!(m, 2);

        // スコアと候補数が食い違う出力は拒否
        let short = Array4::<f32>::zeros((1, 1, 4, 4)).into_dyn();
        assert!(check_output_shapes(&short.view(), &scores.view(), &contacts.view()).is_err());
        let short = Array3::<f32>::zeros((1, 1, 3)).into_dyn();
        assert!(check_output_shapes(&grasps.view(), &scores.view(), &short.view()).is_err());

        // 末尾次元が 4x4 / 3 でない出力は拒否
        let bad_pose = Array4::<f32>::zeros((1, 2, 3, 3)).into_dyn();
        assert!(check_output_shapes(&bad_pose.view(), &scores.view(), &contacts.view()).is_err());
        let bad_contact = Array3::<f32>::zeros((1, 2, 2)).into_dyn();
        assert!(check_output_shapes(&grasps.view(), &scores.view(), &bad_contact.view()).is_err());

        // スコアのランク違いは拒否
        let bad_scores = Array1::<f32>::zeros(2).into_dyn();
        assert!(check_output_shapes(&grasps.view(), &bad_scores.view(), &contacts.view()).is_err());
    }

    #[test]
    fn test_filter_to_segment() {
        let mut raw = SegmentGrasps::default();
        raw.poses.push(Matrix4::identity());
        raw.scores.push(0.9);
        raw.contacts.push([0.0, 0.0, 0.5]); // セグメント上
        raw.poses.push(Matrix4::identity());
        raw.scores.push(0.8);
        raw.contacts.push([1.0, 1.0, 1.0]); // 遠方

        let segment = arr2(&[[0.0, 0.0, 0.5], [0.01, 0.0, 0.5]]);
        let filtered = filter_to_segment(&raw, &segment, 1e-4);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.scores[0], 0.9);

        // 空セグメントには何も割り当てない
        let empty = Array2::zeros((0, 3));
        assert!(filter_to_segment(&raw, &empty, 1e-4).is_empty());
    }

    #[test]
    fn test_flatten_row_major() {
        let pose = Matrix4::new(
            1.0, 2.0, 3.0, 4.0,
            5.0, 6.0, 7.0, 8.0,
            9.0, 10.0, 11.0, 12.0,
            13.0, 14.0, 15.0, 16.0,
        );
        let flat = flatten_row_major(&pose);
        for i in 0..16 {
            assert_eq!(flat[i], (i + 1) as f32);
        }
    }
}
