//! リクエスト1件分の推論オーケストレーション
//!
//! デコード済みシーンを受け取り、深度のサニタイズ → 点群抽出 →
//! 予測 → 対象キーの絞り込み → 候補列の組み立てを行う。可視化が
//! 有効な場合は、絞り込み前の全シーン予測をメールボックスへ預ける。

use anyhow::Result;
use nalgebra::{Matrix3, Matrix4};
use ndarray::{Array2, Array3};

use crate::estimator::{Estimator, WHOLE_SCENE_ID};
use crate::mailbox::{VizMailbox, VizPayload};

/// デコード済みリクエスト。受信後は不変。
pub struct SceneInput {
    pub rgb: Array3<u8>,
    pub depth: Array2<f32>,
    pub segmap: Array2<i32>,
    pub camera_k: Matrix3<f32>,
    pub segmap_id: i32,
}

/// サーバ設定から渡される推論パラメータ
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub z_range: [f32; 2],
    pub local_regions: bool,
    pub filter_grasps: bool,
    pub skip_border_objects: bool,
    pub visualize: bool,
    pub forward_passes: usize,
}

/// レスポンス1件分の把持候補
pub struct GraspCandidate {
    pub pose: Matrix4<f32>,
    pub score: f32,
    pub contact: [f32; 3],
}

/// レスポンス対象の予測キーを決定
///
/// local_regions / filter_grasps のいずれかが有効なら予測はセグメント
/// IDでキーされるため segmap_id。どちらも無効なら予測は全シーン1件で
/// WHOLE_SCENE_ID にキーされる。
pub fn resolve_target_id(settings: &PipelineSettings, segmap_id: i32) -> i32 {
    if settings.local_regions || settings.filter_grasps {
        segmap_id
    } else {
        WHOLE_SCENE_ID
    }
}

/// シーン1件を推論し、対象セグメントの把持候補を返す
///
/// 対象キーが予測に存在しない場合は空の候補列（エラーではない）。
/// 予測の poses / scores / contacts の長さが食い違う場合はエラー。
/// 可視化ペイロードの deposit はレスポンス確定後に行うため、失敗した
/// リクエストは何も預けない。
pub fn infer<E: Estimator>(
    estimator: &mut E,
    settings: &PipelineSettings,
    scene: &SceneInput,
    mailbox: &VizMailbox,
) -> Result<Vec<GraspCandidate>> {
    // NaN は無効画素として 0 に置換してから幾何計算へ渡す
    let depth = scene
        .depth
        .mapv(|v| if v.is_nan() { 0.0 } else { v });

    let clouds = estimator.extract_point_clouds(
        &depth,
        &scene.camera_k,
        &scene.segmap,
        Some(&scene.rgb),
        settings.skip_border_objects,
        settings.z_range,
    );

    let prediction = estimator.predict_scene_grasps(
        &clouds,
        settings.local_regions,
        settings.filter_grasps,
        settings.forward_passes,
    )?;

    let target_id = resolve_target_id(settings, scene.segmap_id);
    let mut candidates = Vec::new();
    if let Some(grasps) = prediction.get(&target_id) {
        if grasps.poses.len() != grasps.scores.len()
            || grasps.scores.len() != grasps.contacts.len()
        {
            anyhow::bail!(
                "prediction for id {} has mismatched lengths: {} poses, {} scores, {} contacts",
                target_id,
                grasps.poses.len(),
                grasps.scores.len(),
                grasps.contacts.len()
            );
        }
        for i in 0..grasps.scores.len() {
            candidates.push(GraspCandidate {
                pose: grasps.poses[i],
                score: grasps.scores[i],
                contact: grasps.contacts[i],
            });
        }
    }

    if settings.visualize {
        mailbox.deposit(VizPayload {
            rgb: scene.rgb.clone(),
            segmap: scene.segmap.clone(),
            cloud: clouds.full,
            colors: clouds.colors,
            camera_k: scene.camera_k,
            prediction,
        });
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{self, PointCloudSet};
    use crate::estimator::{ScenePrediction, SegmentGrasps};
    use ndarray::arr2;

    /// 受け取った入力を記録し、固定の予測を返すスタブ
    struct StubEstimator {
        prediction: ScenePrediction,
        seen_depth: Option<Array2<f32>>,
        seen_forward_passes: Option<usize>,
    }

    impl StubEstimator {
        fn returning(prediction: ScenePrediction) -> Self {
            Self {
                prediction,
                seen_depth: None,
                seen_forward_passes: None,
            }
        }
    }

    impl Estimator for StubEstimator {
        fn extract_point_clouds(
            &mut self,
            depth: &Array2<f32>,
            k: &Matrix3<f32>,
            segmap: &Array2<i32>,
            rgb: Option<&Array3<u8>>,
            skip_border_objects: bool,
            z_range: [f32; 2],
        ) -> PointCloudSet {
            self.seen_depth = Some(depth.clone());
            cloud::extract_point_clouds(depth, k, segmap, rgb, skip_border_objects, z_range)
        }

        fn predict_scene_grasps(
            &mut self,
            _clouds: &PointCloudSet,
            _local_regions: bool,
            _filter_grasps: bool,
            forward_passes: usize,
        ) -> Result<ScenePrediction> {
            self.seen_forward_passes = Some(forward_passes);
            Ok(self.prediction.clone())
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            z_range: [0.2, 1.1],
            local_regions: false,
            filter_grasps: true,
            skip_border_objects: false,
            visualize: false,
            forward_passes: 5,
        }
    }

    /// 2x2シーン: (0,0)背景 / (0,1)セグメント1 / (1,0)NaN / (1,1)セグメント2
    fn scene_2x2(segmap_id: i32) -> SceneInput {
        SceneInput {
            rgb: Array3::from_elem((2, 2, 3), 128),
            depth: arr2(&[[0.5, 0.6], [f32::NAN, 0.7]]),
            segmap: arr2(&[[0, 1], [0, 2]]),
            camera_k: Matrix3::new(100.0, 0.0, 1.0, 0.0, 100.0, 1.0, 0.0, 0.0, 1.0),
            segmap_id,
        }
    }

    fn grasps_with_scores(scores: &[f32]) -> SegmentGrasps {
        let mut g = SegmentGrasps::default();
        for (i, &s) in scores.iter().enumerate() {
            let mut pose = Matrix4::identity();
            pose[(0, 3)] = i as f32;
            g.poses.push(pose);
            g.scores.push(s);
            g.contacts.push([i as f32, 0.0, 0.5]);
        }
        g
    }

    #[test]
    fn test_resolve_target_id() {
        let mut s = settings();
        s.local_regions = false;
        s.filter_grasps = false;
        assert_eq!(resolve_target_id(&s, 3), WHOLE_SCENE_ID);
        s.filter_grasps = true;
        assert_eq!(resolve_target_id(&s, 3), 3);
        s.local_regions = true;
        s.filter_grasps = false;
        assert_eq!(resolve_target_id(&s, 3), 3);
        s.filter_grasps = true;
        assert_eq!(resolve_target_id(&s, 3), 3);
    }

    #[test]
    fn test_nan_depth_sanitized_before_extraction() {
        let mut prediction = ScenePrediction::new();
        prediction.insert(1, grasps_with_scores(&[0.9]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        infer(&mut stub, &settings(), &scene_2x2(1), &mailbox).unwrap();

        let seen = stub.seen_depth.expect("extract called");
        assert_eq!(seen[[1, 0]], 0.0, "NaN must be replaced by 0");
        assert!(!seen.iter().any(|v| v.is_nan()));
        // 他の画素はそのまま
        assert_eq!(seen[[0, 0]], 0.5);
        assert_eq!(seen[[1, 1]], 0.7);
    }

    #[test]
    fn test_response_matches_target_key_in_order() {
        let mut prediction = ScenePrediction::new();
        prediction.insert(1, grasps_with_scores(&[0.2, 0.9, 0.5]));
        prediction.insert(2, grasps_with_scores(&[0.8]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let out = infer(&mut stub, &settings(), &scene_2x2(1), &mailbox).unwrap();

        // セグメント1の3件のみ、推論器の出力順そのまま
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].score, 0.2);
        assert_eq!(out[1].score, 0.9);
        assert_eq!(out[2].score, 0.5);
        assert_eq!(out[1].pose[(0, 3)], 1.0);
        assert_eq!(stub.seen_forward_passes, Some(5));
    }

    #[test]
    fn test_missing_target_key_yields_empty() {
        let mut prediction = ScenePrediction::new();
        prediction.insert(2, grasps_with_scores(&[0.8]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let out = infer(&mut stub, &settings(), &scene_2x2(1), &mailbox).unwrap();
        assert!(out.is_empty());

        // 予測が空でも同様
        let mut stub = StubEstimator::returning(ScenePrediction::new());
        let out = infer(&mut stub, &settings(), &scene_2x2(1), &mailbox).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_sentinel_key_when_no_filtering() {
        let mut prediction = ScenePrediction::new();
        prediction.insert(WHOLE_SCENE_ID, grasps_with_scores(&[0.4, 0.6]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let mut s = settings();
        s.local_regions = false;
        s.filter_grasps = false;
        // segmap_id はキー解決に使われない
        let out = infer(&mut stub, &s, &scene_2x2(7), &mailbox).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_mismatched_lengths_fail_loudly() {
        let mut bad = grasps_with_scores(&[0.9, 0.8]);
        bad.scores.pop(); // poses 2, scores 1, contacts 2
        let mut prediction = ScenePrediction::new();
        prediction.insert(1, bad);
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let mut s = settings();
        s.visualize = true;
        let err = infer(&mut stub, &s, &scene_2x2(1), &mailbox);
        assert!(err.is_err());
        // 失敗したリクエストは何も預けない
        assert!(mailbox.try_take().is_none());
    }

    #[test]
    fn test_no_deposit_when_visualize_disabled() {
        let mut prediction = ScenePrediction::new();
        prediction.insert(1, grasps_with_scores(&[0.9]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let out = infer(&mut stub, &settings(), &scene_2x2(1), &mailbox).unwrap();
        assert_eq!(out.len(), 1);
        assert!(mailbox.try_take().is_none());
    }

    #[test]
    fn test_deposit_carries_unfiltered_prediction() {
        let mut prediction = ScenePrediction::new();
        prediction.insert(1, grasps_with_scores(&[0.9]));
        prediction.insert(2, grasps_with_scores(&[0.8, 0.7]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let mut s = settings();
        s.visualize = true;
        let out = infer(&mut stub, &s, &scene_2x2(1), &mailbox).unwrap();

        // レスポンスはセグメント1のみ
        assert_eq!(out.len(), 1);

        // ペイロードは全キーを保持する
        let payload = mailbox.try_take().expect("deposit expected");
        assert_eq!(payload.prediction.len(), 2);
        assert_eq!(payload.prediction[&2].len(), 2);
        assert_eq!(payload.rgb[[0, 0, 0]], 128);
        assert_eq!(payload.segmap[[0, 1]], 1);
        // 抽出された点群（NaN画素を除く depth > 0 の3画素、z レンジ内）
        assert_eq!(payload.cloud.nrows(), 3);
        assert!(payload.colors.is_some());
    }

    #[test]
    fn test_zero_depth_scene_keyed_by_background() {
        // 全画素 depth=0 / segmap=0 のシーン。点群は空になるが、
        // 予測にキー 0 があればその候補列がそのまま返る。
        let scene = SceneInput {
            rgb: Array3::zeros((2, 2, 3)),
            depth: Array2::zeros((2, 2)),
            segmap: Array2::zeros((2, 2)),
            camera_k: Matrix3::identity(),
            segmap_id: 0,
        };
        let mut prediction = ScenePrediction::new();
        prediction.insert(0, grasps_with_scores(&[0.6, 0.4]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let out = infer(&mut stub, &settings(), &scene, &mailbox).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].score, 0.6);
        assert_eq!(out[1].score, 0.4);
        // 深度が全て 0 なので抽出された点群は空
        assert_eq!(stub.seen_depth.expect("extract called").iter().sum::<f32>(), 0.0);
    }

    #[test]
    fn test_end_to_end_2x2_scenario() {
        let mut prediction = ScenePrediction::new();
        prediction.insert(1, grasps_with_scores(&[0.3, 0.7]));
        prediction.insert(2, grasps_with_scores(&[0.5]));
        let mut stub = StubEstimator::returning(prediction);
        let mailbox = VizMailbox::new();

        let mut s = settings();
        s.visualize = true;
        let out = infer(&mut stub, &s, &scene_2x2(1), &mailbox).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].score, 0.3);
        assert_eq!(out[1].score, 0.7);
        assert_eq!(out[0].contact, [0.0, 0.0, 0.5]);
        assert_eq!(out[1].contact, [1.0, 0.0, 0.5]);

        let payload = mailbox.try_take().expect("deposit expected");
        assert_eq!(payload.prediction.len(), 2);
        assert!(mailbox.try_take().is_none(), "take consumes the slot");
    }
}
