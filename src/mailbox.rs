//! 可視化ペイロードの単一スロット受け渡し
//!
//! 推論側が `deposit`、メインスレッドの描画ループが `try_take` する。
//! スロットは常に最新の1件のみ保持し、未消費分は新しいペイロードで
//! 上書きされる。キューイングはしない。

use std::sync::Mutex;

use nalgebra::Matrix3;
use ndarray::{Array2, Array3};

use crate::estimator::ScenePrediction;

/// 描画1回分のペイロード
///
/// `prediction` はフィルタ前の全シーン予測（レスポンスの絞り込みとは
/// 独立に、シーン全体を描画するため）。
pub struct VizPayload {
    pub rgb: Array3<u8>,
    pub segmap: Array2<i32>,
    /// 全シーン点群 (N, 3)
    pub cloud: Array2<f32>,
    /// `cloud` と行対応する RGB 色
    pub colors: Option<Array2<u8>>,
    /// 点群・接触点を画像へ再投影するための K
    pub camera_k: Matrix3<f32>,
    pub prediction: ScenePrediction,
}

#[derive(Default)]
pub struct VizMailbox {
    slot: Mutex<Option<VizPayload>>,
}

impl VizMailbox {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// ペイロードを格納（未消費分は破棄される）
    pub fn deposit(&self, payload: VizPayload) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(payload);
    }

    /// 格納済みペイロードを取り出す。空なら None。
    pub fn try_take(&self) -> Option<VizPayload> {
        let mut slot = self.slot.lock().unwrap();
        slot.take()
    }
}
