// 该文件是 雾里看花 项目的一部分。
// src/checker/clip.rs - CLIP 安全检查模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use image::imageops::{self, FilterType};
use ndarray::{Array2, Array4, ArrayView2, Ix2};
use ort::execution_providers::CPUExecutionProvider;
#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Value;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::FromUrl;
use crate::batch::{NhwcBatch, RGB_CHANNELS};
use crate::checker::{CheckedBatch, SafetyChecker, SafetyVerdict};

const SAFETY_NUM_INPUTS: usize = 1;
const SAFETY_NUM_OUTPUTS: usize = 2;
const SAFETY_INPUT_NAME: &str = "clip_input";
const SAFETY_MODEL_FILE: &str = "model.onnx";
const SAFETY_CONCEPTS_FILE: &str = "concepts.json";
const SAFETY_INTRA_THREADS: usize = 4;

const CLIP_INPUT_SIZE: u32 = 224;
const CLIP_PIXEL_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_PIXEL_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

// 任一特别关注概念命中后，所有概念阈值收紧该幅度
const SPECIAL_CARE_TIGHTEN: f32 = 0.01;

#[derive(Error, Debug)]
pub enum SafetyCheckerError {
  #[error("模型文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("推理会话错误: {0}")]
  Session(#[from] ort::Error),
  #[error("概念阈值解析错误: {0}")]
  Concepts(#[from] serde_json::Error),
  #[cfg(feature = "hub")]
  #[error("模型下载失败: {0}")]
  Hub(#[from] hf_hub::api::sync::ApiError),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("模型来源错误: {0}")]
  SourceError(String),
  #[error("推理会话互斥锁中毒")]
  SessionPoisoned,
}

/// 概念阈值文件（concepts.json），与 model.onnx 配套分发。
///
/// 模型输出逐图像、逐概念的余弦相似度，此处的阈值决定相似度
/// 何时构成命中。
#[derive(Debug, Clone, Deserialize)]
pub struct ConceptThresholds {
  /// 特别关注概念的阈值
  pub special: Vec<f32>,
  /// 不当内容概念的阈值
  pub concepts: Vec<f32>,
}

const SAFETY_SCHEME: &str = "safety";
#[cfg(feature = "hub")]
const SAFETY_HUB_SCHEME: &str = "safety+hub";

enum CheckerSource {
  Directory(PathBuf),
  #[cfg(feature = "hub")]
  Hub(String),
}

pub struct ClipSafetyCheckerBuilder {
  source: CheckerSource,
  intra_threads: usize,
}

impl FromUrl for ClipSafetyCheckerBuilder {
  type Error = SafetyCheckerError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SAFETY_SCHEME => Ok(Self::from_dir(url.path())),
      #[cfg(feature = "hub")]
      SAFETY_HUB_SCHEME => Ok(Self::from_hub(url.path())),
      other => Err(SafetyCheckerError::SourceError(format!(
        "不支持的模型来源方案: {}",
        other
      ))),
    }
  }
}

impl ClipSafetyCheckerBuilder {
  /// 从本地目录加载，目录内须有 model.onnx 与 concepts.json。
  pub fn from_dir(path: impl Into<PathBuf>) -> Self {
    ClipSafetyCheckerBuilder {
      source: CheckerSource::Directory(path.into()),
      intra_threads: SAFETY_INTRA_THREADS,
    }
  }

  /// 从模型仓库按名称解析检查点。
  #[cfg(feature = "hub")]
  pub fn from_hub(repo: impl Into<String>) -> Self {
    ClipSafetyCheckerBuilder {
      source: CheckerSource::Hub(repo.into()),
      intra_threads: SAFETY_INTRA_THREADS,
    }
  }

  pub fn intra_threads(mut self, intra_threads: usize) -> Self {
    self.intra_threads = intra_threads;
    self
  }

  fn resolve_files(&self) -> Result<(PathBuf, PathBuf), SafetyCheckerError> {
    match &self.source {
      CheckerSource::Directory(dir) => {
        let model = dir.join(SAFETY_MODEL_FILE);
        let concepts = dir.join(SAFETY_CONCEPTS_FILE);
        if !model.exists() {
          return Err(SafetyCheckerError::SourceError(format!(
            "模型文件不存在: {}",
            model.display()
          )));
        }
        if !concepts.exists() {
          return Err(SafetyCheckerError::SourceError(format!(
            "概念阈值文件不存在: {}",
            concepts.display()
          )));
        }
        Ok((model, concepts))
      }
      #[cfg(feature = "hub")]
      CheckerSource::Hub(repo_id) => {
        info!("从模型仓库解析检查点: {}", repo_id);
        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.repo(hf_hub::Repo::with_revision(
          repo_id.clone(),
          hf_hub::RepoType::Model,
          "main".to_string(),
        ));
        let model = repo.get(SAFETY_MODEL_FILE)?;
        let concepts = repo.get(SAFETY_CONCEPTS_FILE)?;
        Ok((model, concepts))
      }
    }
  }

  pub fn build(self) -> Result<ClipSafetyChecker, SafetyCheckerError> {
    let (model_path, concepts_path) = self.resolve_files()?;

    info!("读取概念阈值: {}", concepts_path.display());
    let thresholds: ConceptThresholds =
      serde_json::from_str(&std::fs::read_to_string(&concepts_path)?)?;
    if thresholds.special.is_empty() || thresholds.concepts.is_empty() {
      error!("概念阈值文件为空");
      return Err(SafetyCheckerError::ModelInvalid(
        "概念阈值文件不能为空".to_string(),
      ));
    }
    debug!(
      "特别关注概念数量: {}, 不当内容概念数量: {}",
      thresholds.special.len(),
      thresholds.concepts.len()
    );

    info!("加载模型文件: {}", model_path.display());
    let session = create_session(&model_path, self.intra_threads)?;
    info!("模型加载完成");

    let num_inputs = session.inputs.len();
    let num_outputs = session.outputs.len();

    if num_inputs != SAFETY_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        SAFETY_NUM_INPUTS, num_inputs
      );
      return Err(SafetyCheckerError::ModelInvalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        SAFETY_NUM_INPUTS, num_inputs
      )));
    }

    if num_outputs != SAFETY_NUM_OUTPUTS {
      error!(
        "预期模型输出数量为 {}, 实际为 {}",
        SAFETY_NUM_OUTPUTS, num_outputs
      );
      return Err(SafetyCheckerError::ModelInvalid(format!(
        "预期模型输出数量为 {}, 实际为 {}",
        SAFETY_NUM_OUTPUTS, num_outputs
      )));
    }

    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    Ok(ClipSafetyChecker {
      session: Mutex::new(session),
      thresholds,
    })
  }
}

fn create_session(model_path: &Path, intra_threads: usize) -> Result<Session, ort::Error> {
  #[cfg(feature = "cuda")]
  {
    let cuda_result = Session::builder()?
      .with_execution_providers([CUDAExecutionProvider::default().build()])?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .with_intra_threads(intra_threads)?
      .commit_from_file(model_path);

    match cuda_result {
      Ok(session) => return Ok(session),
      Err(e) => warn!("CUDA 推理后端初始化失败, 回退到 CPU: {}", e),
    }
  }

  Session::builder()?
    .with_execution_providers([CPUExecutionProvider::default().build()])?
    .with_optimization_level(GraphOptimizationLevel::Level3)?
    .with_intra_threads(intra_threads)?
    .commit_from_file(model_path)
}

/// 基于 CLIP 视觉特征的安全检查模型。
///
/// 推理会话以互斥锁保护，多线程宿主可共享同一实例。
pub struct ClipSafetyChecker {
  session: Mutex<Session>,
  thresholds: ConceptThresholds,
}

impl ClipSafetyChecker {
  pub fn thresholds(&self) -> &ConceptThresholds {
    &self.thresholds
  }

  /// CLIP 输入特征提取: 缩放到 224x224 并按通道均值方差归一化。
  fn extract_features(&self, images: &NhwcBatch) -> Array4<f32> {
    let size = CLIP_INPUT_SIZE as usize;
    let mut input = Array4::<f32>::zeros((images.len(), RGB_CHANNELS, size, size));

    let rendered = images.to_images();
    for (n, image) in rendered.iter().enumerate() {
      let resized = imageops::resize(image, CLIP_INPUT_SIZE, CLIP_INPUT_SIZE, FilterType::CatmullRom);
      for c in 0..RGB_CHANNELS {
        for y in 0..size {
          for x in 0..size {
            let value = resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            input[[n, c, y, x]] = (value - CLIP_PIXEL_MEAN[c]) / CLIP_PIXEL_STD[c];
          }
        }
      }
    }

    input
  }
}

impl SafetyChecker for ClipSafetyChecker {
  type Error = SafetyCheckerError;

  fn check(&self, images: &NhwcBatch, adjustment: f32) -> Result<CheckedBatch, Self::Error> {
    debug!("提取 CLIP 输入特征");
    let clip_input = self.extract_features(images);

    debug!("执行安全评分推理");
    let (special_scores, concept_scores): (Array2<f32>, Array2<f32>) = {
      let mut session = self
        .session
        .lock()
        .map_err(|_| SafetyCheckerError::SessionPoisoned)?;
      let outputs = session.run(ort::inputs![
        SAFETY_INPUT_NAME => Value::from_array(clip_input)?
      ])?;

      let special = outputs[0]
        .try_extract_array::<f32>()?
        .into_dimensionality::<Ix2>()
        .map_err(|e| {
          SafetyCheckerError::ModelInvalid(format!("特别关注输出维度错误: {}", e))
        })?
        .to_owned();
      let concept = outputs[1]
        .try_extract_array::<f32>()?
        .into_dimensionality::<Ix2>()
        .map_err(|e| {
          SafetyCheckerError::ModelInvalid(format!("概念输出维度错误: {}", e))
        })?
        .to_owned();
      (special, concept)
    };

    if special_scores.nrows() != images.len()
      || special_scores.ncols() != self.thresholds.special.len()
      || concept_scores.nrows() != images.len()
      || concept_scores.ncols() != self.thresholds.concepts.len()
    {
      error!(
        "评分输出形状不匹配: 特别关注 {}x{}, 概念 {}x{}, 批大小 {}",
        special_scores.nrows(),
        special_scores.ncols(),
        concept_scores.nrows(),
        concept_scores.ncols(),
        images.len()
      );
      return Err(SafetyCheckerError::ModelInvalid(format!(
        "评分输出形状与批大小或概念数量不匹配: 特别关注 {}x{}, 概念 {}x{}",
        special_scores.nrows(),
        special_scores.ncols(),
        concept_scores.nrows(),
        concept_scores.ncols()
      )));
    }

    let verdicts = resolve_verdicts(
      special_scores.view(),
      concept_scores.view(),
      &self.thresholds,
      adjustment,
    );

    // 命中的图像在评分输出中置空，模糊被禁用时该处置仍然可见
    let mut adjusted = images.clone();
    let mut flagged_count = 0usize;
    {
      let plane = RGB_CHANNELS * images.height() * images.width();
      let slice = adjusted.as_mut_slice();
      for (n, verdict) in verdicts.iter().enumerate() {
        if verdict.flagged {
          flagged_count += 1;
          slice[n * plane..(n + 1) * plane].fill(0.0);
        }
      }
    }
    if flagged_count > 0 {
      warn!("检测到 {} 张疑似不当内容图像，已在评分输出中置空", flagged_count);
    }

    Ok(CheckedBatch {
      images: adjusted,
      verdicts,
    })
  }
}

/// 把逐概念相似度归结为逐图像判定。
///
/// `adjustment` 为正时判定更严格，为负时更宽松。
fn resolve_verdicts(
  special_scores: ArrayView2<f32>,
  concept_scores: ArrayView2<f32>,
  thresholds: &ConceptThresholds,
  adjustment: f32,
) -> Box<[SafetyVerdict]> {
  let mut verdicts = Vec::with_capacity(special_scores.nrows());

  for n in 0..special_scores.nrows() {
    let mut special_care = false;
    for (s, threshold) in thresholds.special.iter().enumerate() {
      if special_scores[[n, s]] - threshold + adjustment > 0.0 {
        debug!("图像 {} 命中特别关注概念 {}", n, s);
        special_care = true;
      }
    }

    let tighten = if special_care { SPECIAL_CARE_TIGHTEN } else { 0.0 };
    let mut flagged = false;
    let mut score = f32::MIN;
    for (c, threshold) in thresholds.concepts.iter().enumerate() {
      let margin = concept_scores[[n, c]] - threshold + adjustment + tighten;
      if margin > score {
        score = margin;
      }
      if margin > 0.0 {
        flagged = true;
      }
    }

    verdicts.push(SafetyVerdict { flagged, score });
  }

  verdicts.into_boxed_slice()
}

static GLOBAL_CHECKER: OnceLock<ClipSafetyChecker> = OnceLock::new();

/// 进程级共享检查器: 首次调用完成昂贵的模型加载，此后复用同一实例。
///
/// 并发的首次调用可能各自加载一次模型，但只有一份会被保留，
/// 之后的调用忽略传入的构造器。
pub fn global_checker(
  builder: ClipSafetyCheckerBuilder,
) -> Result<&'static ClipSafetyChecker, SafetyCheckerError> {
  if let Some(checker) = GLOBAL_CHECKER.get() {
    return Ok(checker);
  }

  let checker = builder.build()?;
  Ok(GLOBAL_CHECKER.get_or_init(|| checker))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scores(rows: usize, cols: usize, values: &[f32]) -> Array2<f32> {
    Array2::from_shape_vec((rows, cols), values.to_vec()).unwrap()
  }

  fn thresholds() -> ConceptThresholds {
    ConceptThresholds {
      special: vec![0.5],
      concepts: vec![0.3, 0.4],
    }
  }

  #[test]
  fn below_threshold_is_safe() {
    let verdicts = resolve_verdicts(
      scores(1, 1, &[0.1]).view(),
      scores(1, 2, &[0.1, 0.2]).view(),
      &thresholds(),
      0.0,
    );
    assert_eq!(verdicts.len(), 1);
    assert!(!verdicts[0].flagged);
    assert!(verdicts[0].score < 0.0);
  }

  #[test]
  fn above_threshold_is_flagged() {
    let verdicts = resolve_verdicts(
      scores(1, 1, &[0.1]).view(),
      scores(1, 2, &[0.35, 0.2]).view(),
      &thresholds(),
      0.0,
    );
    assert!(verdicts[0].flagged);
    assert!((verdicts[0].score - 0.05).abs() < 1e-6);
  }

  #[test]
  fn positive_adjustment_is_stricter() {
    let special = scores(1, 1, &[0.1]);
    let concept = scores(1, 2, &[0.25, 0.2]);

    let neutral = resolve_verdicts(special.view(), concept.view(), &thresholds(), 0.0);
    assert!(!neutral[0].flagged);

    let strict = resolve_verdicts(special.view(), concept.view(), &thresholds(), 0.1);
    assert!(strict[0].flagged);
  }

  #[test]
  fn negative_adjustment_is_looser() {
    let special = scores(1, 1, &[0.1]);
    let concept = scores(1, 2, &[0.35, 0.2]);

    let loose = resolve_verdicts(special.view(), concept.view(), &thresholds(), -0.1);
    assert!(!loose[0].flagged);
  }

  #[test]
  fn special_care_tightens_concept_thresholds() {
    // 概念裕量为 -0.005，常规判定安全
    let concept = scores(1, 2, &[0.295, 0.2]);

    let relaxed = resolve_verdicts(
      scores(1, 1, &[0.1]).view(),
      concept.view(),
      &thresholds(),
      0.0,
    );
    assert!(!relaxed[0].flagged);

    // 特别关注命中后阈值收紧 0.01，同一概念转为命中
    let careful = resolve_verdicts(
      scores(1, 1, &[0.6]).view(),
      concept.view(),
      &thresholds(),
      0.0,
    );
    assert!(careful[0].flagged);
  }

  #[test]
  fn verdicts_align_with_rows() {
    let verdicts = resolve_verdicts(
      scores(3, 1, &[0.1, 0.9, 0.1]).view(),
      scores(3, 2, &[0.1, 0.1, 0.5, 0.1, 0.295, 0.1]).view(),
      &thresholds(),
      0.0,
    );
    assert_eq!(verdicts.len(), 3);
    assert!(!verdicts[0].flagged);
    assert!(verdicts[1].flagged);
    // 第三张图像本身低于阈值，且未触发特别关注
    assert!(!verdicts[2].flagged);
  }

  #[test]
  fn builder_rejects_unknown_scheme() {
    let url = Url::parse("model:whatever").unwrap();
    assert!(matches!(
      ClipSafetyCheckerBuilder::from_url(&url),
      Err(SafetyCheckerError::SourceError(_))
    ));
  }

  #[test]
  fn builder_rejects_missing_directory() {
    let url = Url::parse("safety:/no/such/directory").unwrap();
    let builder = ClipSafetyCheckerBuilder::from_url(&url).unwrap();
    assert!(matches!(
      builder.build(),
      Err(SafetyCheckerError::SourceError(_))
    ));
  }

  #[test]
  fn global_checker_propagates_build_errors() {
    let builder = ClipSafetyCheckerBuilder::from_dir("/no/such/directory");
    assert!(global_checker(builder).is_err());
  }
}
