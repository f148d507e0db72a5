// 该文件是 雾里看花 项目的一部分。
// src/censor.rs - 批量处置
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

use anyhow::Result;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::batch::{self, NchwBatch};
use crate::checker::SafetyChecker;

/// 单次处置调用的参数。
#[derive(Debug, Clone)]
pub struct CensorOptions {
  /// 是否启用过滤，关闭时批次原样通过
  pub enabled: bool,
  /// 灵敏度调整，正值更严格，负值更宽松
  pub adjustment: f32,
  /// 高斯模糊半径，0 表示不模糊
  pub blur_radius: f32,
}

impl Default for CensorOptions {
  fn default() -> Self {
    CensorOptions {
      enabled: true,
      adjustment: 0.0,
      blur_radius: 50.0,
    }
  }
}

impl CensorOptions {
  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_adjustment(mut self, adjustment: f32) -> Self {
    self.adjustment = adjustment;
    self
  }

  pub fn with_blur_radius(mut self, blur_radius: f32) -> Self {
    self.blur_radius = blur_radius;
    self
  }
}

/// 单张图像的处置结果。
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
  /// 判定安全，图像未被改动
  Passed,
  /// 判定不当，已用原图的模糊渲染替换
  Blurred { radius: f32 },
  /// 判定不当但模糊被禁用，保留评分模型处理后的图像
  Masked,
  /// 判定不当且模糊失败，保留评分模型处理后的图像
  BlurFailed { reason: String },
}

impl Disposition {
  pub fn is_flagged(&self) -> bool {
    !matches!(self, Disposition::Passed)
  }
}

/// 一个批次的处置报告，条目与图像按输入顺序对齐。
#[derive(Debug, Clone)]
pub struct CensorReport {
  items: Box<[Disposition]>,
}

impl CensorReport {
  pub fn items(&self) -> &[Disposition] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn flagged_count(&self) -> usize {
    self.items.iter().filter(|item| item.is_flagged()).count()
  }

  pub fn failed_count(&self) -> usize {
    self
      .items
      .iter()
      .filter(|item| matches!(item, Disposition::BlurFailed { .. }))
      .count()
  }
}

#[derive(Error, Debug)]
pub enum BlurError {
  #[error("模糊半径无效: {0}")]
  InvalidRadius(f32),
  #[error("模糊输出尺寸不匹配: 期望 {expected_width}x{expected_height}, 实际 {actual_width}x{actual_height}")]
  DimensionMismatch {
    expected_width: u32,
    expected_height: u32,
    actual_width: u32,
    actual_height: u32,
  },
  #[error(transparent)]
  Batch(#[from] batch::BatchError),
}

/// 批量处置入口: 评分整批图像，把判定不当的图像替换为原图的模糊渲染。
///
/// 纯函数：输入批不被改动，调用方用返回的新批替换自己的引用。
/// 评分失败与形状不一致使整个调用失败；单张图像的模糊失败只记录
/// 在报告中，不影响批内其他图像。
pub fn censor_batch<C>(
  checker: &C,
  batch: &NchwBatch,
  options: &CensorOptions,
) -> Result<(NchwBatch, CensorReport)>
where
  C: SafetyChecker,
  C::Error: std::error::Error + Send + Sync + 'static,
{
  censor_with_blur(checker, batch, options, gaussian_blur)
}

fn censor_with_blur<C, B>(
  checker: &C,
  batch: &NchwBatch,
  options: &CensorOptions,
  blur: B,
) -> Result<(NchwBatch, CensorReport)>
where
  C: SafetyChecker,
  C::Error: std::error::Error + Send + Sync + 'static,
  B: Fn(&RgbImage, f32) -> Result<RgbImage, BlurError>,
{
  if !options.enabled {
    debug!("过滤未启用，批次原样通过");
    let items = vec![Disposition::Passed; batch.len()].into_boxed_slice();
    return Ok((batch.clone(), CensorReport { items }));
  }

  // 转换: 重排为 NHWC，并渲染评分前的 8 位图像供模糊使用
  let nhwc = batch.to_nhwc();
  let originals = nhwc.to_images();

  // 评分
  let checked = checker.check(&nhwc, options.adjustment)?;
  anyhow::ensure!(
    checked.verdicts.len() == batch.len(),
    "判定数量与批大小不一致: {} != {}",
    checked.verdicts.len(),
    batch.len()
  );
  anyhow::ensure!(
    checked.images.len() == batch.len()
      && checked.images.height() == batch.height()
      && checked.images.width() == batch.width(),
    "评分输出形状与输入不一致"
  );

  // 重组: 评分输出转回 NCHW，作为工作输出批
  let mut output = checked.images.to_nchw();

  // 逐图像处置
  let mut items = Vec::with_capacity(batch.len());
  for (index, verdict) in checked.verdicts.iter().enumerate() {
    if !verdict.flagged {
      items.push(Disposition::Passed);
      continue;
    }

    if options.blur_radius <= 0.0 {
      debug!("图像 {} 判定不当，模糊被禁用", index);
      items.push(Disposition::Masked);
      continue;
    }

    info!("模糊处理图像 {}，半径 {}", index, options.blur_radius);
    match remediate(
      &mut output,
      index,
      &originals[index],
      options.blur_radius,
      &blur,
    ) {
      Ok(()) => items.push(Disposition::Blurred {
        radius: options.blur_radius,
      }),
      Err(e) => {
        warn!("图像 {} 模糊处理失败: {}", index, e);
        items.push(Disposition::BlurFailed {
          reason: e.to_string(),
        });
      }
    }
  }

  Ok((
    output,
    CensorReport {
      items: items.into_boxed_slice(),
    },
  ))
}

/// 单张图像的模糊替换。失败时输出批保持评分后的状态。
fn remediate<B>(
  output: &mut NchwBatch,
  index: usize,
  original: &RgbImage,
  radius: f32,
  blur: &B,
) -> Result<(), BlurError>
where
  B: Fn(&RgbImage, f32) -> Result<RgbImage, BlurError>,
{
  let blurred = blur(original, radius)?;
  if blurred.width() != original.width() || blurred.height() != original.height() {
    return Err(BlurError::DimensionMismatch {
      expected_width: original.width(),
      expected_height: original.height(),
      actual_width: blurred.width(),
      actual_height: blurred.height(),
    });
  }

  let plane = batch::image_to_nchw(&blurred);
  output.replace_image(index, &plane)?;
  Ok(())
}

/// 高斯模糊渲染，半径即高斯核的标准差。
fn gaussian_blur(image: &RgbImage, radius: f32) -> Result<RgbImage, BlurError> {
  if !radius.is_finite() || radius <= 0.0 {
    return Err(BlurError::InvalidRadius(radius));
  }

  Ok(imageproc::filter::gaussian_blur_f32(image, radius))
}
