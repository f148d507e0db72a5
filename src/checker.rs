// 该文件是 雾里看花 项目的一部分。
// src/checker.rs - 安全检查器定义
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

use crate::batch::NhwcBatch;

pub trait SafetyChecker {
  type Error;

  fn check(&self, images: &NhwcBatch, adjustment: f32) -> Result<CheckedBatch, Self::Error>;
}

/// 单张图像的安全判定。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyVerdict {
  /// 是否判定为不当内容
  pub flagged: bool,
  /// 最强概念裕量，正值表示命中，越大越确定
  pub score: f32,
}

/// 整批图像的评分结果，判定与图像按输入顺序对齐。
#[derive(Debug, Clone)]
pub struct CheckedBatch {
  pub images: NhwcBatch,
  pub verdicts: Box<[SafetyVerdict]>,
}

mod clip;
pub use self::clip::{
  ClipSafetyChecker, ClipSafetyCheckerBuilder, ConceptThresholds, SafetyCheckerError,
  global_checker,
};
