// 该文件是 雾里看花 项目的一部分。
// src/args.rs - 项目参数配置
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

use clap::Parser;
use url::Url;

/// 雾里看花 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像文件，要求尺寸一致
  /// 支持格式: *.jpg, *.jpeg, *.png
  #[arg(value_name = "IMAGE", required = true)]
  pub inputs: Vec<String>,

  /// 安全检查模型来源
  /// 支持格式:
  /// - 本地目录: safety:models/safety-checker
  /// - 模型仓库: safety+hub:CompVis/stable-diffusion-safety-checker
  #[arg(
    long,
    value_name = "MODEL",
    default_value = "safety+hub:CompVis/stable-diffusion-safety-checker"
  )]
  pub model: Url,

  /// 输出目录
  #[arg(long, default_value = "censored", value_name = "DIR")]
  pub output: String,

  /// 灵敏度调整 (-0.5 - 0.5)，正值更严格
  #[arg(long, default_value = "0.0", value_name = "ADJUSTMENT")]
  pub adjustment: f32,

  /// 高斯模糊半径 (0 - 100)，0 表示不模糊
  #[arg(long, default_value = "50", value_name = "RADIUS")]
  pub blur: f32,

  /// 关闭过滤，批次原样通过
  #[arg(long)]
  pub disable: bool,
}
