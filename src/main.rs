// 该文件是 雾里看花 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use image::{ImageReader, RgbImage};

use wulikanhua::FromUrl;
use wulikanhua::batch::{NchwBatch, RGB_CHANNELS, image_to_nchw};
use wulikanhua::censor::{CensorOptions, Disposition, censor_batch};
use wulikanhua::checker::ClipSafetyCheckerBuilder;

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  println!("雾里看花 图像安全过滤");
  println!("====================");
  println!("模型来源: {}", args.model);
  println!("输出目录: {}", args.output);
  println!("灵敏度调整: {}", args.adjustment);
  println!("模糊半径: {}", args.blur);
  println!();

  // 读取输入图像
  println!("正在读取输入图像...");
  let mut images = Vec::with_capacity(args.inputs.len());
  for path in &args.inputs {
    let image = ImageReader::open(path)
      .with_context(|| format!("无法打开图像文件: {}", path))?
      .decode()
      .with_context(|| format!("无法解码图像文件: {}", path))?
      .into_rgb8();
    images.push(image);
  }

  let width = images[0].width();
  let height = images[0].height();
  for (path, image) in args.inputs.iter().zip(&images) {
    anyhow::ensure!(
      image.width() == width && image.height() == height,
      "输入图像尺寸不一致: {} 为 {}x{}, 期望 {}x{}",
      path,
      image.width(),
      image.height(),
      width,
      height
    );
  }
  println!("已读取 {} 张图像 ({}x{})", images.len(), width, height);

  // 过滤关闭时不加载模型，批次原样写出
  if args.disable {
    println!();
    println!("过滤已关闭，批次原样通过");
    save_images(&args.output, &args.inputs, &images)?;
    return Ok(());
  }

  // 组装 NCHW 浮点批
  let mut data = Vec::with_capacity(images.len() * RGB_CHANNELS * (width * height) as usize);
  for image in &images {
    data.extend(image_to_nchw(image));
  }
  let batch = NchwBatch::from_vec(data, images.len(), height as usize, width as usize)?;

  // 加载安全检查器
  println!("正在加载安全检查模型...");
  let checker = ClipSafetyCheckerBuilder::from_url(&args.model)?.build()?;
  println!("模型加载完成");

  // 处置
  println!();
  println!("开始处置...");
  let options = CensorOptions::default()
    .with_adjustment(args.adjustment)
    .with_blur_radius(args.blur);
  let (output, report) = censor_batch(&checker, &batch, &options)?;

  for (index, (path, item)) in args.inputs.iter().zip(report.items()).enumerate() {
    match item {
      Disposition::Passed => println!("  [{}] {}: 安全", index, path),
      Disposition::Blurred { radius } => {
        println!("  [{}] {}: 不当内容，已模糊 (半径 {})", index, path, radius)
      }
      Disposition::Masked => println!("  [{}] {}: 不当内容，模糊被禁用", index, path),
      Disposition::BlurFailed { reason } => {
        println!("  [{}] {}: 不当内容，模糊失败: {}", index, path, reason)
      }
    }
  }

  // 写出结果
  let rendered = output.to_nhwc().to_images();
  save_images(&args.output, &args.inputs, &rendered)?;

  println!();
  println!("处置完成!");
  println!("总图像数: {}", report.len());
  println!("命中数: {}", report.flagged_count());
  if report.failed_count() > 0 {
    println!("模糊失败数: {}", report.failed_count());
  }

  Ok(())
}

/// 把图像写入输出目录，文件名带批内序号前缀。
fn save_images(output_dir: &str, paths: &[String], images: &[RgbImage]) -> Result<()> {
  std::fs::create_dir_all(output_dir)
    .with_context(|| format!("无法创建输出目录: {}", output_dir))?;

  for (index, (path, image)) in paths.iter().zip(images.iter()).enumerate() {
    let name = Path::new(path)
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| format!("image-{}.png", index));
    let target = Path::new(output_dir).join(format!("{:02}-{}", index, name));
    image
      .save(&target)
      .with_context(|| format!("无法写出图像: {}", target.display()))?;
  }

  Ok(())
}
