// 该文件是 雾里看花 项目的一部分。
// src/batch.rs - NCHW/NHWC 像素批定义
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

use image::{Rgb, RgbImage};
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum BatchError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("图像索引越界: 索引 {index}, 批大小 {count}")]
  IndexOutOfRange { index: usize, count: usize },
}

/// NCHW 浮点像素批，逐像素取值范围 [0, 1]。
///
/// 每张图像占据一段连续的平面数据，布局为
/// `索引 = ((n * 3 + c) * H + y) * W + x`。
#[derive(Debug, Clone, PartialEq)]
pub struct NchwBatch {
  data: Box<[f32]>,
  count: usize,
  height: usize,
  width: usize,
}

impl NchwBatch {
  pub fn with_shape(count: usize, height: usize, width: usize) -> Self {
    let size = count * RGB_CHANNELS * height * width;
    Self {
      data: vec![0f32; size].into_boxed_slice(),
      count,
      height,
      width,
    }
  }

  pub fn from_vec(
    data: Vec<f32>,
    count: usize,
    height: usize,
    width: usize,
  ) -> Result<Self, BatchError> {
    let expected = count * RGB_CHANNELS * height * width;
    if data.len() != expected {
      return Err(BatchError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      count,
      height,
      width,
    })
  }

  pub fn len(&self) -> usize {
    self.count
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  fn plane_len(&self) -> usize {
    RGB_CHANNELS * self.height * self.width
  }

  /// 取第 `index` 张图像的连续平面数据。
  pub fn image(&self, index: usize) -> Result<&[f32], BatchError> {
    if index >= self.count {
      return Err(BatchError::IndexOutOfRange {
        index,
        count: self.count,
      });
    }

    let plane = self.plane_len();
    Ok(&self.data[index * plane..(index + 1) * plane])
  }

  /// 用给定平面覆盖第 `index` 张图像。
  pub fn replace_image(&mut self, index: usize, plane: &[f32]) -> Result<(), BatchError> {
    if index >= self.count {
      return Err(BatchError::IndexOutOfRange {
        index,
        count: self.count,
      });
    }

    let expected = self.plane_len();
    if plane.len() != expected {
      return Err(BatchError::LengthMismatch {
        expected,
        actual: plane.len(),
      });
    }

    self.data[index * expected..(index + 1) * expected].copy_from_slice(plane);
    Ok(())
  }

  /// 转换为 NHWC 布局，纯排列不改变任何像素值。
  pub fn to_nhwc(&self) -> NhwcBatch {
    let mut target = NhwcBatch::with_shape(self.count, self.height, self.width);

    {
      let slice = target.data.as_mut();
      for n in 0..self.count {
        for c in 0..RGB_CHANNELS {
          for y in 0..self.height {
            for x in 0..self.width {
              let src = ((n * RGB_CHANNELS + c) * self.height + y) * self.width + x;
              let dst = ((n * self.height + y) * self.width + x) * RGB_CHANNELS + c;
              slice[dst] = self.data[src];
            }
          }
        }
      }
    }

    target
  }
}

/// NHWC 浮点像素批，逐像素取值范围 [0, 1]。
///
/// 布局为 `索引 = ((n * H + y) * W + x) * 3 + c`。
#[derive(Debug, Clone, PartialEq)]
pub struct NhwcBatch {
  data: Box<[f32]>,
  count: usize,
  height: usize,
  width: usize,
}

impl NhwcBatch {
  pub fn with_shape(count: usize, height: usize, width: usize) -> Self {
    let size = count * RGB_CHANNELS * height * width;
    Self {
      data: vec![0f32; size].into_boxed_slice(),
      count,
      height,
      width,
    }
  }

  pub fn from_vec(
    data: Vec<f32>,
    count: usize,
    height: usize,
    width: usize,
  ) -> Result<Self, BatchError> {
    let expected = count * RGB_CHANNELS * height * width;
    if data.len() != expected {
      return Err(BatchError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      count,
      height,
      width,
    })
  }

  pub fn len(&self) -> usize {
    self.count
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn as_mut_slice(&mut self) -> &mut [f32] {
    &mut self.data
  }

  /// 转换为 NCHW 布局，纯排列不改变任何像素值。
  pub fn to_nchw(&self) -> NchwBatch {
    let mut target = NchwBatch::with_shape(self.count, self.height, self.width);

    {
      let slice = target.data.as_mut();
      for n in 0..self.count {
        for y in 0..self.height {
          for x in 0..self.width {
            for c in 0..RGB_CHANNELS {
              let src = ((n * self.height + y) * self.width + x) * RGB_CHANNELS + c;
              let dst = ((n * RGB_CHANNELS + c) * self.height + y) * self.width + x;
              slice[dst] = self.data[src];
            }
          }
        }
      }
    }

    target
  }

  /// 把每张图像渲染为 8 位整数图像，用于模糊处理与文件输出。
  ///
  /// 量化方式为 `round(x * 255)`，并截断到 [0, 255]。
  pub fn to_images(&self) -> Vec<RgbImage> {
    let mut images = Vec::with_capacity(self.count);

    for n in 0..self.count {
      let mut image = RgbImage::new(self.width as u32, self.height as u32);
      for y in 0..self.height {
        for x in 0..self.width {
          let base = ((n * self.height + y) * self.width + x) * RGB_CHANNELS;
          let pixel = Rgb([
            quantize(self.data[base]),
            quantize(self.data[base + 1]),
            quantize(self.data[base + 2]),
          ]);
          image.put_pixel(x as u32, y as u32, pixel);
        }
      }
      images.push(image);
    }

    images
  }
}

fn quantize(value: f32) -> u8 {
  (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// 把 8 位整数图像还原为单张 NCHW 浮点平面，取值 `x / 255`。
pub fn image_to_nchw(image: &RgbImage) -> Vec<f32> {
  let width = image.width() as usize;
  let height = image.height() as usize;
  let mut plane = vec![0f32; RGB_CHANNELS * height * width];

  for c in 0..RGB_CHANNELS {
    for y in 0..height {
      for x in 0..width {
        let pixel = image.get_pixel(x as u32, y as u32);
        plane[(c * height + y) * width + x] = pixel[c] as f32 / 255.0;
      }
    }
  }

  plane
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_batch(count: usize, height: usize, width: usize) -> NchwBatch {
    let size = count * RGB_CHANNELS * height * width;
    let data = (0..size).map(|i| i as f32 / size as f32).collect();
    NchwBatch::from_vec(data, count, height, width).unwrap()
  }

  #[test]
  fn from_vec_rejects_wrong_length() {
    let result = NchwBatch::from_vec(vec![0.0; 10], 1, 2, 2);
    assert!(matches!(
      result,
      Err(BatchError::LengthMismatch {
        expected: 12,
        actual: 10
      })
    ));
  }

  #[test]
  fn layout_round_trip_is_exact() {
    let batch = sample_batch(3, 4, 5);
    let round_trip = batch.to_nhwc().to_nchw();
    assert_eq!(batch, round_trip);
  }

  #[test]
  fn nhwc_conversion_permutes_channels() {
    // 单像素图像: NCHW 下三个通道依次排列
    let batch = NchwBatch::from_vec(vec![0.1, 0.5, 0.9], 1, 1, 1).unwrap();
    let nhwc = batch.to_nhwc();
    assert_eq!(nhwc.as_slice(), &[0.1, 0.5, 0.9]);

    // 2x1 双像素: NCHW 为 [r0 r1 g0 g1 b0 b1]，NHWC 为 [r0 g0 b0 r1 g1 b1]
    let batch = NchwBatch::from_vec(vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5], 1, 1, 2).unwrap();
    let nhwc = batch.to_nhwc();
    assert_eq!(nhwc.as_slice(), &[0.0, 0.2, 0.4, 0.1, 0.3, 0.5]);
  }

  #[test]
  fn to_images_quantizes_and_clamps() {
    let batch =
      NhwcBatch::from_vec(vec![0.0, 0.5, 1.0, -0.2, 1.4, 0.25], 1, 1, 2).unwrap();
    let images = batch.to_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].get_pixel(0, 0).0, [0, 128, 255]);
    assert_eq!(images[0].get_pixel(1, 0).0, [0, 255, 64]);
  }

  #[test]
  fn image_round_trip_within_rounding() {
    let batch = sample_batch(1, 3, 3);
    let images = batch.to_nhwc().to_images();
    let restored = image_to_nchw(&images[0]);

    for (a, b) in batch.image(0).unwrap().iter().zip(restored.iter()) {
      assert!((a - b).abs() <= 0.5 / 255.0 + f32::EPSILON);
    }
  }

  #[test]
  fn replace_image_checks_shape() {
    let mut batch = sample_batch(2, 2, 2);
    let plane = vec![0.5; RGB_CHANNELS * 4];
    batch.replace_image(1, &plane).unwrap();
    assert_eq!(batch.image(1).unwrap(), plane.as_slice());
    assert_ne!(batch.image(0).unwrap(), plane.as_slice());

    assert!(matches!(
      batch.replace_image(1, &[0.0; 3]),
      Err(BatchError::LengthMismatch { .. })
    ));
    assert!(matches!(
      batch.replace_image(2, &plane),
      Err(BatchError::IndexOutOfRange { .. })
    ));
  }
}
