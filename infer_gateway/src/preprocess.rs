use crate::{
    config::{ColorOrder, InputConfig, ResizeMode, TensorLayout},
    error::GatewayError,
};
use image::{error::ImageError, imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array3, Axis};
use std::io::Cursor;

/// Source image size and the factors used to map it onto the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageGeometry {
    pub width: u32,
    pub height: u32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl ImageGeometry {
    /// Maps a point from model input space back onto the source image.
    pub fn reproject(&self, x: f32, y: f32) -> (f32, f32) {
        (x / self.scale_x, y / self.scale_y)
    }

    pub fn clamp(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x.clamp(0.0, self.width as f32),
            y.clamp(0.0, self.height as f32),
        )
    }
}

#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub tensor: Array3<f32>,
    pub geometry: ImageGeometry,
}

/// Turns uploaded bytes into a normalized tensor for one model variant.
///
/// Holds no mutable state; one instance is shared by every worker.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    profile: InputConfig,
}

impl ImagePreprocessor {
    pub fn new(profile: InputConfig) -> Self {
        Self { profile }
    }

    /// Shape of a single prepared tensor, without the batch axis.
    pub fn input_shape(&self) -> [usize; 3] {
        let (w, h) = (self.profile.width as usize, self.profile.height as usize);
        match self.profile.layout {
            TensorLayout::Nchw => [3, h, w],
            TensorLayout::Nhwc => [h, w, 3],
        }
    }

    pub fn prepare(&self, data: &[u8]) -> Result<PreparedInput, GatewayError> {
        if data.is_empty() {
            return Err(GatewayError::Decode("empty payload".to_string()));
        }

        let (width, height) = image_reader(data)?
            .into_dimensions()
            .map_err(map_image_error)?;
        self.check_source(width, height)?;

        let image = image_reader(data)?.decode().map_err(map_image_error)?;
        let (resized, geometry) = self.resize(&image)?;
        let tensor = self.to_tensor(&resized);

        Ok(PreparedInput { tensor, geometry })
    }

    fn check_source(&self, width: u32, height: u32) -> Result<(), GatewayError> {
        if width == 0 || height == 0 {
            return Err(GatewayError::Shape(format!(
                "image has no pixels ({}x{})",
                width, height
            )));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.profile.max_source_pixels {
            return Err(GatewayError::Shape(format!(
                "image of {}x{} exceeds the limit of {} pixels",
                width, height, self.profile.max_source_pixels
            )));
        }
        if width.min(height) < self.profile.min_source_side {
            return Err(GatewayError::Shape(format!(
                "image of {}x{} is smaller than the minimum side of {}",
                width, height, self.profile.min_source_side
            )));
        }
        Ok(())
    }

    fn resize(&self, image: &DynamicImage) -> Result<(DynamicImage, ImageGeometry), GatewayError> {
        let (width, height) = image.dimensions();
        let (target_w, target_h) = (self.profile.width, self.profile.height);

        match self.profile.resize {
            ResizeMode::Stretch => {
                let resized = image.resize_exact(target_w, target_h, FilterType::CatmullRom);
                let geometry = ImageGeometry {
                    width,
                    height,
                    scale_x: target_w as f32 / width as f32,
                    scale_y: target_h as f32 / height as f32,
                };
                Ok((resized, geometry))
            }
            ResizeMode::Letterbox => {
                let scale = (target_w as f32 / width as f32).min(target_h as f32 / height as f32);
                let new_w = ((width as f32 * scale).round() as u32).min(target_w);
                let new_h = ((height as f32 * scale).round() as u32).min(target_h);
                if new_w == 0 || new_h == 0 {
                    return Err(GatewayError::Shape(format!(
                        "image of {}x{} collapses to {}x{} when fitted into {}x{}",
                        width, height, new_w, new_h, target_w, target_h
                    )));
                }
                let resized = image.resize_exact(new_w, new_h, FilterType::CatmullRom);
                let geometry = ImageGeometry {
                    width,
                    height,
                    scale_x: scale,
                    scale_y: scale,
                };
                Ok((resized, geometry))
            }
        }
    }

    fn to_tensor(&self, image: &DynamicImage) -> Array3<f32> {
        let profile = &self.profile;
        let channel_axis = match profile.layout {
            TensorLayout::Nchw => Axis(0),
            TensorLayout::Nhwc => Axis(2),
        };

        // letterbox padding keeps the value of a black pixel
        let mut input = Array3::<f32>::zeros(self.input_shape());
        for c in 0..3 {
            let black = (0.0 - profile.mean[c]) / profile.std[c];
            input.index_axis_mut(channel_axis, c).fill(black);
        }

        let rgb = image.to_rgb8();
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let ordered = match profile.color_order {
                ColorOrder::Rgb => [r, g, b],
                ColorOrder::Bgr => [b, g, r],
            };
            let (x, y) = (x as usize, y as usize);
            for (c, value) in ordered.into_iter().enumerate() {
                let normalized = ((value as f32) / 255. - profile.mean[c]) / profile.std[c];
                match profile.layout {
                    TensorLayout::Nchw => input[[c, y, x]] = normalized,
                    TensorLayout::Nhwc => input[[y, x, c]] = normalized,
                }
            }
        }

        input
    }
}

fn image_reader(data: &[u8]) -> Result<image::ImageReader<Cursor<&[u8]>>, GatewayError> {
    let reader = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| GatewayError::Decode(format!("Error reading image: {}", e)))?;
    if reader.format().is_none() {
        return Err(GatewayError::Decode("unrecognized image format".to_string()));
    }
    Ok(reader)
}

fn map_image_error(err: ImageError) -> GatewayError {
    match err {
        ImageError::Limits(e) => GatewayError::Shape(format!("image exceeds decoder limits: {}", e)),
        other => GatewayError::Decode(format!("Error decoding image: {}", other)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    pub fn encode_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb(color));
        let mut image_data: Vec<u8> = Vec::new();
        let mut cursor = Cursor::new(&mut image_data);
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        image_data
    }

    pub fn profile(width: u32, height: u32) -> InputConfig {
        InputConfig {
            width,
            height,
            resize: ResizeMode::Stretch,
            color_order: ColorOrder::Rgb,
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
            layout: TensorLayout::Nchw,
            max_source_pixels: 4096 * 4096,
            min_source_side: 1,
        }
    }

    #[test]
    fn test_prepare_stretches_to_model_input() {
        let preprocessor = ImagePreprocessor::new(profile(640, 640));
        let prepared = preprocessor.prepare(&encode_png(100, 50, [255, 0, 0])).unwrap();

        assert_eq!(prepared.tensor.shape(), &[3, 640, 640]);
        assert_eq!(prepared.geometry.width, 100);
        assert_eq!(prepared.geometry.height, 50);
        assert_eq!(prepared.geometry.scale_x, 6.4);
        assert_eq!(prepared.geometry.scale_y, 12.8);
        assert!((prepared.tensor[[0, 320, 320]] - 1.0).abs() < 1e-2);
        assert!(prepared.tensor[[1, 320, 320]].abs() < 1e-2);
    }

    #[test]
    fn test_letterbox_pads_bottom_and_keeps_aspect() {
        let mut config = profile(64, 64);
        config.resize = ResizeMode::Letterbox;
        config.mean = [0.5, 0.5, 0.5];
        config.std = [0.5, 0.5, 0.5];
        let preprocessor = ImagePreprocessor::new(config);

        let prepared = preprocessor.prepare(&encode_png(200, 100, [255, 255, 255])).unwrap();

        assert_eq!(prepared.geometry.scale_x, 0.32);
        assert_eq!(prepared.geometry.scale_y, 0.32);
        // white content in the top half, normalized black padding below it
        assert!((prepared.tensor[[0, 10, 10]] - 1.0).abs() < 1e-2);
        assert!((prepared.tensor[[2, 60, 10]] + 1.0).abs() < 1e-6);
        let (x, y) = prepared.geometry.reproject(32.0, 16.0);
        assert!((x - 100.0).abs() < 1e-3);
        assert!((y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_bgr_order_and_nhwc_layout() {
        let mut config = profile(8, 8);
        config.color_order = ColorOrder::Bgr;
        config.layout = TensorLayout::Nhwc;
        let preprocessor = ImagePreprocessor::new(config);

        let prepared = preprocessor.prepare(&encode_png(8, 8, [255, 0, 0])).unwrap();

        assert_eq!(prepared.tensor.shape(), &[8, 8, 3]);
        assert!(prepared.tensor[[4, 4, 0]].abs() < 1e-2);
        assert!((prepared.tensor[[4, 4, 2]] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_corrupt_and_empty_payloads_are_decode_errors() {
        let preprocessor = ImagePreprocessor::new(profile(32, 32));

        let err = preprocessor.prepare(&[]).unwrap_err();
        assert_eq!(err.kind(), "decode_error");

        let err = preprocessor.prepare(b"definitely not an image").unwrap_err();
        assert_eq!(err.kind(), "decode_error");

        let mut truncated = encode_png(16, 16, [1, 2, 3]);
        truncated.truncate(truncated.len() / 2);
        let err = preprocessor.prepare(&truncated).unwrap_err();
        assert_eq!(err.kind(), "decode_error");
    }

    #[test]
    fn test_source_limits_are_shape_errors() {
        let mut config = profile(32, 32);
        config.max_source_pixels = 100;
        let err = ImagePreprocessor::new(config)
            .prepare(&encode_png(20, 20, [0, 0, 0]))
            .unwrap_err();
        assert_eq!(err.kind(), "shape_error");

        let mut config = profile(32, 32);
        config.min_source_side = 10;
        let err = ImagePreprocessor::new(config)
            .prepare(&encode_png(40, 4, [0, 0, 0]))
            .unwrap_err();
        assert_eq!(err.kind(), "shape_error");
    }

    #[test]
    fn test_letterbox_rejects_degenerate_aspect() {
        let mut config = profile(16, 16);
        config.resize = ResizeMode::Letterbox;
        let err = ImagePreprocessor::new(config)
            .prepare(&encode_png(400, 1, [0, 0, 0]))
            .unwrap_err();
        assert_eq!(err.kind(), "shape_error");
    }
}
