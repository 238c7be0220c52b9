use super::DecodeOptions;
use crate::preprocess::ImageGeometry;
use ndarray::{ArrayViewD, Axis, Ix2};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub score: f32,
    /// `[x1, y1, x2, y2]` in source image pixels.
    pub bbox: [f32; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<[f32; 2]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_prob: Option<f32>,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.) * (self.bbox[3] - self.bbox[1]).max(0.)
    }
}

fn intersection(box1: &Detection, box2: &Detection) -> f32 {
    let w = box1.bbox[2].min(box2.bbox[2]) - box1.bbox[0].max(box2.bbox[0]);
    let h = box1.bbox[3].min(box2.bbox[3]) - box1.bbox[1].max(box2.bbox[1]);
    w.max(0.) * h.max(0.)
}

fn union(box1: &Detection, box2: &Detection) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

fn iou(box1: &Detection, box2: &Detection) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Decoder for YOLO-style heads laid out as
/// `[4 + classes + 2 * landmarks (+ 1 mask), anchors]`, boxes given as
/// `cx, cy, w, h` in model input pixels.
#[derive(Debug, Clone)]
pub struct DetectionDecoder {
    pub score_threshold: f32,
    pub iou_threshold: f32,
    /// 0 keeps every detection that survives suppression.
    pub max_detections: usize,
    pub num_classes: Option<usize>,
    pub num_landmarks: usize,
    pub mask: bool,
}

impl DetectionDecoder {
    /// Decodes one slot, with `options` overriding the score threshold and
    /// detection limit for this request.
    pub fn decode(
        &self,
        slot: ArrayViewD<f32>,
        geometry: &ImageGeometry,
        options: &DecodeOptions,
    ) -> Result<Vec<Detection>, String> {
        let score_threshold = options.threshold.unwrap_or(self.score_threshold);
        let max_detections = options.limit.unwrap_or(self.max_detections);

        let output = slot
            .into_dimensionality::<Ix2>()
            .map_err(|e| format!("detection output must be 2-D per slot: {}", e))?;

        let channels = output.shape()[0];
        let landmark_channels = 2 * self.num_landmarks;
        let mask_channels = usize::from(self.mask);
        let num_classes = match self.num_classes {
            Some(n) => n,
            None => channels.saturating_sub(4 + landmark_channels + mask_channels),
        };
        if num_classes == 0 || channels != 4 + num_classes + landmark_channels + mask_channels {
            return Err(format!(
                "detection output has {} channels, expected 4 + {} classes + {} landmark values + {} mask",
                channels, num_classes, landmark_channels, mask_channels
            ));
        }
        let mask_channel = 4 + num_classes + landmark_channels;

        let mut boxes = Vec::new();
        for row in output.axis_iter(Axis(1)) {
            let (class_id, score) = row
                .iter()
                .skip(4)
                .take(num_classes)
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (index, value)| {
                    if value > best.1 {
                        (index, value)
                    } else {
                        best
                    }
                });

            if !score.is_finite() || score < score_threshold {
                continue;
            }

            let (xc, yc, w, h) = (row[0], row[1], row[2], row[3]);
            let (x1, y1) = geometry.reproject(xc - w / 2., yc - h / 2.);
            let (x2, y2) = geometry.reproject(xc + w / 2., yc + h / 2.);
            let (x1, y1) = geometry.clamp(x1, y1);
            let (x2, y2) = geometry.clamp(x2, y2);

            let landmarks = (self.num_landmarks > 0).then(|| {
                let offset = 4 + num_classes;
                (0..self.num_landmarks)
                    .map(|i| {
                        let (x, y) =
                            geometry.reproject(row[offset + 2 * i], row[offset + 2 * i + 1]);
                        let (x, y) = geometry.clamp(x, y);
                        [x, y]
                    })
                    .collect()
            });

            boxes.push(Detection {
                class_id: class_id as u32,
                score,
                bbox: [x1, y1, x2, y2],
                landmarks,
                mask_prob: self.mask.then(|| row[mask_channel]),
            });
        }

        boxes.sort_by(|box1, box2| box2.score.total_cmp(&box1.score));
        let mut result = Vec::new();

        while !boxes.is_empty() {
            let best = boxes.remove(0);
            boxes.retain(|candidate| iou(&best, candidate) < self.iou_threshold);
            result.push(best);
        }

        if max_detections > 0 && result.len() > max_detections {
            result.sort_by(|box1, box2| box2.area().total_cmp(&box1.area()));
            result.truncate(max_detections);
            result.sort_by(|box1, box2| box2.score.total_cmp(&box1.score));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn decoder() -> DetectionDecoder {
        DetectionDecoder {
            score_threshold: 0.5,
            iou_threshold: 0.45,
            max_detections: 0,
            num_classes: None,
            num_landmarks: 0,
            mask: false,
        }
    }

    fn defaults() -> DecodeOptions {
        DecodeOptions::default()
    }

    fn identity() -> ImageGeometry {
        ImageGeometry {
            width: 640,
            height: 640,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }

    /// Builds a `[channels, anchors]` head from per-anchor rows.
    fn head(rows: &[&[f32]]) -> Array2<f32> {
        let channels = rows[0].len();
        Array2::from_shape_fn((channels, rows.len()), |(c, a)| rows[a][c])
    }

    #[test]
    fn test_decode_filters_and_suppresses() {
        let output = head(&[
            &[100., 100., 50., 50., 0.9, 0.1],
            // overlaps the first box heavily with a lower score
            &[102., 101., 50., 50., 0.8, 0.2],
            &[400., 400., 40., 20., 0.2, 0.7],
            &[300., 300., 10., 10., 0.3, 0.1],
        ]);

        let detections = decoder().decode(output.view().into_dyn(), &identity(), &defaults()).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 0);
        assert_eq!(detections[0].bbox, [75., 75., 125., 125.]);
        assert_eq!(detections[1].class_id, 1);
        assert_eq!(detections[1].score, 0.7);
        assert_eq!(detections[1].bbox, [380., 390., 420., 410.]);
    }

    #[test]
    fn test_decode_reprojects_and_clamps() {
        let geometry = ImageGeometry {
            width: 100,
            height: 50,
            scale_x: 6.4,
            scale_y: 12.8,
        };
        let output = head(&[&[32., 64., 128., 256., 0.9]]);

        let detections = decoder().decode(output.view().into_dyn(), &geometry, &defaults()).unwrap();

        let [x1, y1, x2, y2] = detections[0].bbox;
        assert_eq!(x1, 0.);
        assert_eq!(y1, 0.);
        assert!((x2 - 15.).abs() < 1e-4);
        assert!((y2 - 15.).abs() < 1e-4);
    }

    #[test]
    fn test_decode_landmarks() {
        let mut decoder = decoder();
        decoder.num_landmarks = 2;
        decoder.num_classes = Some(1);
        let geometry = ImageGeometry {
            width: 320,
            height: 320,
            scale_x: 0.5,
            scale_y: 0.5,
        };
        let output = head(&[&[50., 50., 20., 20., 0.99, 45., 48., 55., 48.]]);

        let detections = decoder.decode(output.view().into_dyn(), &geometry, &defaults()).unwrap();

        assert_eq!(detections[0].bbox, [80., 80., 120., 120.]);
        assert_eq!(
            detections[0].landmarks.as_deref(),
            Some(&[[90., 96.], [110., 96.]][..])
        );
    }

    #[test]
    fn test_max_detections_keeps_largest_faces() {
        let mut decoder = decoder();
        decoder.max_detections = 1;
        let output = head(&[&[100., 100., 10., 10., 0.95], &[400., 400., 80., 80., 0.6]]);

        let detections = decoder.decode(output.view().into_dyn(), &identity(), &defaults()).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].score, 0.6);
    }

    #[test]
    fn test_channel_mismatch_is_an_error() {
        let mut decoder = decoder();
        decoder.num_classes = Some(3);
        let output = head(&[&[1., 1., 1., 1., 0.9]]);

        assert!(decoder.decode(output.view().into_dyn(), &identity(), &defaults()).is_err());

        let flat = ndarray::Array1::<f32>::zeros(5);
        assert!(decoder.decode(flat.view().into_dyn(), &identity(), &defaults()).is_err());
    }

    #[test]
    fn test_request_options_override_threshold_and_limit() {
        let output = head(&[
            &[100., 100., 10., 10., 0.95],
            &[300., 300., 60., 60., 0.55],
            &[500., 500., 30., 30., 0.4],
        ]);
        let view = output.view().into_dyn();

        assert_eq!(decoder().decode(view.clone(), &identity(), &defaults()).unwrap().len(), 2);

        let lenient = DecodeOptions {
            threshold: Some(0.3),
            limit: None,
        };
        assert_eq!(decoder().decode(view.clone(), &identity(), &lenient).unwrap().len(), 3);

        let largest_two = DecodeOptions {
            threshold: Some(0.3),
            limit: Some(2),
        };
        let detections = decoder().decode(view, &identity(), &largest_two).unwrap();
        let scores: Vec<f32> = detections.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.55, 0.4]);
    }

    #[test]
    fn test_decode_mask_probability() {
        let mut decoder = decoder();
        decoder.num_classes = Some(1);
        decoder.num_landmarks = 1;
        decoder.mask = true;
        let output = head(&[&[50., 50., 20., 20., 0.9, 45., 48., 0.8]]);

        let detections = decoder.decode(output.view().into_dyn(), &identity(), &defaults()).unwrap();

        assert_eq!(detections[0].mask_prob, Some(0.8));
        assert_eq!(detections[0].landmarks.as_deref(), Some(&[[45., 48.]][..]));

        decoder.mask = false;
        assert!(decoder.decode(output.view().into_dyn(), &identity(), &defaults()).is_err());
    }
}
