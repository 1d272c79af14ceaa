//! Post-decode content gate.

use image::DynamicImage;
use tracing::warn;

use crate::error::Result;
use crate::model::NsfwClassifier;

/// Runs decoded images past a classifier before they reach disk.
pub struct SafetyGate {
    classifier: Box<dyn NsfwClassifier>,
    enabled: bool,
}

impl SafetyGate {
    pub fn new(classifier: Box<dyn NsfwClassifier>, enabled: bool) -> Self {
        Self {
            classifier,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the subset of `images` that pass the check. With the gate
    /// disabled every image passes.
    pub fn filter(&self, images: Vec<DynamicImage>) -> Result<Vec<DynamicImage>> {
        if !self.enabled {
            return Ok(images);
        }
        let total = images.len();
        let mut kept = Vec::with_capacity(total);
        for image in images {
            if self.classifier.classify(&image)? {
                continue;
            }
            kept.push(image);
        }
        if kept.len() < total {
            warn!(
                withheld = total - kept.len(),
                total, "images withheld by the content check"
            );
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubClassifier;

    fn blank() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::new(16, 16))
    }

    #[test]
    fn permissive_classifier_keeps_everything() {
        let gate = SafetyGate::new(Box::new(StubClassifier::permissive()), true);
        let kept = gate.filter(vec![blank(), blank()]).unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn rejecting_classifier_drops_everything() {
        let gate = SafetyGate::new(Box::new(StubClassifier::rejecting()), true);
        let kept = gate.filter(vec![blank()]).unwrap();
        assert!(kept.is_empty());
    }

    #[test]
    fn disabled_gate_skips_classification() {
        let gate = SafetyGate::new(Box::new(StubClassifier::rejecting()), false);
        let kept = gate.filter(vec![blank()]).unwrap();
        assert_eq!(kept.len(), 1);
    }
}
