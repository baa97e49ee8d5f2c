use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

/// A decoded video frame delivered by the external detection engine.
///
/// The engine hands us two views of the same frame: the luma plane for cheap
/// brightness analysis, and an annotated JPEG (boxes and labels already drawn)
/// ready for streaming and recording. Both are shared buffers so the frame can
/// be cloned freely between the ingestion callback, the MJPEG stream and the
/// recording loop.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Monotonically increasing frame identifier
    pub id: u64,
    /// Timestamp when the frame was produced
    pub timestamp: SystemTime,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// 8-bit luma plane (width * height bytes)
    pub luma: Arc<Vec<u8>>,
    /// Annotated frame encoded as JPEG
    pub jpeg: Arc<Vec<u8>>,
}

impl VideoFrame {
    pub fn new(
        id: u64,
        timestamp: SystemTime,
        width: u32,
        height: u32,
        luma: Vec<u8>,
        jpeg: Vec<u8>,
    ) -> Self {
        Self {
            id,
            timestamp,
            width,
            height,
            luma: Arc::new(luma),
            jpeg: Arc::new(jpeg),
        }
    }

    /// Mean brightness of the luma plane, in the 0..=255 range.
    /// Empty planes read as fully dark.
    pub fn mean_luminance(&self) -> f64 {
        if self.luma.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.luma.iter().map(|&v| v as u64).sum();
        sum as f64 / self.luma.len() as f64
    }
}

/// One prediction from the external detection engine.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Free-form class label (e.g. "knife", "person")
    pub label: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Bounding box in pixel coordinates
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Holder for the most recently ingested frame.
///
/// Single writer (the ingestion callback), multiple readers (MJPEG stream,
/// recording loop). Readers take a clone under the lock rather than holding a
/// reference, since the writer replaces the frame wholesale.
#[derive(Clone, Default)]
pub struct LatestFrame {
    inner: Arc<Mutex<Option<VideoFrame>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: VideoFrame) {
        *self.inner.lock() = Some(frame);
    }

    pub fn snapshot(&self) -> Option<VideoFrame> {
        self.inner.lock().clone()
    }

    pub fn clear(&self) {
        *self.inner.lock() = None;
    }
}
